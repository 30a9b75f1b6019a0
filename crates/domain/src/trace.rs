use serde::Serialize;

/// Structured trace events emitted by the device client crates.
///
/// Developer keys are always masked before they reach an event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ClientCreated {
        dev_key: String,
        dev_sn: String,
    },
    ClientReused {
        dev_key: String,
        dev_sn: String,
    },
    PhaseChanged {
        dev_sn: String,
        from: String,
        to: String,
        trigger: String,
    },
    ConnectorFailed {
        dev_sn: String,
        op: String,
        trigger: String,
        error: String,
    },
    RetryArmed {
        dev_sn: String,
        delay_secs: u64,
        replaced: bool,
    },
    RetryCancelled {
        dev_sn: String,
        reason: String,
    },
    RetryFired {
        dev_sn: String,
    },
    RetrySkipped {
        dev_sn: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "cs_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let ev = TraceEvent::RetryArmed {
            dev_sn: "sn-1".into(),
            delay_secs: 5,
            replaced: true,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "RetryArmed");
        assert_eq!(v["delay_secs"], 5);
        assert_eq!(v["replaced"], true);
    }
}
