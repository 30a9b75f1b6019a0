use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the reference WebSocket connector shipped with the
/// `cs-hello-client` binary.  The lifecycle core never reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "d_url")]
    pub url: String,
    /// Upper bound on a single session open.
    #[serde(default = "d_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Interval between keepalive pings on an open session.
    #[serde(default = "d_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            open_timeout_secs: d_open_timeout_secs(),
            keepalive_secs: d_keepalive_secs(),
        }
    }
}

fn d_url() -> String {
    "ws://localhost:3210/v1/devices/ws".into()
}

fn d_open_timeout_secs() -> u64 {
    10
}

fn d_keepalive_secs() -> u64 {
    30
}
