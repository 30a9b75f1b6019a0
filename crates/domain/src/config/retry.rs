use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do when a retry is requested while another one is pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Cancel the pending retry and arm the new one (last caller wins).
    #[default]
    Replace,
    /// Keep the pending retry and ignore the new request.
    KeepPending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    /// Run the backoff supervisor that re-arms retries after failed starts.
    #[serde(default = "d_true")]
    pub supervise: bool,
    #[serde(default = "d_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "d_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "d_backoff_factor")]
    pub backoff_factor: f64,
    /// `0` means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            supervise: true,
            initial_delay_secs: d_initial_delay_secs(),
            max_delay_secs: d_max_delay_secs(),
            backoff_factor: d_backoff_factor(),
            max_attempts: 0,
        }
    }
}

fn d_true() -> bool {
    true
}

fn d_initial_delay_secs() -> u64 {
    1
}

fn d_max_delay_secs() -> u64 {
    60
}

fn d_backoff_factor() -> f64 {
    2.0
}
