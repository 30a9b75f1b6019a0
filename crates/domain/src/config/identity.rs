use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the developer key and device serial come from.
///
/// Explicit values win; otherwise the named environment variables are
/// consulted.  When no serial is available at all, one is derived from the
/// host name and developer key (see [`crate::identity`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub dev_key: Option<String>,
    /// Environment variable holding the developer key.
    #[serde(default = "d_dev_key_env")]
    pub dev_key_env: String,
    #[serde(default)]
    pub dev_sn: Option<String>,
    /// Environment variable holding a pre-provisioned device serial.
    #[serde(default = "d_dev_sn_env")]
    pub dev_sn_env: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            dev_key: None,
            dev_key_env: d_dev_key_env(),
            dev_sn: None,
            dev_sn_env: d_dev_sn_env(),
        }
    }
}

fn d_dev_key_env() -> String {
    "CASTAR_DEV_KEY".into()
}

fn d_dev_sn_env() -> String {
    "CASTAR_DEV_SN".into()
}
