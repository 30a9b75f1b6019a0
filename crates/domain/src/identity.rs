//! Device identity: the developer key and the stable device serial.
//!
//! Both values are fixed for the life of the process.  The developer key is
//! supplied by the integrator (explicitly, via config, or via env); the
//! serial is either pre-provisioned or derived from the host name so that
//! the same machine reports the same serial across restarts.

use sha2::{Digest, Sha256};

use crate::config::IdentityConfig;
use crate::error::{Error, Result};

const MAX_DEV_KEY_LEN: usize = 256;
const DERIVED_SN_PREFIX: &str = "sn-";
const DERIVED_SN_HEX_LEN: usize = 24;

/// Supplies the developer key and device serial.
///
/// Implementations are pure accessors over data fixed at construction.
pub trait DeviceIdentity: Send + Sync + 'static {
    fn dev_key(&self) -> &str;
    fn dev_sn(&self) -> &str;
}

/// Identity whose values are resolved once and then held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    dev_key: String,
    dev_sn: String,
}

impl StaticIdentity {
    /// Build from explicit values, validating both.
    pub fn new(dev_key: impl Into<String>, dev_sn: impl Into<String>) -> Result<Self> {
        let dev_key = validate_dev_key(dev_key.into())?;
        let dev_sn = dev_sn.into();
        if dev_sn.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "device serial must not be empty".into(),
            ));
        }
        Ok(Self { dev_key, dev_sn })
    }

    /// Resolve an identity from the ambient configuration.
    ///
    /// Developer key: `explicit_key` → `cfg.dev_key` → `$cfg.dev_key_env`.
    /// Serial: `cfg.dev_sn` → `$cfg.dev_sn_env` → derived from host + key.
    pub fn resolve(cfg: &IdentityConfig, explicit_key: Option<&str>) -> Result<Self> {
        let dev_key = explicit_key
            .map(str::to_owned)
            .or_else(|| cfg.dev_key.clone())
            .or_else(|| env_non_empty(&cfg.dev_key_env))
            .ok_or(Error::MissingDevKey)?;
        let dev_key = validate_dev_key(dev_key)?;

        let dev_sn = match cfg.dev_sn.clone().or_else(|| env_non_empty(&cfg.dev_sn_env)) {
            Some(sn) => sn,
            None => derive_serial(&host_name(), &dev_key),
        };

        Self::new(dev_key, dev_sn)
    }
}

impl DeviceIdentity for StaticIdentity {
    fn dev_key(&self) -> &str {
        &self.dev_key
    }

    fn dev_sn(&self) -> &str {
        &self.dev_sn
    }
}

/// Deterministic serial for a host/key pair.
pub fn derive_serial(host: &str, dev_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(dev_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{DERIVED_SN_PREFIX}{}", &digest[..DERIVED_SN_HEX_LEN])
}

/// Mask a secret for logs: keeps the first four characters.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".into()
    } else {
        format!("{visible}****")
    }
}

fn validate_dev_key(key: String) -> Result<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(Error::MissingDevKey);
    }
    if trimmed.len() > MAX_DEV_KEY_LEN {
        return Err(Error::InvalidConfiguration(format!(
            "developer key exceeds {MAX_DEV_KEY_LEN} bytes"
        )));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidConfiguration(
            "developer key contains whitespace or control characters".into(),
        ));
    }
    Ok(trimmed.to_owned())
}

fn env_non_empty(var: &str) -> Option<String> {
    if var.is_empty() {
        return None;
    }
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Best-effort host name for serial derivation.
fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_owned())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
