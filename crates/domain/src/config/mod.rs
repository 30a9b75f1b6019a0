mod connector;
mod identity;
mod logging;
mod retry;

pub use connector::*;
pub use identity::*;
pub use logging::*;
pub use retry::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load a config file.  A missing file yields the defaults so a fresh
    /// install can run with environment variables alone.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ClientConfig {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        // ── identity ─────────────────────────────────────────────────
        if let Some(key) = &self.identity.dev_key {
            if key.trim().is_empty() {
                issues.push(ConfigIssue::error(
                    "identity.dev_key",
                    "must not be empty when set",
                ));
            }
        } else if self.identity.dev_key_env.trim().is_empty() {
            issues.push(ConfigIssue::error(
                "identity.dev_key_env",
                "no dev_key configured and no env var to read it from",
            ));
        }
        if matches!(&self.identity.dev_sn, Some(sn) if sn.trim().is_empty()) {
            issues.push(ConfigIssue::error(
                "identity.dev_sn",
                "must not be empty when set",
            ));
        }

        // ── retry ────────────────────────────────────────────────────
        if self.retry.initial_delay_secs > self.retry.max_delay_secs {
            issues.push(ConfigIssue::error(
                "retry.initial_delay_secs",
                format!(
                    "initial delay ({}s) exceeds max delay ({}s)",
                    self.retry.initial_delay_secs, self.retry.max_delay_secs
                ),
            ));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            issues.push(ConfigIssue::error(
                "retry.backoff_factor",
                "must be >= 1.0",
            ));
        }
        if self.retry.supervise && self.retry.max_attempts == 0 {
            issues.push(ConfigIssue::warning(
                "retry.max_attempts",
                "unlimited retries; the supervisor will never give up",
            ));
        }

        // ── connector ────────────────────────────────────────────────
        let url = self.connector.url.trim();
        if url.is_empty() {
            issues.push(ConfigIssue::error("connector.url", "must not be empty"));
        } else if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            issues.push(ConfigIssue::error(
                "connector.url",
                format!("expected a ws:// or wss:// URL, got {url}"),
            ));
        } else if url.starts_with("ws://") && !is_loopback_url(url) {
            issues.push(ConfigIssue::warning(
                "connector.url",
                "plain ws:// to a non-local host sends the developer key unencrypted",
            ));
        }
        if self.connector.open_timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "connector.open_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.connector.keepalive_secs == 0 {
            issues.push(ConfigIssue::error(
                "connector.keepalive_secs",
                "must be greater than zero",
            ));
        }

        issues
    }

    /// Whether [`validate`](Self::validate) reports any error-level issue.
    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

fn is_loopback_url(url: &str) -> bool {
    let rest = url.trim_start_matches("ws://");
    rest.starts_with("localhost") || rest.starts_with("127.0.0.1") || rest.starts_with("[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let cfg = ClientConfig::default();
        assert!(!cfg.has_errors(), "{:?}", cfg.validate());
    }

    #[test]
    fn empty_dev_key_is_an_error() {
        let mut cfg = ClientConfig::default();
        cfg.identity.dev_key = Some("   ".into());
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "identity.dev_key" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn inverted_delays_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.retry.initial_delay_secs = 120;
        cfg.retry.max_delay_secs = 60;
        assert!(cfg.has_errors());
    }

    #[test]
    fn nan_backoff_factor_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.retry.backoff_factor = f64::NAN;
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.field == "retry.backoff_factor"));
    }

    #[test]
    fn http_url_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.connector.url = "http://example.com".into();
        assert!(cfg.has_errors());
    }

    #[test]
    fn remote_plain_ws_only_warns() {
        let mut cfg = ClientConfig::default();
        cfg.connector.url = "ws://devices.example.com/ws".into();
        let issues = cfg.validate();
        assert!(!cfg.has_errors());
        assert!(issues
            .iter()
            .any(|i| i.field == "connector.url" && i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn issue_display_is_tagged() {
        let issue = ConfigIssue::warning("retry.max_attempts", "unlimited");
        assert_eq!(issue.to_string(), "[WARN] retry.max_attempts: unlimited");
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClientConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.identity.dev_key_env, "CASTAR_DEV_KEY");
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("castar.toml");
        std::fs::write(
            &path,
            "[identity]\ndev_key = \"k-123\"\n\n[retry]\npolicy = \"keep_pending\"\n",
        )
        .unwrap();
        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.identity.dev_key.as_deref(), Some("k-123"));
        assert_eq!(cfg.retry.policy, RetryPolicy::KeepPending);
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[identity\ndev_key = ").unwrap();
        let err = ClientConfig::load(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Toml(_)));
    }
}
