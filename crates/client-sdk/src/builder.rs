//! Builder pattern for constructing a [`ClientInstance`].

use std::sync::Arc;

use cs_domain::config::{ClientConfig, IdentityConfig, RetryPolicy};
use cs_domain::identity::mask_secret;
use cs_domain::trace::TraceEvent;
use cs_domain::{DeviceIdentity, StaticIdentity};

use crate::connector::Connector;
use crate::lifecycle::ClientInstance;
use crate::registry::InstanceRegistry;
use crate::types::ClientError;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Fluent builder for [`ClientInstance`].
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use cs_client_sdk::{ClientBuilder, Connector};
/// # fn demo(connector: Arc<dyn Connector>) -> Result<(), cs_client_sdk::ClientError> {
/// let client = ClientBuilder::new()
///     .dev_key("dk-0123456789")
///     .connector(connector)
///     .create()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    dev_key: Option<String>,
    identity_config: IdentityConfig,
    identity: Option<Arc<dyn DeviceIdentity>>,
    connector: Option<Arc<dyn Connector>>,
    retry_policy: RetryPolicy,
    event_capacity: usize,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            dev_key: None,
            identity_config: IdentityConfig::default(),
            identity: None,
            connector: None,
            retry_policy: RetryPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Seed identity sources and retry policy from a loaded config.
    pub fn config(mut self, cfg: &ClientConfig) -> Self {
        self.identity_config = cfg.identity.clone();
        self.retry_policy = cfg.retry.policy;
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Set the developer key.  Takes precedence over config and env.
    pub fn dev_key(mut self, key: impl Into<String>) -> Self {
        self.dev_key = Some(key.into());
        self
    }

    /// Same as [`dev_key`](Self::dev_key) but accepts an absent key, in
    /// which case it is resolved from config or env.
    pub fn dev_key_opt(mut self, key: Option<impl Into<String>>) -> Self {
        self.dev_key = key.map(Into::into);
        self
    }

    /// Use a pre-provisioned device serial instead of deriving one.
    pub fn dev_sn(mut self, sn: impl Into<String>) -> Self {
        self.identity_config.dev_sn = Some(sn.into());
        self
    }

    /// Supply a custom identity provider.  Skips config/env resolution.
    pub fn identity(mut self, identity: Arc<dyn DeviceIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Set the session transport (required).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the pending-retry policy (default: replace).
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Buffer size of the event broadcast channel (default 64).
    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    /// Whether a key was given explicitly, through config, or through a
    /// custom identity.  A builder that names none defers to whichever
    /// client is already registered.
    pub(crate) fn names_key(&self) -> bool {
        self.dev_key.is_some() || self.identity.is_some() || self.identity_config.dev_key.is_some()
    }

    /// Resolve the identity this builder would use.
    pub fn resolve_identity(&self) -> Result<Arc<dyn DeviceIdentity>, ClientError> {
        match &self.identity {
            Some(identity) => {
                if let Some(key) = &self.dev_key {
                    if key.trim() != identity.dev_key() {
                        return Err(cs_domain::Error::InvalidConfiguration(
                            "dev_key does not match the supplied identity".into(),
                        )
                        .into());
                    }
                }
                Ok(identity.clone())
            }
            None => {
                let resolved =
                    StaticIdentity::resolve(&self.identity_config, self.dev_key.as_deref())?;
                Ok(Arc::new(resolved))
            }
        }
    }

    /// Build a standalone client, bypassing the process registry.
    ///
    /// Prefer [`create`](Self::create) in applications; two standalone
    /// clients for the same key will fight over one remote session.
    pub fn build(self) -> Result<ClientInstance, ClientError> {
        let identity = self.resolve_identity()?;
        self.build_with_identity(identity)
    }

    /// Get or create the process-wide client for this builder's key.
    pub fn create(self) -> Result<ClientInstance, ClientError> {
        InstanceRegistry::global().get_or_create(self)
    }

    pub(crate) fn build_with_identity(
        self,
        identity: Arc<dyn DeviceIdentity>,
    ) -> Result<ClientInstance, ClientError> {
        let connector = self.connector.ok_or_else(|| {
            cs_domain::Error::InvalidConfiguration("a connector is required".into())
        })?;

        TraceEvent::ClientCreated {
            dev_key: mask_secret(identity.dev_key()),
            dev_sn: identity.dev_sn().to_owned(),
        }
        .emit();

        Ok(ClientInstance::new(
            identity,
            connector,
            self.retry_policy,
            self.event_capacity,
        ))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectorError;

    struct NullConnector;

    #[async_trait::async_trait]
    impl Connector for NullConnector {
        async fn open(&self) -> Result<(), ConnectorError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn isolated_identity_config() -> IdentityConfig {
        IdentityConfig {
            dev_key: None,
            dev_key_env: "CS_BUILDER_TEST_UNSET_KEY".into(),
            dev_sn: None,
            dev_sn_env: "CS_BUILDER_TEST_UNSET_SN".into(),
        }
    }

    #[test]
    fn build_requires_connector() {
        let err = ClientBuilder::new()
            .dev_key("k-1")
            .dev_sn("sn-1")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Domain(cs_domain::Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn build_without_any_key_fails() {
        let cfg = ClientConfig {
            identity: isolated_identity_config(),
            ..Default::default()
        };
        let err = ClientBuilder::new()
            .config(&cfg)
            .connector(Arc::new(NullConnector))
            .build()
            .unwrap_err();
        assert!(err.is_missing_dev_key());
    }

    #[test]
    fn build_with_explicit_values() {
        let client = ClientBuilder::new()
            .dev_key("k-1")
            .dev_sn("sn-1")
            .connector(Arc::new(NullConnector))
            .build()
            .unwrap();
        assert_eq!(client.dev_key(), "k-1");
        assert_eq!(client.dev_sn(), "sn-1");
        assert!(!client.is_running());
    }

    #[test]
    fn config_sets_retry_policy() {
        let mut cfg = ClientConfig::default();
        cfg.retry.policy = RetryPolicy::KeepPending;
        let client = ClientBuilder::new()
            .config(&cfg)
            .dev_key("k-1")
            .dev_sn("sn-1")
            .connector(Arc::new(NullConnector))
            .build()
            .unwrap();
        assert_eq!(client.retry_policy(), RetryPolicy::KeepPending);
    }

    #[test]
    fn dev_key_opt_none_falls_back_to_config() {
        let mut cfg = ClientConfig {
            identity: isolated_identity_config(),
            ..Default::default()
        };
        cfg.identity.dev_key = Some("from-config".into());
        let client = ClientBuilder::new()
            .config(&cfg)
            .dev_key_opt(None::<String>)
            .dev_sn("sn-1")
            .connector(Arc::new(NullConnector))
            .build()
            .unwrap();
        assert_eq!(client.dev_key(), "from-config");
    }

    #[test]
    fn custom_identity_must_match_dev_key() {
        let identity = Arc::new(StaticIdentity::new("k-1", "sn-1").unwrap());
        let err = ClientBuilder::new()
            .identity(identity)
            .dev_key("k-2")
            .connector(Arc::new(NullConnector))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Domain(cs_domain::Error::InvalidConfiguration(_))
        ));
    }
}
