//! Instance registry: at most one client per process.
//!
//! The connector stands for a single real-world session, so the registry
//! hands back the existing client when the same developer key asks again
//! and refuses a second, different key while one is registered.

use std::sync::{Arc, OnceLock};

use cs_domain::identity::mask_secret;
use cs_domain::trace::TraceEvent;
use parking_lot::Mutex;

use crate::builder::ClientBuilder;
use crate::connector::Connector;
use crate::lifecycle::ClientInstance;
use crate::types::ClientError;

static GLOBAL: OnceLock<InstanceRegistry> = OnceLock::new();

/// Get or create the process-wide client.
///
/// When `dev_key` is `None` and a client is already registered, that client
/// is returned.  Otherwise a `None` key is read from the environment
/// (`CASTAR_DEV_KEY`); if that is unset too this fails with a
/// missing-dev-key error.  Calling it again with the same key returns the
/// same client; the connector passed on later calls is ignored.
pub fn create_instance(
    dev_key: Option<&str>,
    connector: Arc<dyn Connector>,
) -> Result<ClientInstance, ClientError> {
    ClientBuilder::new()
        .dev_key_opt(dev_key)
        .connector(connector)
        .create()
}

#[derive(Default)]
pub struct InstanceRegistry {
    slot: Mutex<Option<ClientInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry behind [`create_instance`] and [`ClientBuilder::create`].
    pub fn global() -> &'static InstanceRegistry {
        GLOBAL.get_or_init(InstanceRegistry::new)
    }

    /// Return the registered client for the builder's key, creating it on
    /// first use.  A builder that names no key reuses whatever client is
    /// registered.
    pub fn get_or_create(&self, builder: ClientBuilder) -> Result<ClientInstance, ClientError> {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            if !builder.names_key() {
                return Ok(reuse(existing));
            }
        }

        let identity = builder.resolve_identity()?;
        if let Some(existing) = slot.as_ref() {
            if existing.dev_key() == identity.dev_key() {
                return Ok(reuse(existing));
            }
            return Err(ClientError::ConflictingDevKey {
                active: mask_secret(existing.dev_key()),
                requested: mask_secret(identity.dev_key()),
            });
        }

        let instance = builder.build_with_identity(identity)?;
        *slot = Some(instance.clone());
        Ok(instance)
    }

    /// The registered client, if any.
    pub fn current(&self) -> Option<ClientInstance> {
        self.slot.lock().clone()
    }

    /// The registered client if it was created for `dev_key`.
    pub fn get(&self, dev_key: &str) -> Option<ClientInstance> {
        self.slot
            .lock()
            .as_ref()
            .filter(|c| c.dev_key() == dev_key)
            .cloned()
    }
}

fn reuse(existing: &ClientInstance) -> ClientInstance {
    TraceEvent::ClientReused {
        dev_key: mask_secret(existing.dev_key()),
        dev_sn: existing.dev_sn().to_owned(),
    }
    .emit();
    existing.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectorError;
    use cs_domain::config::{ClientConfig, IdentityConfig};

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

    fn builder(key: &str) -> ClientBuilder {
        ClientBuilder::new()
            .dev_key(key)
            .dev_sn("sn-registry")
            .connector(Arc::new(NullConnector))
    }

    #[test]
    fn empty_registry_has_no_client() {
        let reg = InstanceRegistry::new();
        assert!(reg.current().is_none());
        assert!(reg.get("k-1").is_none());
    }

    #[test]
    fn same_key_returns_same_instance() {
        let reg = InstanceRegistry::new();
        let a = reg.get_or_create(builder("k-1")).unwrap();
        let b = reg.get_or_create(builder("k-1")).unwrap();
        assert!(a.same_instance(&b));
        assert!(reg.get("k-1").unwrap().same_instance(&a));
    }

    #[test]
    fn different_key_conflicts() {
        let reg = InstanceRegistry::new();
        reg.get_or_create(builder("key-alpha")).unwrap();
        let err = reg.get_or_create(builder("key-bravo")).unwrap_err();
        match err {
            ClientError::ConflictingDevKey { active, requested } => {
                assert_eq!(active, "key-****");
                assert_eq!(requested, "key-****");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(reg.get("key-bravo").is_none());
    }

    #[test]
    fn keyless_request_reuses_registered_client() {
        let reg = InstanceRegistry::new();
        let first = reg.get_or_create(builder("k-1")).unwrap();

        // No explicit key and env sources that are never set.
        let cfg = ClientConfig {
            identity: IdentityConfig {
                dev_key: None,
                dev_key_env: "CS_REGISTRY_TEST_UNSET_KEY".into(),
                dev_sn: None,
                dev_sn_env: "CS_REGISTRY_TEST_UNSET_SN".into(),
            },
            ..Default::default()
        };
        let again = reg
            .get_or_create(
                ClientBuilder::new()
                    .config(&cfg)
                    .dev_key_opt(None::<&str>)
                    .connector(Arc::new(NullConnector)),
            )
            .unwrap();
        assert!(again.same_instance(&first));
    }

    #[test]
    fn keyless_request_on_empty_registry_needs_a_key() {
        let reg = InstanceRegistry::new();
        let cfg = ClientConfig {
            identity: IdentityConfig {
                dev_key: None,
                dev_key_env: "CS_REGISTRY_TEST_UNSET_KEY".into(),
                dev_sn: None,
                dev_sn_env: "CS_REGISTRY_TEST_UNSET_SN".into(),
            },
            ..Default::default()
        };
        let err = reg
            .get_or_create(ClientBuilder::new().config(&cfg).connector(Arc::new(NullConnector)))
            .unwrap_err();
        assert!(err.is_missing_dev_key());
        assert!(reg.current().is_none());
    }

    #[test]
    fn failed_resolution_registers_nothing() {
        let reg = InstanceRegistry::new();
        let err = reg
            .get_or_create(ClientBuilder::new().dev_key("k-1").dev_sn("sn-1"))
            .unwrap_err();
        assert!(matches!(err, ClientError::Domain(_)));
        assert!(reg.current().is_none());
    }
}
