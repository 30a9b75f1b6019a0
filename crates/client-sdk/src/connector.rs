//! The session transport the lifecycle drives.

use crate::types::ConnectorError;

/// Opens and closes the one remote session a client owns.
///
/// The lifecycle never calls `open` while a session it opened is still up, and
/// never holds its state lock across either call, so implementations may
/// take as long as their own timeouts allow.
///
/// # Example
///
/// ```rust,no_run
/// use cs_client_sdk::{Connector, ConnectorError};
///
/// struct Loopback;
///
/// #[async_trait::async_trait]
/// impl Connector for Loopback {
///     async fn open(&self) -> Result<(), ConnectorError> {
///         Ok(())
///     }
///     async fn close(&self) -> Result<(), ConnectorError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<(), ConnectorError>;

    async fn close(&self) -> Result<(), ConnectorError>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "connector"
    }
}
