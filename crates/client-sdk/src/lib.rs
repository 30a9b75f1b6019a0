//! `cs-client-sdk`: lifecycle core for a device client.
//!
//! A client identifies a device (developer key + device serial) to a remote
//! service and keeps one session open through a [`Connector`].  This crate
//! owns the state machine around that session: start, stop, restart, and a
//! single cancellable delayed retry.
//!
//! # Usage
//!
//! ```text
//! let client = create_instance(Some("dk-0123"), connector)?;   // once per process
//! if let Err(e) = client.start().await {
//!     client.retry_with_seconds(5)?;                            // opt-in recovery
//! }
//! ...
//! client.stop().await?;                                         // cancels pending retry
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!            start / retry-fire                 stop
//!  Stopped ──────────────────▶ Starting ─▶ Running ──▶ Stopping ─▶ Stopped
//!     ▲                           │                       │
//!     └────── open failed ────────┘      restart: Stopping ─▶ Starting
//! ```
//!
//! Retry policy (how many attempts, what backoff) is left to the caller;
//! [`supervise`] is a ready-made one.

pub mod backoff;
pub mod builder;
pub mod connector;
pub mod lifecycle;
pub mod registry;
pub(crate) mod retry;
pub mod supervisor;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::RetryBackoff;
pub use builder::ClientBuilder;
pub use connector::Connector;
pub use lifecycle::ClientInstance;
pub use registry::{create_instance, InstanceRegistry};
pub use supervisor::{supervise, SupervisorExit};
pub use types::{
    ClientError, ClientEvent, ClientStatus, ConnectorError, Phase, RetryDisposition, Trigger,
};

// Re-export domain types so integrators never need to import cs-domain directly.
pub use cs_domain::config::{ClientConfig, RetryPolicy};
pub use cs_domain::{DeviceIdentity, StaticIdentity};
