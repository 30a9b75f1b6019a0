//! `cs-domain`: shared types for the device client workspace.
//!
//! Holds everything the lifecycle core and its host binaries agree on:
//! the configuration schema, the device identity provider, the shared
//! error type, and the structured trace events.

pub mod config;
pub mod error;
pub mod identity;
pub mod trace;

pub use error::{Error, Result};
pub use identity::{DeviceIdentity, StaticIdentity};
