/// Shared error type used across all device client crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing developer key")]
    MissingDevKey,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
