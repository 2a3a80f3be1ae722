use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Resolver is frozen")]
    Frozen,

    #[error("Resolver is not frozen")]
    NotFrozen,

    #[error("Resolver is shutting down")]
    ShuttingDown,

    #[error("Server failure")]
    ServFail,

    #[error("Fetch lifetime exceeded")]
    TimedOut,

    #[error("Fetch canceled")]
    Canceled,

    #[error("Invalid domain name: {0}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No query ports available in the configured range")]
    PortRangeExhausted,

    #[error("No free query ids on dispatcher")]
    NoFreeIds,

    #[error("Message encoding failed: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ResolverError {
    fn from(e: std::io::Error) -> Self {
        ResolverError::Io(e.to_string())
    }
}
