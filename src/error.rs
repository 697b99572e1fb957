use thiserror::Error;

impl From<serde_json::Error> for IntegrityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for IntegrityError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for IntegrityError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(format!("I/O error: {}", err))
    }
}

impl From<config::ConfigError> for IntegrityError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IntegrityError {
    /// The payload could not be canonicalized. Never retried.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The signing backend could not be reached or refused to sign.
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Unknown key version: {0}")]
    UnknownKeyVersion(u32),

    #[error("Timestamp authority unreachable: {0}")]
    TsaUnreachable(String),

    #[error("Timestamp authority rejected the request: {0}")]
    TsaRejected(String),

    #[error("Malformed timestamp token: {0}")]
    MalformedToken(String),

    #[error("Record store error: {0}")]
    Store(String),

    /// An append would violate the chain's insert-only ordering.
    #[error("Chain conflict: {0}")]
    ChainConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine not ready: {0}")]
    NotReady(String),
}

impl IntegrityError {
    /// Transient infrastructure failures that the retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntegrityError::TsaUnreachable(_) | IntegrityError::KeyUnavailable(_)
        )
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}

pub type Result<T, E = IntegrityError> = std::result::Result<T, E>;
