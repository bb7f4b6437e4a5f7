//! Error types for credential storage

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The session was cleared or replaced after the caller read it.
    #[error("session changed: {0}")]
    SessionChanged(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
