use thiserror::Error;

/// Result type alias for sshmux operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the sshmux library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// SSH driver errors
    #[error("SSH error: {0}")]
    Ssh(#[from] SshError),

    /// Feed ingestion errors
    #[error("Feed error: {0}")]
    Feed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by the SSH client driver for one connect attempt.
///
/// Callers treat every kind except [`SshError::Cancelled`] uniformly as
/// "tunnel not established". `Cancelled` means the owning task was told to
/// stop and no repository write may happen on its behalf.
#[derive(Error, Debug)]
pub enum SshError {
    /// The server rejected the credentials
    #[error("Authentication failed")]
    AuthFailed,

    /// The client exited or reported a fatal error before forwarding came up
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The connect attempt exceeded its overall deadline
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Forwarding was reported ready but the end-to-end probe returned nothing
    #[error("Forwarding ready but proxy unusable")]
    ProxyUnusable,

    /// The owning task was cancelled mid-attempt
    #[error("Connect attempt cancelled")]
    Cancelled,

    /// The SSH client binary could not be started
    #[error("Failed to spawn SSH client: {0}")]
    Spawn(String),
}

impl SshError {
    /// True when the attempt ended because the owning task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SshError::Cancelled)
    }
}
