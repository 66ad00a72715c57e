use crate::protocol::FrameError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// wire-level errors
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("timed out waiting for the next message")]
    AwaitTimeout,

    /// the peer closed the connection between transactions
    #[error("peer closed the connection")]
    PeerClosed,
}

impl AppError {
    /// Parse failures during request preparation abandon the transaction
    /// without tearing the connection down; everything else is fatal to
    /// the connection.
    pub fn is_transaction_local(&self) -> bool {
        matches!(
            self,
            AppError::MalformedProtocol(_) | AppError::Frame(FrameError::Truncated { .. })
        )
    }
}
