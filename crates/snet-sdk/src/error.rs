use thiserror::Error;

/// Errors returned by SDK operations.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("chain read error: {0}")]
    ChainRead(String),

    #[error("chain submit error: {0}")]
    ChainSubmit(String),

    #[error("receipt error: {0}")]
    Receipt(String),

    #[error("subscription error while waiting for {event}: {reason}")]
    Subscription { event: &'static str, reason: String },

    #[error("timed out waiting for {event}")]
    WaitTimeout { event: &'static str },

    #[error("daemon error ({code:?}): {message}")]
    Daemon { code: tonic::Code, message: String },

    #[error("insufficient token balance: need {need}, have {have}")]
    InsufficientFunds {
        need: alloy::primitives::U256,
        have: alloy::primitives::U256,
    },

    #[error("signature error: {0}")]
    Sign(String),

    #[error("payment strategy requires a websocket rpc endpoint (ws:// or wss://), got {0}")]
    NeedsWebSocket(String),

    #[error("operation not supported by the active payment strategy: {0}")]
    WrongStrategy(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Daemon message used when a payment channel is unknown to the daemon.
pub const CHANNEL_NOT_FOUND: &str = "channel is not found";

impl SdkError {
    /// Map a gRPC status returned by a daemon into an SDK error.
    pub fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => SdkError::Transport(status.message().to_string()),
            code => SdkError::Daemon {
                code,
                message: status.message().to_string(),
            },
        }
    }

    /// Whether this error is the daemon reporting an unknown payment channel.
    ///
    /// Recognised under `NotFound` or `Unknown` status codes, or as a plain
    /// message match on any other error.
    pub fn is_channel_not_found(&self) -> bool {
        match self {
            SdkError::Daemon { code, message } => {
                matches!(code, tonic::Code::NotFound | tonic::Code::Unknown)
                    && message.contains(CHANNEL_NOT_FOUND)
            }
            other => other.to_string().contains(CHANNEL_NOT_FOUND),
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;
