//! Crate-wide error taxonomy.

use thiserror::Error;

/// Result type used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Classification of everything that can go wrong while moving a file
/// through the engine. Mirrors the retry taxonomy: retriable errors carry
/// enough context for [`crate::retry::RetryPolicy`] to decide whether to
/// try again, terminal errors never are.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad configuration or malformed inputs (e.g. non-positive chunk size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection reset, DNS failure, host unreachable.
    #[error("network error: {0}")]
    TransportNetwork(String),

    /// Exceeded a per-request deadline.
    #[error("request timed out: {0}")]
    TransportTimeout(String),

    /// 5xx or 429 from the server.
    #[error("server error ({status}): {message}")]
    ServerTransient { status: u16, message: String },

    /// 4xx other than 408/429.
    #[error("client error ({status}): {message}")]
    ServerPermanent { status: u16, message: String },

    /// The server's response was inconsistent with the wire protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// A persisted record failed its checksum on load. Never propagated
    /// past the queue boundary; the record is dropped and this is only
    /// constructed so the drop can be logged with a typed reason.
    #[error("persisted record failed checksum verification: {0}")]
    StateCorruption(String),

    /// Everything else: database errors, host I/O failures, and other
    /// infrastructure faults that do not fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether the retry policy should ever consider retrying this error.
    /// `ServerTransient`/`TransportNetwork`/`TransportTimeout` are retriable;
    /// everything else is terminal for the operation that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransportNetwork(_)
                | CoreError::TransportTimeout(_)
                | CoreError::ServerTransient { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// The taxonomy tag used in structured log fields and engine events.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::TransportNetwork(_) => "network",
            CoreError::TransportTimeout(_) => "timeout",
            CoreError::ServerTransient { .. } => "server_transient",
            CoreError::ServerPermanent { .. } => "server_permanent",
            CoreError::ProtocolViolation(_) => "protocol_violation",
            CoreError::Cancelled => "cancelled",
            CoreError::StateCorruption(_) => "state_corruption",
            CoreError::Other(_) => "other",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::TransportNetwork(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::TransportTimeout(err.to_string())
        } else if err.is_connect() {
            CoreError::TransportNetwork(err.to_string())
        } else if let Some(status) = err.status() {
            let status_u16 = status.as_u16();
            // 408 (request timeout) and 429 (rate limited) are retriable
            // even though they are 4xx; every other 4xx is terminal.
            if status.is_server_error() || status_u16 == 429 || status_u16 == 408 {
                CoreError::ServerTransient {
                    status: status_u16,
                    message: err.to_string(),
                }
            } else {
                CoreError::ServerPermanent {
                    status: status_u16,
                    message: err.to_string(),
                }
            }
        } else {
            CoreError::TransportNetwork(err.to_string())
        }
    }
}
