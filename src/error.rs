use thiserror::Error;

/// Errors surfaced by the connection manager, publisher and subscriber.
///
/// Broker reachability is deliberately *not* an error at the connection
/// layer: [`ConnectionManager::try_connect`](crate::ConnectionManager::try_connect)
/// reports it as `false`. Errors from a specific publish or subscribe setup
/// are retried and then returned to the caller.
#[derive(Error, Debug)]
pub enum BusError {
    /// A call-boundary precondition was violated (empty queue name, null
    /// payload). Raised before any I/O and never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A channel was requested while no open connection exists.
    #[error("no connection available")]
    NoConnection,

    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    ConnectionUnavailable(String),

    /// A broker operation (declare, qos, publish, consume, ack) failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Broker settings could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Outcome reported by a subscription handler for one message.
///
/// Every variant causes the message to be negatively acknowledged *with*
/// requeue; the subscriber does not distinguish transient from permanent
/// failures.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler observed its cancellation token and gave up.
    #[error("handler cancelled")]
    Cancelled,

    /// The handler failed to process the message.
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Wrap any displayable error as a handler failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Cancelled => HandlerError::Cancelled,
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

/// Result type returned by subscription handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;
