use thiserror::Error;

/// Transport-level failures: connect, publish, subscribe, acknowledge.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("could not connect to transport: {0}")]
    Connect(String),

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("invalid subject pattern: {0}")]
    InvalidPattern(String),

    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport closed")]
    Closed,
}
