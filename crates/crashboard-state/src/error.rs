use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("CAS conflict: value changed")]
    Conflict,

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
