use crashboard_state::{KvError, QueueError, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrashboardError {
    #[error("Store error: {0}")]
    Store(#[from] KvError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Unknown attribute: {0}")]
    UnknownField(String),

    #[error("Invalid crash state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl From<figment::Error> for CrashboardError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CrashboardError>;
