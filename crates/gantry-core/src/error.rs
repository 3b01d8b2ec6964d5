//! Error types for the Gantry engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
