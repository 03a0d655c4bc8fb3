//! Error types for quarry.

use thiserror::Error;

use crate::model::WorkError;

#[derive(Debug, Error)]
pub enum Error {
    /// An addressed push collided with a live item holding the same address.
    #[error("duplicate address")]
    DuplicateAddress,

    /// A blocking `get` was interrupted by the stop signal.
    #[error("queue agent stopped")]
    Stopped,

    /// The agent did not shut down within the allotted budget.
    #[error("timeout waiting for queue agent to stop")]
    StopTimeout,

    /// The group runner did not drain its in-flight groups in time.
    #[error("timeout stopping queue group runner")]
    GroupStopTimeout,

    /// Transient store lock contention. Retried internally by the claim
    /// and poll loops, never surfaced through the public API.
    #[error("store locked: {0}")]
    Locked(String),

    /// Addressed work finished with a recorded failure.
    #[error("addressed work failed: {0}")]
    WorkFailed(WorkError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no runner registered for work type {0}")]
    InvalidWorkType(u64),

    #[error("address must not be empty")]
    EmptyAddress,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Is this the transient lock-contention class that internal loops
    /// retry with a short sleep?
    pub fn is_locked(&self) -> bool {
        matches!(self, Error::Locked(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("is locked") {
            Error::Locked(msg)
        } else {
            Error::Store(msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
