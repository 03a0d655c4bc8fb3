//! Core data model.
//!
//! A work item is an opaque payload with a priority, a numeric work type,
//! an optional unique address, and an optional group. Claimed items carry
//! a permit that must be heartbeated while the work runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Work without a meaningful type tag. Set well below `u64::MAX` so the
/// value survives stores that only hold signed integers.
pub const TYPE_NONE: u64 = i32::MAX as u64;

// ---------------------------------------------------------------------------
// Permits
// ---------------------------------------------------------------------------

/// The token granted when a work item is claimed. Zero means unclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permit(pub u64);

impl std::fmt::Display for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A permit row as seen by the maintenance tasks. The creation timestamp
/// feeds staleness detection in the sweeper.
#[derive(Debug, Clone)]
pub struct PermitRecord {
    pub id: Permit,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Identifier of a group of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted queue group. Members are invisible to claimers until
/// `started` is set; `cancelled` is reported by the completeness check.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub started: bool,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Claimed work
// ---------------------------------------------------------------------------

/// A claimed unit of work, as handed to the agent by the claim protocol.
#[derive(Debug, Clone)]
pub struct QueueWork {
    /// The permit for doing the work and heartbeating.
    pub permit: Permit,

    /// The work's address, if addressed.
    pub address: Option<String>,

    /// The work type tag.
    pub work_type: u64,

    /// The JSON-encoded work payload.
    pub payload: Vec<u8>,

    /// Opaque tracing carrier persisted across the work lifecycle.
    pub carrier: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Work trait
// ---------------------------------------------------------------------------

/// Anything that can be pushed into the queue.
pub trait Work: Send + Sync {
    /// The numeric work type tag, used to route to a registered runner.
    fn work_type(&self) -> u64;

    /// Serialize the payload for persistence.
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Assigns a work type tag to a serializable payload. Anything that is
/// `Serialize + WorkType` is pushable.
pub trait WorkType {
    fn work_type(&self) -> u64;
}

impl<T> Work for T
where
    T: Serialize + WorkType + Send + Sync,
{
    fn work_type(&self) -> u64 {
        WorkType::work_type(self)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ---------------------------------------------------------------------------
// Recorded failures
// ---------------------------------------------------------------------------

/// A typed failure recorded against an address. If a runner returns
/// `Error::WorkFailed`, the code is preserved so pollers can distinguish
/// expected failures (say, a 404-class miss) from generic errors. Generic
/// runner errors are recorded with code zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkError {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: u32,
    pub message: String,
}

fn is_zero(code: &u32) -> bool {
    *code == 0
}

impl WorkError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Wrap any error, preserving the code when it already is a recorded
    /// work failure.
    pub fn from_error(err: &crate::error::Error) -> Self {
        match err {
            crate::error::Error::WorkFailed(we) => we.clone(),
            other => Self {
                code: 0,
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkError {}
