//! The persistence seam.
//!
//! The store is the single source of truth for claim state; every
//! permit/claim mutation happens inside a store transaction. Two
//! implementations are bundled: an in-process store for single-node
//! deployments and tests, and a Postgres store.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{GroupId, GroupRecord, Permit, PermitRecord, QueueWork, WorkError};

/// Transactional CRUD over the queue, permit, and address-failure tables.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert unaddressed work. Priority zero is the most important.
    async fn push(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()>;

    /// Insert addressed work. Fails with `Error::DuplicateAddress` while a
    /// live item holds the same address.
    #[allow(clippy::too_many_arguments)]
    async fn push_addressed(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        address: &str,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()>;

    /// The atomic claim. Cheap unclaimed-row existence check first, then a
    /// transaction that allocates a permit and assigns it to exactly one
    /// matching row, ordered by priority then insertion, re-checking
    /// `permit = 0` so concurrent claimers cannot double-claim. `None`
    /// when nothing matched or the candidate was lost to a racer.
    async fn pop(&self, name: &str, max_priority: u64, types: &[u64]) -> Result<Option<QueueWork>>;

    /// Delete claimed work and its permit together. Idempotent.
    async fn delete(&self, permit: Permit) -> Result<()>;

    /// Permits currently attached to the named queue's work.
    async fn permits(&self, name: &str) -> Result<Vec<PermitRecord>>;

    /// Clear a permit and reopen its work for claiming. Used by the
    /// sweeper when the owning agent has died.
    async fn permit_delete(&self, permit: Permit) -> Result<()>;

    /// Read-only enumeration of queued work of the given types.
    async fn peek(&self, types: &[u64]) -> Result<Vec<QueueWork>>;

    /// Is the address gone from the queue, and if so, did it fail? The
    /// recorded failure is only reported once the item is gone.
    async fn address_complete(&self, address: &str) -> Result<(bool, Option<WorkError>)>;

    /// Is a live item holding this address?
    async fn address_in_progress(&self, address: &str) -> Result<bool>;

    /// Replace the failure record for an address; `None` clears it.
    async fn record_address_failure(&self, address: &str, failure: Option<WorkError>)
    -> Result<()>;

    /// Heartbeat a permit by broadcasting a permit-extension event for the
    /// monitor task. No row state changes.
    async fn notify_extend(&self, permit: Permit) -> Result<()>;
}

/// Group lifecycle operations layered over the same tables.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Create a group. Names are unique.
    async fn group_create(&self, name: &str) -> Result<GroupRecord>;

    /// Mark the group started, making its members claimable.
    async fn group_start(&self, id: GroupId) -> Result<()>;

    /// `(done, cancelled)`. Done when zero items reference the group; the
    /// group row itself is cleaned up on the first done observation.
    async fn group_complete(&self, id: GroupId) -> Result<(bool, bool)>;

    /// Mark the group cancelled.
    async fn group_cancel(&self, id: GroupId) -> Result<()>;

    /// Delete all remaining member items.
    async fn group_clear(&self, id: GroupId) -> Result<()>;
}
