//! Durability collaborator for the registry.
//!
//! The registry treats storage as a transactional record log: every commit is
//! a batch of [`Record`]s applied atomically by [`AllocationStore::apply`].
//! A batch that returns `Ok` must survive a crash; a batch that returns `Err`
//! must leave no trace.

mod memory;
mod sqlite;

use std::fmt::Debug;

use time::OffsetDateTime;

use crate::audit::{AuditEvent, AuditFilter};
use crate::error::StoreError;
use crate::model::{Allocation, AllocationId};
use crate::pool::Pool;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One durable mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// Persist a newly committed allocation.
    InsertAllocation(Allocation),
    /// Move an allocation to RELEASED.
    MarkReleased {
        /// Allocation being released.
        id: AllocationId,
        /// Release time.
        at: OffsetDateTime,
    },
    /// Insert or replace a pool definition.
    PutPool(Pool),
    /// Append an audit event.
    Audit(AuditEvent),
}

/// Everything needed to rebuild the in-memory index at startup.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Every allocation ever committed, released ones included.
    pub allocations: Vec<Allocation>,
    /// Every pool.
    pub pools: Vec<Pool>,
    /// Highest audit sequence number written so far.
    pub last_audit_id: u64,
}

/// Transactional storage for allocation records.
pub trait AllocationStore: Send + Sync + Debug {
    /// Reads the full persisted state.
    fn load(&self) -> Result<Snapshot, StoreError>;

    /// Applies `batch` atomically and durably.
    fn apply(&self, batch: &[Record]) -> Result<(), StoreError>;

    /// Every allocation, released ones included, in no particular order.
    fn allocations(&self) -> Result<Vec<Allocation>, StoreError>;

    /// One allocation by id.
    fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError>;

    /// Audit events passing `filter`, newest (highest id) first.
    fn audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError>;
}
