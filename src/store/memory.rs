use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{AllocationStore, Record, Snapshot};
use crate::audit::{AuditEvent, AuditFilter};
use crate::error::StoreError;
use crate::model::{Allocation, AllocationId, Status};
use crate::pool::Pool;

#[derive(Debug, Default)]
struct MemoryState {
    allocations: BTreeMap<AllocationId, Allocation>,
    pools: BTreeMap<String, Pool>,
    audit: BTreeMap<u64, AuditEvent>,
}

/// Volatile store for tests and embedding.
///
/// Supports failure injection and artificial commit latency so callers can
/// exercise the commit protocol's error and contention paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_next: AtomicUsize,
    latency_us: AtomicU64,
    applied: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `apply` fail without effect.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Sleeps for `latency` inside every `apply`, mimicking an fsync.
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.store(micros, Ordering::SeqCst);
    }

    /// Number of batches applied successfully.
    pub fn applied_batches(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl AllocationStore for MemoryStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        let state = self.state.lock();
        Ok(Snapshot {
            allocations: state.allocations.values().cloned().collect(),
            pools: state.pools.values().cloned().collect(),
            last_audit_id: state.audit.keys().next_back().copied().unwrap_or(0),
        })
    }

    fn apply(&self, batch: &[Record]) -> Result<(), StoreError> {
        let latency = self.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_micros(latency));
        }
        if self.take_failure() {
            return Err(StoreError::Backend("injected failure".into()));
        }
        let mut state = self.state.lock();
        validate(&state, batch)?;
        for record in batch {
            match record {
                Record::InsertAllocation(allocation) => {
                    state.allocations.insert(allocation.id, allocation.clone());
                }
                Record::MarkReleased { id, at } => {
                    if let Some(allocation) = state.allocations.get_mut(id) {
                        allocation.status = Status::Released;
                        allocation.released_at = Some(*at);
                    }
                }
                Record::PutPool(pool) => {
                    state.pools.insert(pool.name.clone(), pool.clone());
                }
                Record::Audit(event) => {
                    state.audit.insert(event.id, event.clone());
                }
            }
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        Ok(self.state.lock().allocations.values().cloned().collect())
    }

    fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        Ok(self.state.lock().allocations.get(&id).cloned())
    }

    fn audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .audit
            .values()
            .rev()
            .filter(|event| filter.matches(event))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

/// Rejects a batch that could only be applied partially.
fn validate(state: &MemoryState, batch: &[Record]) -> Result<(), StoreError> {
    let mut inserted = BTreeSet::new();
    let mut audited = BTreeSet::new();
    for record in batch {
        match record {
            Record::InsertAllocation(allocation) => {
                if state.allocations.contains_key(&allocation.id) || !inserted.insert(allocation.id)
                {
                    return Err(StoreError::Backend(format!(
                        "duplicate allocation id {}",
                        allocation.id
                    )));
                }
            }
            Record::MarkReleased { id, .. } => {
                if !state.allocations.contains_key(id) && !inserted.contains(id) {
                    return Err(StoreError::Backend(format!(
                        "release of unknown allocation {id}"
                    )));
                }
            }
            Record::Audit(event) => {
                if state.audit.contains_key(&event.id) || !audited.insert(event.id) {
                    return Err(StoreError::Backend(format!(
                        "duplicate audit event id {}",
                        event.id
                    )));
                }
            }
            Record::PutPool(_) => {}
        }
    }
    Ok(())
}
