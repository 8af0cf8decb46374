//! Scope-partitioned allocation index.
//!
//! [`AllocationIndex`] maps each [`ScopeKey`] to a [`ScopeSlot`]. A slot pairs
//! the scope's [`ScopeIndex`] with a commit guard: writers to a scope are
//! serialized by the guard, readers take the index read lock and always see a
//! whole committed state. Every lock a request takes is bounded by a wait, so
//! a slow scope makes callers time out instead of hanging. Slots for
//! different scopes share no locks beyond the short lookup in the slot table.

mod interval;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use crate::block::Family;
use crate::error::{IpamError, Result, TimeoutCause};
use crate::model::{Allocation, AllocationId, Scope, ScopeKey};

pub use interval::ScopeIndex;

/// Index state and commit guard for one scope.
#[derive(Debug)]
pub struct ScopeSlot {
    key: ScopeKey,
    guard: Mutex<()>,
    index: RwLock<ScopeIndex>,
    version: AtomicU64,
    live: AtomicUsize,
}

/// Held while a writer owns a scope.
pub type CommitGuard<'a> = MutexGuard<'a, ()>;

impl ScopeSlot {
    fn new(key: ScopeKey) -> Self {
        Self {
            key,
            guard: Mutex::new(()),
            index: RwLock::new(ScopeIndex::new()),
            version: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Key this slot indexes.
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Monotonic counter bumped by every published mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Live allocations in the scope, without taking the index lock.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Waits up to `wait` for a consistent read view of the scope.
    pub fn try_read(&self, wait: Duration) -> Option<RwLockReadGuard<'_, ScopeIndex>> {
        self.index.try_read_for(wait)
    }

    /// [`try_read`](Self::try_read), failing with a deadline timeout.
    pub fn read_within(&self, wait: Duration) -> Result<RwLockReadGuard<'_, ScopeIndex>> {
        self.try_read(wait).ok_or(IpamError::Timeout {
            attempts: 1,
            elapsed: wait,
            cause: TimeoutCause::Deadline,
        })
    }

    /// Waits up to `wait` for exclusive write ownership of the scope.
    pub fn try_guard(&self, wait: Duration) -> Option<CommitGuard<'_>> {
        self.guard.try_lock_for(wait)
    }

    /// Blocks until exclusive write ownership of the scope is granted.
    pub fn guard(&self) -> CommitGuard<'_> {
        self.guard.lock()
    }

    /// Upgrades write ownership to index access, waiting up to `wait` for
    /// readers to drain. Hands the guard back on timeout.
    pub(crate) fn try_writer<'a>(
        &'a self,
        guard: CommitGuard<'a>,
        wait: Duration,
    ) -> std::result::Result<ScopeWriter<'a>, CommitGuard<'a>> {
        match self.index.try_write_for(wait) {
            Some(index) => Ok(ScopeWriter {
                slot: self,
                _guard: guard,
                index,
            }),
            None => Err(guard),
        }
    }

    /// Blocking [`try_writer`](Self::try_writer), for rebuilds nobody else
    /// can observe yet.
    pub(crate) fn writer(&self) -> ScopeWriter<'_> {
        ScopeWriter {
            slot: self,
            _guard: self.guard.lock(),
            index: self.index.write(),
        }
    }
}

/// Exclusive access to one scope's index, held across the durable write and
/// the publish that follows it.
pub struct ScopeWriter<'a> {
    slot: &'a ScopeSlot,
    _guard: CommitGuard<'a>,
    index: RwLockWriteGuard<'a, ScopeIndex>,
}

impl ScopeWriter<'_> {
    /// Current committed state of the scope.
    pub fn index(&self) -> &ScopeIndex {
        &self.index
    }

    /// Makes a committed allocation visible.
    pub(crate) fn insert(&mut self, allocation: Allocation) {
        self.index.insert_unchecked(allocation);
        self.slot.live.fetch_add(1, Ordering::AcqRel);
        self.slot.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Makes a release visible.
    pub(crate) fn remove(&mut self, id: AllocationId) -> Option<Allocation> {
        let removed = self.index.remove(id)?;
        self.slot.live.fetch_sub(1, Ordering::AcqRel);
        self.slot.version.fetch_add(1, Ordering::AcqRel);
        Some(removed)
    }
}

/// Every scope's live allocations.
#[derive(Debug)]
pub struct AllocationIndex {
    shared_address_space: bool,
    slots: RwLock<FxHashMap<ScopeKey, Arc<ScopeSlot>>>,
}

impl AllocationIndex {
    /// Empty index. `shared_address_space` selects per-VPC scoping.
    pub fn new(shared_address_space: bool) -> Self {
        Self {
            shared_address_space,
            slots: RwLock::new(FxHashMap::default()),
        }
    }

    /// Scope key a block in `scope` is checked against.
    pub fn key_for(&self, scope: &Scope, family: Family) -> ScopeKey {
        ScopeKey::resolve(scope, family, self.shared_address_space)
    }

    /// Slot for `key`, creating it on first use.
    pub fn slot(&self, key: &ScopeKey) -> Arc<ScopeSlot> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ScopeSlot::new(key.clone()))),
        )
    }

    /// Slot for `key` if anything was ever indexed there.
    pub fn existing_slot(&self, key: &ScopeKey) -> Option<Arc<ScopeSlot>> {
        self.slots.read().get(key).cloned()
    }

    /// Finds the slot holding a live allocation of `scope`.
    ///
    /// Each candidate slot is read within `wait`.
    pub fn locate(
        &self,
        scope: &Scope,
        id: AllocationId,
        wait: Duration,
    ) -> Result<Option<Arc<ScopeSlot>>> {
        for family in [Family::V4, Family::V6] {
            let Some(slot) = self.existing_slot(&self.key_for(scope, family)) else {
                continue;
            };
            let owned = slot
                .read_within(wait)?
                .get(id)
                .is_some_and(|allocation| allocation.scope == *scope);
            if owned {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Total live allocations across all scopes.
    pub fn live_count(&self) -> usize {
        self.slots.read().values().map(|slot| slot.live()).sum()
    }

    /// Inserts straight into memory, bypassing the store.
    #[cfg(test)]
    pub(crate) fn insert(&self, scope: &Scope, allocation: Allocation) -> Result<()> {
        let slot = self.slot(&self.key_for(scope, allocation.block.family()));
        let mut writer = slot.writer();
        let conflicts: Vec<_> = writer
            .index()
            .query_overlaps(&allocation.block)
            .into_iter()
            .map(|existing| existing.block)
            .collect();
        if !conflicts.is_empty() {
            return Err(IpamError::Conflict {
                requested: allocation.block,
                conflicts,
            });
        }
        writer.insert(allocation);
        Ok(())
    }

    /// Removes straight from memory, bypassing the store.
    #[cfg(test)]
    pub(crate) fn release(&self, scope: &Scope, id: AllocationId) -> Result<Allocation> {
        let missing = || IpamError::NotFound(crate::error::Missing::Allocation(id));
        let slot = self
            .locate(scope, id, Duration::from_secs(1))?
            .ok_or_else(missing)?;
        let removed = slot.writer().remove(id);
        removed.ok_or_else(missing)
    }
}
