use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::block::AddressBlock;
use crate::error::{IpamError, Result};
use crate::model::{Allocation, AllocationId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    start: u128,
    prefix: u8,
    id: AllocationId,
}

impl EntryKey {
    fn of(allocation: &Allocation) -> Self {
        Self {
            start: allocation.block.first(),
            prefix: allocation.block.prefix_len(),
            id: allocation.id,
        }
    }

    fn lowest(start: u128, prefix: u8) -> Self {
        Self {
            start,
            prefix,
            id: AllocationId(0),
        }
    }

    fn highest(start: u128, prefix: u8) -> Self {
        Self {
            start,
            prefix,
            id: AllocationId(u64::MAX),
        }
    }
}

/// Live allocations of one scope, ordered by range start.
///
/// CIDR ranges are either nested or disjoint. A stored block overlapping a
/// query block therefore either starts inside the query range, or starts
/// before it and is one of the query's supernets. The first case is a single
/// range scan; the second is at most `prefix` exact lookups, one per shorter
/// prefix length. Queries cost `O(w log n + k)` for address width `w`.
#[derive(Debug, Default, Clone)]
pub struct ScopeIndex {
    entries: BTreeMap<EntryKey, Allocation>,
    by_id: FxHashMap<AllocationId, EntryKey>,
}

impl ScopeIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live allocations whose range intersects `block`, ascending by start.
    ///
    /// `block` must share the scope's family.
    pub fn query_overlaps(&self, block: &AddressBlock) -> Vec<&Allocation> {
        let mut out = Vec::new();
        let first = block.first();
        for prefix in 0..block.prefix_len() {
            let start = AddressBlock::aligned(block.family(), first, prefix).first();
            if start == first {
                // Picked up by the range scan below.
                continue;
            }
            let range = EntryKey::lowest(start, prefix)..=EntryKey::highest(start, prefix);
            out.extend(self.entries.range(range).map(|(_, allocation)| allocation));
        }
        let inside = EntryKey::lowest(first, 0)..=EntryKey::highest(block.last(), u8::MAX);
        out.extend(self.entries.range(inside).map(|(_, allocation)| allocation));
        out
    }

    /// True when no live allocation intersects `block`.
    pub fn is_free(&self, block: &AddressBlock) -> bool {
        self.query_overlaps(block).is_empty()
    }

    /// Adds a live allocation, rejecting any overlap.
    pub fn insert(&mut self, allocation: Allocation) -> Result<()> {
        let conflicts: Vec<AddressBlock> = self
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
        self.insert_unchecked(allocation);
        Ok(())
    }

    /// Adds a live allocation without an overlap check.
    ///
    /// Used when rebuilding from storage, where records written under a
    /// different sharing rule may legitimately overlap.
    pub(crate) fn insert_unchecked(&mut self, allocation: Allocation) {
        let key = EntryKey::of(&allocation);
        self.by_id.insert(allocation.id, key);
        self.entries.insert(key, allocation);
    }

    /// Removes an allocation by id.
    pub fn remove(&mut self, id: AllocationId) -> Option<Allocation> {
        let key = self.by_id.remove(&id)?;
        self.entries.remove(&key)
    }

    /// Looks up a live allocation by id.
    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.by_id.get(&id).and_then(|key| self.entries.get(key))
    }

    /// All live allocations in range order.
    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.entries.values()
    }
}
