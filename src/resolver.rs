//! Availability checks over a scope index.

use serde::Serialize;

use crate::block::{punch_holes, AddressBlock};
use crate::index::ScopeIndex;
use crate::model::AvailabilityMode;

/// Outcome of an availability check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Block that was checked.
    pub requested: AddressBlock,
    /// Mode the check ran in.
    pub mode: AvailabilityMode,
    /// FULL: nothing overlaps. PARTIAL: at least one sub-block is free.
    pub is_free: bool,
    /// Occupied blocks overlapping the request, ascending, in either mode.
    pub conflicts: Vec<AddressBlock>,
    /// PARTIAL only: the request minus every conflict, ascending.
    pub free_subranges: Vec<AddressBlock>,
}

impl CheckResult {
    /// Widest free sub-block, lowest address first among equals.
    pub fn largest_free(&self) -> Option<AddressBlock> {
        self.free_subranges
            .iter()
            .min_by_key(|block| (block.prefix_len(), block.first()))
            .copied()
    }
}

/// Blocks of the live allocations overlapping `requested`, ascending by
/// start. This is the only part of a check that needs the scope's read lock.
pub fn conflicts(index: &ScopeIndex, requested: &AddressBlock) -> Vec<AddressBlock> {
    let mut conflicts: Vec<AddressBlock> = index
        .query_overlaps(requested)
        .into_iter()
        .map(|allocation| allocation.block)
        .collect();
    conflicts.dedup();
    conflicts
}

/// Builds the check outcome from a conflict list gathered earlier.
pub fn resolve(
    requested: &AddressBlock,
    mode: AvailabilityMode,
    conflicts: Vec<AddressBlock>,
) -> CheckResult {
    let (is_free, free_subranges) = match mode {
        AvailabilityMode::Full => (conflicts.is_empty(), Vec::new()),
        AvailabilityMode::Partial => {
            let free = punch_holes(requested, &conflicts);
            (!free.is_empty(), free)
        }
    };
    CheckResult {
        requested: *requested,
        mode,
        is_free,
        conflicts,
        free_subranges,
    }
}

/// Checks `requested` against one scope's live allocations.
pub fn check(index: &ScopeIndex, requested: &AddressBlock, mode: AvailabilityMode) -> CheckResult {
    resolve(requested, mode, conflicts(index, requested))
}

/// First free `prefix` block inside `parent` starting at or after `cursor`,
/// wrapping around to the start of `parent` when nothing fits past it.
pub fn first_fit(
    index: &ScopeIndex,
    parent: &AddressBlock,
    prefix: u8,
    cursor: u128,
) -> Option<AddressBlock> {
    first_fit_among(parent, prefix, cursor, &conflicts(index, parent))
}

/// [`first_fit`] over occupied blocks gathered earlier, ascending by start.
pub fn first_fit_among(
    parent: &AddressBlock,
    prefix: u8,
    cursor: u128,
    occupied: &[AddressBlock],
) -> Option<AddressBlock> {
    if prefix < parent.prefix_len() || prefix > parent.family().width() {
        return None;
    }
    let free = punch_holes(parent, occupied);
    let fits = |block: &&AddressBlock| block.prefix_len() <= prefix;
    let host_bits = u32::from(parent.family().width() - prefix);

    let past_cursor = free.iter().filter(fits).find_map(|block| {
        if block.last() < cursor {
            return None;
        }
        let start = align_up(cursor, host_bits)?.max(block.first());
        (start <= block.last()).then(|| AddressBlock::aligned(parent.family(), start, prefix))
    });
    past_cursor.or_else(|| {
        free.iter()
            .find(fits)
            .map(|block| AddressBlock::aligned(parent.family(), block.first(), prefix))
    })
}

fn align_up(value: u128, bits: u32) -> Option<u128> {
    if bits >= 128 {
        return (value == 0).then_some(0);
    }
    let mask = (1u128 << bits) - 1;
    if value & mask == 0 {
        Some(value)
    } else {
        (value | mask).checked_add(1)
    }
}
