//! Allocation pools: a parent block carved into fixed-size children.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::block::{AddressBlock, Family};
use crate::error::ParseError;
use crate::model::{Allocation, Scope, Status};

/// A named parent block that hands out children of permitted sizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Unique pool name.
    pub name: String,
    /// Address space carved by the pool.
    pub parent: AddressBlock,
    /// Prefix lengths callers may request, ascending and deduplicated.
    pub allowed_prefixes: Vec<u8>,
    /// Scope every child allocation lands in.
    pub scope: Scope,
    /// Next-fit position inside `parent`.
    pub cursor: IpAddr,
    /// Creation time (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Pool {
    /// Validates and normalizes a new pool definition.
    pub fn new(
        name: impl Into<String>,
        parent: AddressBlock,
        allowed_prefixes: &[u8],
        scope: Scope,
        created_at: OffsetDateTime,
    ) -> Result<Self, ParseError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ParseError::EmptyField("name"));
        }
        if allowed_prefixes.is_empty() {
            return Err(ParseError::EmptyField("allowed_prefixes"));
        }
        scope.validate()?;
        let mut prefixes = allowed_prefixes.to_vec();
        prefixes.sort_unstable();
        prefixes.dedup();
        let width = parent.family().width();
        if let Some(&bad) = prefixes
            .iter()
            .find(|&&p| p < parent.prefix_len() || p > width)
        {
            return Err(ParseError::PrefixOutsideParent { prefix: bad, parent });
        }
        Ok(Self {
            name,
            parent,
            allowed_prefixes: prefixes,
            scope,
            cursor: parent.network_addr(),
            created_at,
        })
    }

    /// Fails unless `prefix` is one of the pool's sizes.
    pub fn permit(&self, prefix: u8) -> Result<(), ParseError> {
        if self.allowed_prefixes.contains(&prefix) {
            Ok(())
        } else {
            Err(ParseError::PrefixNotAllowed {
                pool: self.name.clone(),
                prefix,
            })
        }
    }

    /// Cursor as an integer address.
    pub fn cursor_bits(&self) -> u128 {
        match self.cursor {
            IpAddr::V4(v4) => u128::from(u32::from(v4)),
            IpAddr::V6(v6) => u128::from(v6),
        }
    }

    /// Cursor position after handing out `taken`, wrapping to the parent start.
    pub fn advance_past(&self, taken: &AddressBlock) -> IpAddr {
        match taken.last().checked_add(1) {
            Some(next) if next <= self.parent.last() => {
                AddressBlock::aligned(self.parent.family(), next, self.parent.family().width())
                    .network_addr()
            }
            _ => self.parent.network_addr(),
        }
    }

    /// Address family of the pool.
    pub fn family(&self) -> Family {
        self.parent.family()
    }
}

/// Address accounting for one status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusUsage {
    /// Number of allocations.
    pub count: usize,
    /// Addresses they cover.
    pub addresses: u128,
}

/// Utilization report for a pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolSummary {
    /// Pool name.
    pub pool: String,
    /// Parent block.
    pub parent: AddressBlock,
    /// Addresses in the parent block.
    pub total: u128,
    /// Addresses held by live allocations.
    pub used: u128,
    /// `total - used`.
    pub free: u128,
    /// `used / total` as a percentage with two decimals.
    pub utilization_pct: f64,
    /// Usage per status.
    pub by_status: BTreeMap<String, StatusUsage>,
    /// Allocation count per prefix length.
    pub by_prefix: BTreeMap<u8, usize>,
}

impl PoolSummary {
    /// Summarizes `allocations` that fall inside the pool's parent block.
    pub fn compute<'a>(pool: &Pool, allocations: impl IntoIterator<Item = &'a Allocation>) -> Self {
        let total = pool.parent.address_count();
        let mut used = 0u128;
        let mut by_status: BTreeMap<String, StatusUsage> = BTreeMap::new();
        let mut by_prefix = BTreeMap::new();
        for allocation in allocations {
            if allocation.scope != pool.scope
                || allocation.block.family() != pool.family()
                || !pool.parent.covers(&allocation.block)
            {
                continue;
            }
            let size = allocation.block.address_count();
            let usage = by_status
                .entry(allocation.status.as_str().to_string())
                .or_default();
            usage.count += 1;
            usage.addresses = usage.addresses.saturating_add(size);
            if allocation.status != Status::Released {
                used = used.saturating_add(size);
            }
            *by_prefix.entry(allocation.block.prefix_len()).or_insert(0) += 1;
        }
        let utilization_pct = if total == 0 {
            0.0
        } else {
            ((used as f64 / total as f64) * 10_000.0).round() / 100.0
        };
        Self {
            pool: pool.name.clone(),
            parent: pool.parent,
            total,
            used,
            free: total.saturating_sub(used),
            utilization_pct,
            by_status,
            by_prefix,
        }
    }
}
