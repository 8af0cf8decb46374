//! Subnetting and supernetting arithmetic.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, IpSubnets, Ipv4Subnets, Ipv6Subnets};

use super::{same_family, AddressBlock, Family};
use crate::error::{ParseError, Result};

/// Blocks covering exactly `a \ b`, ascending by start.
///
/// Disjoint operands return `[a]`, and `b ⊇ a` returns nothing. When `b` sits
/// strictly inside `a` the result is one sibling per bit between the two
/// prefix lengths.
pub fn subtract(a: &AddressBlock, b: &AddressBlock) -> Result<Vec<AddressBlock>> {
    same_family(a, b)?;
    if !a.meets(b) {
        return Ok(vec![*a]);
    }
    Ok(punch_holes(a, std::slice::from_ref(b)))
}

/// The common sub-range of two blocks, if any.
///
/// CIDR ranges are either nested or disjoint, so the intersection is always
/// the narrower operand.
pub fn intersect(a: &AddressBlock, b: &AddressBlock) -> Result<Option<AddressBlock>> {
    same_family(a, b)?;
    if !a.meets(b) {
        return Ok(None);
    }
    Ok(Some(if a.prefix_len() >= b.prefix_len() { *a } else { *b }))
}

/// The enclosing block with the shorter prefix `new_prefix`.
pub fn supernet(block: &AddressBlock, new_prefix: u8) -> std::result::Result<AddressBlock, ParseError> {
    let out_of_range = ParseError::PrefixOutOfRange {
        prefix: u16::from(new_prefix),
        family: block.family(),
        max: block.prefix_len(),
    };
    if new_prefix > block.prefix_len() {
        return Err(out_of_range);
    }
    IpNet::new(block.network_addr(), new_prefix)
        .map(AddressBlock::from_net)
        .map_err(|_| out_of_range)
}

/// Iterates every `new_prefix` block inside `block`, lowest first.
pub fn subnets(block: &AddressBlock, new_prefix: u8) -> std::result::Result<Subnets, ParseError> {
    let family = block.family();
    let out_of_range = ParseError::PrefixOutOfRange {
        prefix: u16::from(new_prefix),
        family,
        max: family.width(),
    };
    if new_prefix < block.prefix_len() {
        return Err(out_of_range);
    }
    let inner = block.net().subnets(new_prefix).map_err(|_| out_of_range)?;
    Ok(Subnets { inner })
}

/// Iterator returned by [`subnets`].
#[derive(Clone, Debug)]
pub struct Subnets {
    inner: IpSubnets,
}

impl Iterator for Subnets {
    type Item = AddressBlock;

    fn next(&mut self) -> Option<AddressBlock> {
        self.inner.next().map(AddressBlock::from_net)
    }
}

/// `block` minus every hole, ascending.
///
/// Holes must share `block`'s family and be sorted by first address. Nested
/// or out-of-range holes are tolerated. One pass over `holes`, and each gap
/// costs at most two blocks per host bit.
pub(crate) fn punch_holes(block: &AddressBlock, holes: &[AddressBlock]) -> Vec<AddressBlock> {
    let family = block.family();
    let last = block.last();
    let mut free = Vec::new();
    let mut cursor = block.first();
    for hole in holes {
        if hole.last() < cursor {
            continue;
        }
        if hole.first() > last {
            break;
        }
        if hole.first() > cursor {
            free.extend(range_blocks(family, cursor, hole.first() - 1));
        }
        match hole.last().checked_add(1) {
            Some(next) if next <= last => cursor = next,
            _ => return free,
        }
    }
    free.extend(range_blocks(family, cursor, last));
    free
}

/// The fewest aligned blocks covering `start..=end`, ascending.
fn range_blocks(family: Family, start: u128, end: u128) -> impl Iterator<Item = AddressBlock> {
    let subnets = match family {
        // Invariant: V4 values never exceed u32::MAX.
        Family::V4 => IpSubnets::V4(Ipv4Subnets::new(
            Ipv4Addr::from(start as u32),
            Ipv4Addr::from(end as u32),
            0,
        )),
        Family::V6 => IpSubnets::V6(Ipv6Subnets::new(
            Ipv6Addr::from(start),
            Ipv6Addr::from(end),
            0,
        )),
    };
    subnets.map(AddressBlock::from_net)
}
