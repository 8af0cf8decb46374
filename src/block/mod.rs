//! CIDR address blocks.
//!
//! An [`AddressBlock`] wraps an [`ipnet::IpNet`] whose host bits are always
//! cleared, so every value is in canonical form and two blocks with equal
//! ranges compare equal. The index works on the integer view exposed by
//! [`AddressBlock::first`] and [`AddressBlock::last`].

mod arith;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{IpamError, ParseError, Result};

pub use arith::{intersect, subnets, subtract, supernet, Subnets};
pub(crate) use arith::punch_holes;

/// IP address family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Family {
    /// 32-bit addresses.
    V4,
    /// 128-bit addresses.
    V6,
}

impl Family {
    /// Number of bits in an address of this family.
    pub const fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Largest integer address of this family.
    pub(crate) const fn max_addr(self) -> u128 {
        match self {
            Family::V4 => u32::MAX as u128,
            Family::V6 => u128::MAX,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// A canonical CIDR block.
///
/// `IpNet` orders V4 before V6, then by network address, then by prefix
/// length. The index and resolver report blocks in that order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressBlock {
    net: IpNet,
}

impl AddressBlock {
    /// Builds a block from an address and prefix, clearing any host bits.
    pub fn new(addr: IpAddr, prefix: u8) -> std::result::Result<Self, ParseError> {
        let family = Family::of(&addr);
        let net = IpNet::new(addr, prefix).map_err(|_| ParseError::PrefixOutOfRange {
            prefix: u16::from(prefix),
            family,
            max: family.width(),
        })?;
        Ok(Self { net: net.trunc() })
    }

    /// Builds a block from a raw integer address, clearing any host bits.
    pub fn from_bits(family: Family, raw: u128, prefix: u8) -> std::result::Result<Self, ParseError> {
        if raw > family.max_addr() {
            return Err(ParseError::InvalidAddress(raw.to_string()));
        }
        Self::new(to_ip(family, raw), prefix)
    }

    /// Caller guarantees `prefix <= family.width()` and `raw` fits the family.
    pub(crate) fn aligned(family: Family, raw: u128, prefix: u8) -> Self {
        let net = match family {
            // Invariant: V4 values never exceed u32::MAX.
            Family::V4 => IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::from(raw as u32), prefix)),
            Family::V6 => IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::from(raw), prefix)),
        };
        Self { net: net.trunc() }
    }

    pub(crate) fn from_net(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }

    /// Parses `addr/prefix`, masking host bits into canonical form.
    pub fn parse(text: &str) -> std::result::Result<Self, ParseError> {
        let trimmed = text.trim();
        match trimmed.parse::<IpNet>() {
            Ok(net) => Ok(Self::from_net(net)),
            Err(_) => Err(diagnose(trimmed)),
        }
    }

    /// Parses `addr/prefix` and rejects literals with host bits set.
    pub fn parse_strict(text: &str) -> std::result::Result<Self, ParseError> {
        let trimmed = text.trim();
        let net = trimmed.parse::<IpNet>().map_err(|_| diagnose(trimmed))?;
        if net.trunc() != net {
            return Err(ParseError::HostBitsSet(trimmed.to_string()));
        }
        Ok(Self { net })
    }

    /// The underlying `ipnet` network.
    pub fn net(&self) -> IpNet {
        self.net
    }

    /// Address family of the block.
    pub fn family(&self) -> Family {
        match self.net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Number of host bits (`width - prefix`).
    pub fn host_bits(&self) -> u8 {
        self.net.max_prefix_len() - self.net.prefix_len()
    }

    /// First address of the range as an integer.
    pub fn first(&self) -> u128 {
        to_bits(self.net.network())
    }

    /// Last address of the range (inclusive) as an integer.
    pub fn last(&self) -> u128 {
        to_bits(self.net.broadcast())
    }

    /// Network address.
    pub fn network_addr(&self) -> IpAddr {
        self.net.network()
    }

    /// Last address in the block.
    pub fn last_addr(&self) -> IpAddr {
        self.net.broadcast()
    }

    /// Number of addresses covered, saturating at `u128::MAX` for `::/0`.
    pub fn address_count(&self) -> u128 {
        1u128.checked_shl(u32::from(self.host_bits())).unwrap_or(u128::MAX)
    }

    /// True iff every address of `other` lies inside `self`.
    pub fn contains(&self, other: &AddressBlock) -> Result<bool> {
        same_family(self, other)?;
        Ok(self.covers(other))
    }

    /// True iff the ranges of `self` and `other` intersect.
    pub fn overlaps(&self, other: &AddressBlock) -> Result<bool> {
        same_family(self, other)?;
        Ok(self.meets(other))
    }

    /// Unchecked containment; callers have already matched families.
    pub(crate) fn covers(&self, other: &AddressBlock) -> bool {
        self.net.contains(&other.net)
    }

    /// Unchecked overlap. CIDR ranges are nested or disjoint.
    pub(crate) fn meets(&self, other: &AddressBlock) -> bool {
        self.covers(other) || other.covers(self)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.net, f)
    }
}

impl FromStr for AddressBlock {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AddressBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        AddressBlock::parse_strict(&text).map_err(serde::de::Error::custom)
    }
}

/// Fails with `FamilyMismatch` unless both blocks share a family.
pub fn same_family(a: &AddressBlock, b: &AddressBlock) -> Result<()> {
    if a.family() != b.family() {
        return Err(IpamError::FamilyMismatch {
            left: a.family(),
            right: b.family(),
        });
    }
    Ok(())
}

/// Returns the canonical text of a CIDR literal (host bits cleared).
pub fn canonicalize(text: &str) -> std::result::Result<String, ParseError> {
    AddressBlock::parse(text).map(|block| block.to_string())
}

fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub(crate) fn to_ip(family: Family, raw: u128) -> IpAddr {
    match family {
        // Invariant: V4 values never exceed u32::MAX.
        Family::V4 => IpAddr::V4(Ipv4Addr::from(raw as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(raw)),
    }
}

/// Explains why `ipnet` refused a literal.
fn diagnose(text: &str) -> ParseError {
    let Some((addr, prefix)) = text.split_once('/') else {
        return ParseError::MissingSeparator(text.to_string());
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return ParseError::InvalidAddress(addr.to_string());
    };
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return ParseError::InvalidPrefix(prefix.to_string());
    }
    let family = Family::of(&addr);
    ParseError::PrefixOutOfRange {
        prefix: prefix.parse().unwrap_or(u16::MAX),
        family,
        max: family.width(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str) -> AddressBlock {
        AddressBlock::parse(text).expect("valid block")
    }

    #[test]
    fn parse_masks_host_bits() {
        let b = block("10.0.0.77/24");
        assert_eq!(b.to_string(), "10.0.0.0/24");
        assert_eq!(b.address_count(), 256);
        assert_eq!(b.last_addr().to_string(), "10.0.0.255");
    }

    #[test]
    fn strict_parse_rejects_host_bits() {
        assert!(matches!(
            AddressBlock::parse_strict("10.0.0.1/24"),
            Err(ParseError::HostBitsSet(_))
        ));
        assert!(AddressBlock::parse_strict("10.0.0.0/24").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_literals() {
        assert!(matches!(
            AddressBlock::parse("10.0.0.0"),
            Err(ParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            AddressBlock::parse("10.0.0.256/24"),
            Err(ParseError::InvalidAddress(_))
        ));
        assert!(matches!(
            AddressBlock::parse("10.0.0.0/"),
            Err(ParseError::InvalidPrefix(_))
        ));
        assert!(matches!(
            AddressBlock::parse("10.0.0.0/-1"),
            Err(ParseError::InvalidPrefix(_))
        ));
        assert!(matches!(
            AddressBlock::parse("10.0.0.0/33"),
            Err(ParseError::PrefixOutOfRange { prefix: 33, .. })
        ));
        assert!(matches!(
            AddressBlock::parse("2001:db8::/129"),
            Err(ParseError::PrefixOutOfRange { max: 128, .. })
        ));
        assert!(matches!(
            AddressBlock::parse("10.0.0.0/99999999"),
            Err(ParseError::PrefixOutOfRange { .. })
        ));
    }

    #[test]
    fn extreme_prefixes() {
        let all_v4 = block("1.2.3.4/0");
        assert_eq!(all_v4.to_string(), "0.0.0.0/0");
        assert_eq!(all_v4.last(), u128::from(u32::MAX));
        let all_v6 = block("::/0");
        assert_eq!(all_v6.address_count(), u128::MAX);
        assert_eq!(all_v6.last(), u128::MAX);
        let host = block("2001:db8::1/128");
        assert_eq!(host.address_count(), 1);
        assert_eq!(host.host_bits(), 0);
    }

    #[test]
    fn containment_and_overlap() {
        let wide = block("10.0.0.0/16");
        let narrow = block("10.0.4.0/24");
        let other = block("10.1.0.0/24");
        assert!(wide.contains(&narrow).unwrap());
        assert!(!narrow.contains(&wide).unwrap());
        assert!(wide.overlaps(&narrow).unwrap());
        assert!(narrow.overlaps(&wide).unwrap());
        assert!(!wide.overlaps(&other).unwrap());
        assert!(wide.contains(&wide).unwrap());
    }

    #[test]
    fn family_mismatch_is_an_error() {
        let v4 = block("10.0.0.0/8");
        let v6 = block("fd00::/8");
        assert!(matches!(
            v4.overlaps(&v6),
            Err(IpamError::FamilyMismatch {
                left: Family::V4,
                right: Family::V6
            })
        ));
    }

    #[test]
    fn ipv6_display_is_compressed() {
        assert_eq!(block("2001:0db8:0000::/32").to_string(), "2001:db8::/32");
        assert_eq!(canonicalize(" fd00::1/64 ").unwrap(), "fd00::/64");
    }

    #[test]
    fn wraps_a_truncated_ipnet() {
        let b = block("10.1.2.3/16");
        let expected: IpNet = "10.1.0.0/16".parse().unwrap();
        assert_eq!(b.net(), expected);
        assert_eq!(AddressBlock::from_net("10.1.2.3/16".parse().unwrap()), b);
        assert!(block("10.0.0.0/8") < block("10.0.0.0/9"));
        assert!(block("10.0.0.0/9") < block("10.128.0.0/9"));
        assert!(block("255.0.0.0/8") < block("::/0"));
    }

    #[test]
    fn serde_uses_cidr_text() {
        let b = block("192.168.0.0/16");
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "\"192.168.0.0/16\"");
        let back: AddressBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
