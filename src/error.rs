use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::block::{AddressBlock, Family};
use crate::model::AllocationId;

/// Result alias used by every registry operation.
pub type Result<T> = std::result::Result<T, IpamError>;

/// Client input that could not be turned into a valid typed request.
///
/// Parse errors are never retried by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The text has no `/` between address and prefix length.
    #[error("missing '/' separator in CIDR literal {0:?}")]
    MissingSeparator(String),
    /// The address part is not a valid IPv4 or IPv6 address.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    /// The prefix part is not a decimal integer.
    #[error("invalid prefix length {0:?}")]
    InvalidPrefix(String),
    /// The prefix is larger than the address width of its family.
    #[error("prefix length {prefix} out of range for {family} (max {max})")]
    PrefixOutOfRange {
        /// Requested prefix length.
        prefix: u16,
        /// Family of the address part.
        family: Family,
        /// Address width of the family.
        max: u8,
    },
    /// The address has host bits set below the prefix (strict parsing only).
    #[error("{0} has host bits set")]
    HostBitsSet(String),
    /// Availability mode other than FULL or PARTIAL.
    #[error("unknown availability mode {0:?} (expected FULL or PARTIAL)")]
    UnknownMode(String),
    /// Status text that is not ALLOCATED, RESERVED or RELEASED.
    #[error("unknown allocation status {0:?}")]
    UnknownStatus(String),
    /// Allocations may only be created ALLOCATED or RESERVED.
    #[error("allocations cannot be created with status RELEASED")]
    ReleasedOnCreate,
    /// A required text field was empty.
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
    /// Pool does not permit the requested prefix length.
    #[error("prefix /{prefix} is not allowed by pool '{pool}'")]
    PrefixNotAllowed {
        /// Pool name.
        pool: String,
        /// Requested prefix length.
        prefix: u8,
    },
    /// A pool's allowed prefix cannot be carved from its parent block.
    #[error("allowed prefix /{prefix} does not fit inside {parent}")]
    PrefixOutsideParent {
        /// Offending prefix length.
        prefix: u8,
        /// Pool parent block.
        parent: AddressBlock,
    },
    /// A pool with the same name already exists.
    #[error("pool '{0}' already exists")]
    DuplicatePool(String),
}

/// Why a commit attempt gave up without a definitive conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The commit deadline elapsed while waiting for the scope guard.
    Deadline,
    /// Every permitted attempt found the scope guard contended.
    Attempts,
    /// The caller cancelled before the commit point.
    Cancelled,
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TimeoutCause::Deadline => "deadline exceeded",
            TimeoutCause::Attempts => "attempt budget exhausted",
            TimeoutCause::Cancelled => "cancelled before commit",
        };
        f.write_str(text)
    }
}

/// What a `NotFound` error was looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// A live allocation id within the given scope.
    Allocation(AllocationId),
    /// A pool by name.
    Pool(String),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Allocation(id) => write!(f, "allocation {id}"),
            Missing::Pool(name) => write!(f, "pool '{name}'"),
        }
    }
}

/// Failure reported by the durability collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite returned an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// I/O failure around the store files.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corruption(String),
    /// Injected or backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Every failure surfaced by the registry.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Malformed client input.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// IPv4 and IPv6 operands were mixed.
    #[error("address family mismatch: {left} vs {right}")]
    FamilyMismatch {
        /// Family of the left operand.
        left: Family,
        /// Family of the right operand.
        right: Family,
    },
    /// The requested block overlaps live allocations.
    #[error("{requested} conflicts with {}", join_blocks(.conflicts))]
    Conflict {
        /// Block the caller asked for.
        requested: AddressBlock,
        /// Occupied blocks overlapping the request, ascending by start.
        conflicts: Vec<AddressBlock>,
    },
    /// The referenced allocation or pool does not exist.
    #[error("{0} not found")]
    NotFound(Missing),
    /// The commit protocol gave up.
    #[error("commit timed out after {attempts} attempt(s) in {elapsed:?}: {cause}")]
    Timeout {
        /// Attempts made before giving up.
        attempts: u32,
        /// Wall time spent in the commit protocol.
        elapsed: Duration,
        /// Reason for giving up.
        cause: TimeoutCause,
    },
    /// A pool has no free block of the requested size.
    #[error("pool '{pool}' has no free /{prefix} block")]
    Exhausted {
        /// Pool name.
        pool: String,
        /// Requested prefix length.
        prefix: u8,
    },
    /// The durability collaborator failed; nothing was committed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl IpamError {
    /// Returns true when the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpamError::Timeout {
                cause: TimeoutCause::Deadline | TimeoutCause::Attempts,
                ..
            }
        )
    }

    /// Occupied blocks carried by a conflict, empty for other kinds.
    pub fn conflicts(&self) -> &[AddressBlock] {
        match self {
            IpamError::Conflict { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

fn join_blocks(blocks: &[AddressBlock]) -> String {
    blocks
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
