//! CIDR allocation registry.
//!
//! The crate keeps, per scope, the set of live IP address blocks and hands out
//! new ones atomically: a block is claimed only if it overlaps nothing already
//! live in the same scope, even under concurrent requests. Allocations are
//! persisted through an [`AllocationStore`] before they become visible.
//!
//! ```no_run
//! use ipam::{AddressBlock, AvailabilityMode, Metadata, Registry, RegistryConfig, Scope};
//!
//! let registry = Registry::in_memory(RegistryConfig::default())?;
//! let scope = Scope::new("vpc-1", "eu-west-1");
//! let block: AddressBlock = "10.0.0.0/24".parse()?;
//! let allocation = registry.allocate(
//!     &scope,
//!     &block,
//!     &Metadata::new("subnet", "frontend"),
//!     AvailabilityMode::Full,
//! )?;
//! registry.release(&scope, allocation.id)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

pub mod audit;
pub mod block;
pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod store;

pub use audit::{AuditAction, AuditEvent, AuditFilter};
pub use block::{AddressBlock, Family};
pub use config::{ConfigError, FileConfig, RegistryConfig};
pub use error::{IpamError, Missing, ParseError, Result, StoreError, TimeoutCause};
pub use metrics::MetricsSnapshot;
pub use model::{Allocation, AllocationId, AvailabilityMode, Metadata, Scope, ScopeKey, Status};
pub use pool::{Pool, PoolSummary, StatusUsage};
pub use registry::{
    CancelToken, CommitOptions, DiscoveredBlock, PoolGrant, ReconcileConflict, ReconcileFailure,
    ReconcileReport, Registry, TxState,
};
pub use resolver::CheckResult;
pub use store::{AllocationStore, MemoryStore, Record, SqliteStore};
