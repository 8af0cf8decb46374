//! Typed records for allocations, scopes and request metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::block::{AddressBlock, Family};
use crate::error::ParseError;

/// Registry-assigned allocation identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// In use by a resource.
    Allocated,
    /// Held for a resource that does not exist yet.
    Reserved,
    /// Freed; kept for audit only.
    Released,
}

impl Status {
    /// Upper-case wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Allocated => "ALLOCATED",
            Status::Reserved => "RESERVED",
            Status::Released => "RELEASED",
        }
    }

    /// ALLOCATED and RESERVED entries occupy address space.
    pub const fn is_live(self) -> bool {
        !matches!(self, Status::Released)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOCATED" => Ok(Status::Allocated),
            "RESERVED" => Ok(Status::Reserved),
            "RELEASED" => Ok(Status::Released),
            _ => Err(ParseError::UnknownStatus(s.to_string())),
        }
    }
}

/// How `check` and `allocate` treat a partially occupied request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityMode {
    /// The whole block must be free.
    #[default]
    Full,
    /// Any free sub-block is enough.
    Partial,
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityMode::Full => f.write_str("FULL"),
            AvailabilityMode::Partial => f.write_str("PARTIAL"),
        }
    }
}

impl FromStr for AvailabilityMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" => Ok(AvailabilityMode::Full),
            "PARTIAL" => Ok(AvailabilityMode::Partial),
            _ => Err(ParseError::UnknownMode(s.to_string())),
        }
    }
}

/// The VPC and region an allocation belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// VPC identifier.
    pub vpc: String,
    /// Region name.
    pub region: String,
}

impl Scope {
    /// Creates a scope from its two identifiers.
    pub fn new(vpc: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            vpc: vpc.into(),
            region: region.into(),
        }
    }

    /// Rejects empty identifiers.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.vpc.trim().is_empty() {
            return Err(ParseError::EmptyField("vpc"));
        }
        if self.region.trim().is_empty() {
            return Err(ParseError::EmptyField("region"));
        }
        Ok(())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vpc, self.region)
    }
}

/// Conflict-detection boundary an allocation is indexed under.
///
/// With a shared address space every VPC+region pair is its own boundary;
/// otherwise all VPCs compete for one space per address family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// One space per family for the whole registry.
    Global(Family),
    /// One space per VPC, region and family.
    Vpc {
        /// VPC identifier.
        vpc: String,
        /// Region name.
        region: String,
        /// Address family.
        family: Family,
    },
}

impl ScopeKey {
    /// Resolves the key for `scope` and `family` under the sharing rule.
    pub fn resolve(scope: &Scope, family: Family, shared_address_space: bool) -> Self {
        if shared_address_space {
            ScopeKey::Vpc {
                vpc: scope.vpc.clone(),
                region: scope.region.clone(),
                family,
            }
        } else {
            ScopeKey::Global(family)
        }
    }

    /// Address family the key partitions.
    pub fn family(&self) -> Family {
        match self {
            ScopeKey::Global(family) | ScopeKey::Vpc { family, .. } => *family,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global(family) => write!(f, "global:{family}"),
            ScopeKey::Vpc {
                vpc,
                region,
                family,
            } => write!(f, "{vpc}/{region}:{family}"),
        }
    }
}

/// Descriptive fields supplied with an allocation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Kind of resource, e.g. `subnet`.
    pub resource_type: String,
    /// Resource name.
    pub resource_name: String,
    /// Principal creating the allocation.
    #[serde(default = "default_principal")]
    pub created_by: String,
    /// Initial status; ALLOCATED unless the caller reserves.
    #[serde(default = "default_status")]
    pub status: Status,
}

fn default_principal() -> String {
    "system".to_string()
}

fn default_status() -> Status {
    Status::Allocated
}

impl Metadata {
    /// ALLOCATED metadata created by `system`.
    pub fn new(resource_type: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            created_by: default_principal(),
            status: Status::Allocated,
        }
    }

    /// Sets the creating principal.
    pub fn created_by(mut self, principal: impl Into<String>) -> Self {
        self.created_by = principal.into();
        self
    }

    /// Sets the initial status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Rejects empty fields and RELEASED as an initial status.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.resource_type.trim().is_empty() {
            return Err(ParseError::EmptyField("resource_type"));
        }
        if self.resource_name.trim().is_empty() {
            return Err(ParseError::EmptyField("resource_name"));
        }
        if self.created_by.trim().is_empty() {
            return Err(ParseError::EmptyField("created_by"));
        }
        if !self.status.is_live() {
            return Err(ParseError::ReleasedOnCreate);
        }
        Ok(())
    }
}

/// A committed allocation record.
///
/// Block, scope and resource fields never change after creation; only the
/// status moves to RELEASED.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique identifier.
    pub id: AllocationId,
    /// Occupied block.
    pub block: AddressBlock,
    /// Owning VPC and region.
    pub scope: Scope,
    /// Kind of resource.
    pub resource_type: String,
    /// Resource name.
    pub resource_name: String,
    /// Current status.
    pub status: Status,
    /// Principal that created the allocation.
    pub created_by: String,
    /// Creation time (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Release time, once released.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub released_at: Option<OffsetDateTime>,
}

impl Allocation {
    pub(crate) fn from_request(
        id: AllocationId,
        block: AddressBlock,
        scope: &Scope,
        metadata: &Metadata,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            block,
            scope: scope.clone(),
            resource_type: metadata.resource_type.clone(),
            resource_name: metadata.resource_name.clone(),
            status: metadata.status,
            created_by: metadata.created_by.clone(),
            created_at,
            released_at: None,
        }
    }

    /// True while the allocation occupies its block.
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}
