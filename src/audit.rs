//! Append-only trail of mutation requests, refused ones included.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;

/// Kind of mutation recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Explicit block allocation.
    Allocate,
    /// Allocation released.
    Release,
    /// Pool defined.
    PoolCreate,
    /// Block carved from a pool.
    PoolAllocate,
    /// Discovered block adopted by reconciliation.
    Reconcile,
}

impl AuditAction {
    /// Stable lower-case name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditAction::Allocate => "allocate",
            AuditAction::Release => "release",
            AuditAction::PoolCreate => "pool_create",
            AuditAction::PoolAllocate => "pool_allocate",
            AuditAction::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocate" => Ok(AuditAction::Allocate),
            "release" => Ok(AuditAction::Release),
            "pool_create" => Ok(AuditAction::PoolCreate),
            "pool_allocate" => Ok(AuditAction::PoolAllocate),
            "reconcile" => Ok(AuditAction::Reconcile),
            other => Err(StoreError::Corruption(format!("unknown audit action {other:?}"))),
        }
    }
}

/// One mutation request and its outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sequence number, increasing.
    pub id: u64,
    /// Commit time, or refusal time when `ok` is false.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// Principal responsible.
    pub actor: String,
    /// Mutation kind.
    pub action: AuditAction,
    /// What was mutated, e.g. a CIDR or pool name.
    pub subject: String,
    /// Free-form context. Refused requests carry the error here.
    pub detail: String,
    /// False when the request was refused and nothing changed.
    #[serde(default = "succeeded")]
    pub ok: bool,
}

fn succeeded() -> bool {
    true
}

impl AuditEvent {
    /// Marks the event as a refused request.
    pub fn failed(mut self) -> Self {
        self.ok = false;
        self
    }
}

/// Selects audit events. The default matches everything.
///
/// Results are always newest first; `offset` skips that many matches before
/// `limit` applies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditFilter {
    /// Only this kind of mutation.
    pub action: Option<AuditAction>,
    /// Only successes (`true`) or only refusals (`false`).
    pub ok: Option<bool>,
    /// Inclusive lower bound on `at`.
    pub since: Option<OffsetDateTime>,
    /// Exclusive upper bound on `at`.
    pub until: Option<OffsetDateTime>,
    /// At most this many events.
    pub limit: Option<usize>,
    /// Matches to skip, newest first.
    pub offset: usize,
}

impl AuditFilter {
    /// The newest `limit` events of any kind.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Restricts to one action.
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Restricts to successes or refusals.
    pub fn outcome(mut self, ok: bool) -> Self {
        self.ok = Some(ok);
        self
    }

    /// Restricts to `since <= at < until`; either bound may be open.
    pub fn between(mut self, since: Option<OffsetDateTime>, until: Option<OffsetDateTime>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Skips the newest `offset` matches.
    pub fn skip(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether `event` passes every condition. Ignores paging.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.action.map_or(true, |action| event.action == action)
            && self.ok.map_or(true, |ok| event.ok == ok)
            && self.since.map_or(true, |since| event.at >= since)
            && self.until.map_or(true, |until| event.at < until)
    }
}
