//! The registry: the single write path into the allocation index.
//!
//! Every mutation follows the same protocol: validate inputs, copy what the
//! plan needs out of a consistent read of the target scope, plan with no lock
//! held, take the scope's commit guard, re-plan if another writer published
//! meanwhile, take the scope's index for writing, persist the change and its
//! audit event in one store batch, and only then publish it to readers. Every
//! lock wait is bounded by attempts and a deadline. A failed or cancelled
//! request leaves neither the store nor the index changed; it is recorded in
//! the audit trail as a refused event.

mod commit;
mod pools;
mod reconcile;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditFilter};
use crate::block::AddressBlock;
use crate::config::RegistryConfig;
use crate::error::{IpamError, Missing, Result};
use crate::index::{AllocationIndex, ScopeIndex, ScopeSlot};
use crate::metrics::{MetricsSnapshot, RegistryMetrics};
use crate::model::{Allocation, AllocationId, AvailabilityMode, Metadata, Scope, Status};
use crate::pool::Pool;
use crate::resolver::{self, CheckResult};
use crate::store::{AllocationStore, MemoryStore, Record};

use commit::{Budget, Commit};

pub use commit::{CancelToken, CommitOptions, TxState};
pub use pools::PoolGrant;
pub use reconcile::{DiscoveredBlock, ReconcileConflict, ReconcileFailure, ReconcileReport};

/// CIDR allocation registry over an injected store.
#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    store: Arc<dyn AllocationStore>,
    index: AllocationIndex,
    pools: RwLock<BTreeMap<String, Arc<Mutex<Pool>>>>,
    next_id: AtomicU64,
    next_audit_id: AtomicU64,
    clock: Mutex<OffsetDateTime>,
    metrics: RegistryMetrics,
}

impl Registry {
    /// Loads persisted state from `store` and rebuilds the index.
    ///
    /// Live records that overlap each other (possible only if the store was
    /// written by something else) are loaded anyway and logged, so that
    /// nothing already handed out is silently forgotten.
    pub fn open(store: Arc<dyn AllocationStore>, config: RegistryConfig) -> Result<Self> {
        let snapshot = store.load()?;
        let index = AllocationIndex::new(config.shared_address_space);
        let mut max_id = 0;
        let mut latest = OffsetDateTime::UNIX_EPOCH;
        let mut live = 0usize;
        for allocation in snapshot.allocations {
            max_id = max_id.max(allocation.id.0);
            latest = latest.max(allocation.created_at);
            if let Some(released_at) = allocation.released_at {
                latest = latest.max(released_at);
            }
            if !allocation.is_live() {
                continue;
            }
            let slot = index.slot(&index.key_for(&allocation.scope, allocation.block.family()));
            let mut writer = slot.writer();
            let overlapping: Vec<AllocationId> = writer
                .index()
                .query_overlaps(&allocation.block)
                .into_iter()
                .map(|existing| existing.id)
                .collect();
            if !overlapping.is_empty() {
                warn!(
                    allocation_id = %allocation.id,
                    block = %allocation.block,
                    scope = %slot.key(),
                    ?overlapping,
                    "registry.open.overlapping_records"
                );
            }
            writer.insert(allocation);
            live += 1;
        }
        let mut pools = BTreeMap::new();
        for pool in snapshot.pools {
            latest = latest.max(pool.created_at);
            pools.insert(pool.name.clone(), Arc::new(Mutex::new(pool)));
        }
        info!(
            live,
            pools = pools.len(),
            shared_address_space = config.shared_address_space,
            "registry.open"
        );
        Ok(Self {
            config,
            store,
            index,
            pools: RwLock::new(pools),
            next_id: AtomicU64::new(max_id + 1),
            next_audit_id: AtomicU64::new(snapshot.last_audit_id + 1),
            clock: Mutex::new(latest),
            metrics: RegistryMetrics::default(),
        })
    }

    /// Registry over a fresh [`MemoryStore`].
    pub fn in_memory(config: RegistryConfig) -> Result<Self> {
        Self::open(Arc::new(MemoryStore::new()), config)
    }

    /// Active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Atomically checks and claims `block` in `scope`.
    ///
    /// In FULL mode the whole block must be free. In PARTIAL mode the widest
    /// free sub-block is claimed instead (lowest address among equals), and
    /// the request fails only when nothing inside it is free.
    pub fn allocate(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        metadata: &Metadata,
        mode: AvailabilityMode,
    ) -> Result<Allocation> {
        self.allocate_with(scope, block, metadata, mode, &CommitOptions::default())
    }

    /// [`allocate`](Self::allocate) with cancellation and deadline control.
    pub fn allocate_with(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        metadata: &Metadata,
        mode: AvailabilityMode,
        options: &CommitOptions,
    ) -> Result<Allocation> {
        self.claim(scope, block, metadata, mode, options, AuditAction::Allocate)
    }

    fn claim(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        metadata: &Metadata,
        mode: AvailabilityMode,
        options: &CommitOptions,
        action: AuditAction,
    ) -> Result<Allocation> {
        self.try_claim(scope, block, metadata, mode, options, action)
            .inspect_err(|err| {
                self.record_refusal(
                    &metadata.created_by,
                    action,
                    block.to_string(),
                    format!("scope={scope} resource={} mode={mode}", metadata.resource_name),
                    err,
                );
            })
    }

    fn try_claim(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        metadata: &Metadata,
        mode: AvailabilityMode,
        options: &CommitOptions,
        action: AuditAction,
    ) -> Result<Allocation> {
        scope.validate()?;
        metadata.validate()?;
        let slot = self.index.slot(&self.index.key_for(scope, block.family()));
        let allocation = self.commit(&slot, options).run(
            |index| resolver::conflicts(index, block),
            |conflicts| plan_claim(block, mode, conflicts),
            |writer, target| {
                let allocation = Allocation::from_request(
                    self.next_allocation_id(),
                    target,
                    scope,
                    metadata,
                    self.now(),
                );
                let event = self.audit_event(
                    allocation.created_at,
                    &metadata.created_by,
                    action,
                    target.to_string(),
                    format!("id={} scope={} resource={}", allocation.id, scope, metadata.resource_name),
                );
                self.store.apply(&[
                    Record::InsertAllocation(allocation.clone()),
                    Record::Audit(event),
                ])?;
                writer.insert(allocation.clone());
                Ok(allocation)
            },
        )?;
        self.metrics.record_commit();
        info!(
            allocation_id = %allocation.id,
            block = %allocation.block,
            scope = %scope,
            %mode,
            action = %action,
            "registry.allocate.committed"
        );
        Ok(allocation)
    }

    /// Marks an allocation RELEASED and frees its block.
    ///
    /// Unknown ids, ids owned by another scope, and ids already released all
    /// yield `NotFound`.
    pub fn release(&self, scope: &Scope, id: AllocationId) -> Result<Allocation> {
        self.release_with(scope, id, &CommitOptions::default())
    }

    /// [`release`](Self::release) with cancellation and deadline control.
    pub fn release_with(
        &self,
        scope: &Scope,
        id: AllocationId,
        options: &CommitOptions,
    ) -> Result<Allocation> {
        self.try_release(scope, id, options).inspect_err(|err| {
            self.record_refusal(
                "system",
                AuditAction::Release,
                format!("id={id}"),
                format!("scope={scope}"),
                err,
            );
        })
    }

    fn try_release(
        &self,
        scope: &Scope,
        id: AllocationId,
        options: &CommitOptions,
    ) -> Result<Allocation> {
        let missing = || IpamError::NotFound(Missing::Allocation(id));
        let wait = options
            .deadline
            .unwrap_or_else(|| self.config.commit_deadline());
        let slot = self.index.locate(scope, id, wait)?.ok_or_else(missing)?;
        let released = self.commit(&slot, options).run(
            |index| {
                index
                    .get(id)
                    .filter(|allocation| allocation.scope == *scope)
                    .cloned()
            },
            |found| found.ok_or_else(missing),
            |writer, mut allocation| {
                let at = self.now();
                let event = self.audit_event(
                    at,
                    &allocation.created_by,
                    AuditAction::Release,
                    allocation.block.to_string(),
                    format!("id={id} scope={scope}"),
                );
                self.store
                    .apply(&[Record::MarkReleased { id, at }, Record::Audit(event)])?;
                writer.remove(id);
                allocation.status = Status::Released;
                allocation.released_at = Some(at);
                Ok(allocation)
            },
        )?;
        self.metrics.record_release();
        info!(allocation_id = %id, block = %released.block, scope = %scope, "registry.release");
        Ok(released)
    }

    /// Reports whether `block` is free in `scope` without claiming it.
    ///
    /// The answer reflects a consistent snapshot but may be stale by the time
    /// the caller acts on it; only [`allocate`](Self::allocate) is
    /// authoritative. Only the conflict lookup holds the scope's read lock,
    /// and waiting for it is bounded by the commit deadline.
    pub fn check(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        mode: AvailabilityMode,
    ) -> Result<CheckResult> {
        scope.validate()?;
        self.metrics.record_check();
        let conflicts = self.read_scope(scope, block, resolver::conflicts)?;
        let result = resolver::resolve(block, mode, conflicts);
        debug!(
            block = %block,
            scope = %scope,
            %mode,
            is_free = result.is_free,
            conflicts = result.conflicts.len(),
            "registry.check"
        );
        Ok(result)
    }

    /// Live allocations in `scope`'s conflict boundary overlapping `block`,
    /// ascending by start.
    pub fn overlapping(&self, scope: &Scope, block: &AddressBlock) -> Result<Vec<Allocation>> {
        self.read_scope(scope, block, |index, block| {
            index.query_overlaps(block).into_iter().cloned().collect()
        })
    }

    /// Runs `read` against the scope `block` is checked in, or returns the
    /// default when nothing was ever indexed there.
    fn read_scope<T: Default>(
        &self,
        scope: &Scope,
        block: &AddressBlock,
        read: impl FnOnce(&ScopeIndex, &AddressBlock) -> T,
    ) -> Result<T> {
        let key = self.index.key_for(scope, block.family());
        let Some(slot) = self.index.existing_slot(&key) else {
            return Ok(T::default());
        };
        let index = slot
            .read_within(self.config.commit_deadline())
            .inspect_err(|_| {
                self.metrics.record_timeout();
                debug!(scope = %slot.key(), "registry.read.timeout");
            })?;
        Ok(read(&index, block))
    }

    /// Every allocation, released ones included, newest first.
    pub fn list(&self, scope: Option<&Scope>) -> Result<Vec<Allocation>> {
        let mut allocations = self.store.allocations()?;
        if let Some(scope) = scope {
            allocations.retain(|allocation| allocation.scope == *scope);
        }
        allocations.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(allocations)
    }

    /// One allocation by id, released ones included.
    pub fn get(&self, id: AllocationId) -> Result<Allocation> {
        self.store
            .allocation(id)?
            .ok_or(IpamError::NotFound(Missing::Allocation(id)))
    }

    /// The newest `limit` audit events, newest first.
    pub fn audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.audit_query(&AuditFilter::latest(limit))
    }

    /// Audit events passing `filter`, newest first.
    pub fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        Ok(self.store.audit(filter)?)
    }

    /// Number of live allocations across all scopes.
    pub fn live_count(&self) -> usize {
        self.index.live_count()
    }

    /// Operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn commit<'a>(&'a self, slot: &'a ScopeSlot, options: &'a CommitOptions) -> Commit<'a> {
        let budget = Budget {
            max_attempts: self.config.max_attempts.max(1),
            lock_wait: self.config.lock_wait(),
            deadline: options
                .deadline
                .unwrap_or_else(|| self.config.commit_deadline()),
        };
        Commit::new(slot, options, &self.metrics, budget)
    }

    fn next_allocation_id(&self) -> AllocationId {
        AllocationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Wall-clock time, never earlier than any timestamp handed out before.
    fn now(&self) -> OffsetDateTime {
        let mut last = self.clock.lock();
        let now = OffsetDateTime::now_utc().max(*last);
        *last = now;
        now
    }

    fn audit_event(
        &self,
        at: OffsetDateTime,
        actor: &str,
        action: AuditAction,
        subject: String,
        detail: String,
    ) -> AuditEvent {
        AuditEvent {
            id: self.next_audit_id.fetch_add(1, Ordering::SeqCst),
            at,
            actor: actor.to_string(),
            action,
            subject,
            detail,
            ok: true,
        }
    }

    /// Appends a refused-request event in a batch of its own.
    ///
    /// Storage failures are not recorded: the event would go to the store
    /// that just failed. A refusal that cannot be recorded is logged and
    /// does not replace the caller's error.
    fn record_refusal(
        &self,
        actor: &str,
        action: AuditAction,
        subject: String,
        context: String,
        err: &IpamError,
    ) {
        if matches!(err, IpamError::Storage(_)) {
            return;
        }
        let actor = if actor.trim().is_empty() { "system" } else { actor };
        let event = self
            .audit_event(self.now(), actor, action, subject, format!("{context} error={err}"))
            .failed();
        if let Err(store_err) = self.store.apply(&[Record::Audit(event)]) {
            warn!(%action, error = %store_err, "registry.audit.refusal_not_recorded");
        }
    }
}

fn plan_claim(
    block: &AddressBlock,
    mode: AvailabilityMode,
    conflicts: Vec<AddressBlock>,
) -> Result<AddressBlock> {
    let result = resolver::resolve(block, mode, conflicts);
    let target = match mode {
        AvailabilityMode::Full => result.is_free.then_some(*block),
        AvailabilityMode::Partial => result.largest_free(),
    };
    target.ok_or(IpamError::Conflict {
        requested: *block,
        conflicts: result.conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutCause;

    fn block(text: &str) -> AddressBlock {
        AddressBlock::parse(text).unwrap()
    }

    fn meta(name: &str) -> Metadata {
        Metadata::new("subnet", name).created_by("tester")
    }

    #[test]
    fn partial_mode_claims_largest_free_sub_block() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        registry
            .allocate(&scope, &block("10.0.1.0/24"), &meta("a"), AvailabilityMode::Full)
            .unwrap();
        let claimed = registry
            .allocate(&scope, &block("10.0.0.0/22"), &meta("b"), AvailabilityMode::Partial)
            .unwrap();
        assert_eq!(claimed.block, block("10.0.2.0/23"));

        registry
            .allocate(&scope, &block("10.0.0.0/24"), &meta("c"), AvailabilityMode::Full)
            .unwrap();
        let err = registry
            .allocate(&scope, &block("10.0.0.0/23"), &meta("d"), AvailabilityMode::Partial)
            .unwrap_err();
        assert_eq!(
            err.conflicts(),
            &[block("10.0.0.0/24"), block("10.0.1.0/24")][..]
        );
    }

    #[test]
    fn failed_store_write_leaves_no_trace() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::open(store.clone(), RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        store.fail_next(1);
        let err = registry
            .allocate(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full)
            .unwrap_err();
        assert!(matches!(err, IpamError::Storage(_)));
        assert_eq!(registry.live_count(), 0);
        assert!(registry.list(None).unwrap().is_empty());
        assert!(registry.audit(10).unwrap().is_empty());
        assert_eq!(registry.metrics().storage_failures, 1);

        registry
            .allocate(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full)
            .unwrap();
    }

    #[test]
    fn release_rejects_wrong_scope_and_repeat() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        let other = Scope::new("vpc-b", "us");
        let a = registry
            .allocate(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full)
            .unwrap();
        assert!(matches!(
            registry.release(&other, a.id),
            Err(IpamError::NotFound(Missing::Allocation(_)))
        ));
        let released = registry.release(&scope, a.id).unwrap();
        assert_eq!(released.status, Status::Released);
        assert!(released.released_at.is_some());
        assert!(matches!(
            registry.release(&scope, a.id),
            Err(IpamError::NotFound(_))
        ));
        assert_eq!(registry.get(a.id).unwrap().status, Status::Released);
    }

    #[test]
    fn list_is_newest_first_and_filters_scope() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let a = Scope::new("vpc-a", "us");
        let b = Scope::new("vpc-b", "us");
        let first = registry
            .allocate(&a, &block("10.0.0.0/24"), &meta("1"), AvailabilityMode::Full)
            .unwrap();
        let second = registry
            .allocate(&b, &block("10.0.0.0/24"), &meta("2"), AvailabilityMode::Full)
            .unwrap();
        let third = registry
            .allocate(&a, &block("10.0.1.0/24"), &meta("3"), AvailabilityMode::Full)
            .unwrap();
        assert!(first.created_at <= second.created_at);
        assert!(second.created_at <= third.created_at);
        let ids: Vec<AllocationId> = registry.list(None).unwrap().iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
        let in_a: Vec<AllocationId> = registry.list(Some(&a)).unwrap().iter().map(|x| x.id).collect();
        assert_eq!(in_a, vec![third.id, first.id]);
    }

    #[test]
    fn audit_records_commits_and_refusals() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        let a = registry
            .allocate(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full)
            .unwrap();
        let _ = registry.allocate(&scope, &block("10.0.0.0/25"), &meta("b"), AvailabilityMode::Full);
        registry.release(&scope, a.id).unwrap();
        let _ = registry.release(&scope, a.id);

        let events = registry.audit(10).unwrap();
        let outcomes: Vec<(AuditAction, bool)> = events.iter().map(|e| (e.action, e.ok)).collect();
        assert_eq!(
            outcomes,
            vec![
                (AuditAction::Release, false),
                (AuditAction::Release, true),
                (AuditAction::Allocate, false),
                (AuditAction::Allocate, true),
            ]
        );
        assert_eq!(events[3].actor, "tester");
        assert_eq!(events[3].subject, "10.0.0.0/24");
        assert_eq!(events[2].subject, "10.0.0.0/25");
        assert!(events[2].detail.contains("conflicts with"), "{}", events[2].detail);
        assert!(events.windows(2).all(|pair| pair[0].id > pair[1].id));

        let refused_allocations = registry
            .audit_query(
                &AuditFilter::default()
                    .action(AuditAction::Allocate)
                    .outcome(false),
            )
            .unwrap();
        assert_eq!(refused_allocations.len(), 1);
        let since = events[1].at;
        let recent = registry
            .audit_query(&AuditFilter::default().between(Some(since), None))
            .unwrap();
        assert!(recent.iter().all(|e| e.at >= since));
        assert!(recent.len() >= 2);
    }

    #[test]
    fn invalid_metadata_is_rejected_before_commit() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        let released = meta("a").with_status(Status::Released);
        assert!(matches!(
            registry.allocate(&scope, &block("10.0.0.0/24"), &released, AvailabilityMode::Full),
            Err(IpamError::Parse(_))
        ));
        assert!(matches!(
            registry.allocate(&Scope::new("", "us"), &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full),
            Err(IpamError::Parse(_))
        ));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn cancelled_allocation_has_no_effect() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        let token = CancelToken::new();
        token.cancel();
        let err = registry
            .allocate_with(
                &scope,
                &block("10.0.0.0/24"),
                &meta("a"),
                AvailabilityMode::Full,
                &CommitOptions::default().with_cancel(token),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            IpamError::Timeout {
                cause: TimeoutCause::Cancelled,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(registry.list(None).unwrap().is_empty());
        let refused = registry.audit(10).unwrap();
        assert_eq!(refused.len(), 1);
        assert!(!refused[0].ok);
    }

    #[test]
    fn cancelling_after_commit_keeps_the_allocation() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let scope = Scope::new("vpc-a", "us");
        let token = CancelToken::new();
        let options = CommitOptions::default().with_cancel(token.clone());
        let allocation = registry
            .allocate_with(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full, &options)
            .unwrap();
        token.cancel();

        assert_eq!(registry.get(allocation.id).unwrap(), allocation);
        assert_eq!(registry.list(None).unwrap(), vec![allocation.clone()]);
        assert_eq!(registry.live_count(), 1);
        assert!(!registry
            .check(&scope, &block("10.0.0.0/24"), AvailabilityMode::Full)
            .unwrap()
            .is_free);
        let audit = registry.audit(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].ok);

        // A later request carrying the same token is refused before its commit point.
        assert!(matches!(
            registry.release_with(&scope, allocation.id, &options),
            Err(IpamError::Timeout {
                cause: TimeoutCause::Cancelled,
                ..
            })
        ));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn reopen_rebuilds_index_and_id_sequence() {
        let store = Arc::new(MemoryStore::new());
        let scope = Scope::new("vpc-a", "us");
        let (kept, dropped) = {
            let registry = Registry::open(store.clone(), RegistryConfig::default()).unwrap();
            let kept = registry
                .allocate(&scope, &block("10.0.0.0/24"), &meta("a"), AvailabilityMode::Full)
                .unwrap();
            let dropped = registry
                .allocate(&scope, &block("10.0.1.0/24"), &meta("b"), AvailabilityMode::Full)
                .unwrap();
            registry.release(&scope, dropped.id).unwrap();
            (kept, dropped)
        };
        let registry = Registry::open(store, RegistryConfig::default()).unwrap();
        assert_eq!(registry.live_count(), 1);
        assert!(registry
            .allocate(&scope, &block("10.0.0.0/25"), &meta("c"), AvailabilityMode::Full)
            .is_err());
        let again = registry
            .allocate(&scope, &block("10.0.1.0/24"), &meta("d"), AvailabilityMode::Full)
            .unwrap();
        assert!(again.id > dropped.id);
        assert!(again.created_at >= kept.created_at);
    }
}
