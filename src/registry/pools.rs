use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::Registry;
use crate::audit::AuditAction;
use crate::block::AddressBlock;
use crate::error::{IpamError, Missing, ParseError, Result};
use crate::model::{Allocation, Metadata, Scope};
use crate::pool::{Pool, PoolSummary};
use crate::resolver;
use crate::store::Record;

use super::CommitOptions;

/// Result of [`Registry::allocate_from_pool`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PoolGrant {
    /// Block that would be handed out; nothing was committed.
    DryRun {
        /// Candidate block.
        block: AddressBlock,
    },
    /// Committed allocation.
    Allocated {
        /// The new allocation.
        allocation: Allocation,
    },
}

impl PoolGrant {
    /// Block chosen from the pool.
    pub fn block(&self) -> AddressBlock {
        match self {
            PoolGrant::DryRun { block } => *block,
            PoolGrant::Allocated { allocation } => allocation.block,
        }
    }
}

impl Registry {
    /// Defines a new pool carving `parent` into `allowed_prefixes` sizes.
    pub fn create_pool(
        &self,
        name: &str,
        parent: &AddressBlock,
        allowed_prefixes: &[u8],
        scope: &Scope,
    ) -> Result<Pool> {
        self.try_create_pool(name, parent, allowed_prefixes, scope)
            .inspect_err(|err| {
                self.record_refusal(
                    "system",
                    AuditAction::PoolCreate,
                    name.to_string(),
                    format!("parent={parent} prefixes={allowed_prefixes:?} scope={scope}"),
                    err,
                );
            })
    }

    fn try_create_pool(
        &self,
        name: &str,
        parent: &AddressBlock,
        allowed_prefixes: &[u8],
        scope: &Scope,
    ) -> Result<Pool> {
        let pool = Pool::new(name, *parent, allowed_prefixes, scope.clone(), self.now())?;
        let mut pools = self.pools.write();
        if pools.contains_key(&pool.name) {
            return Err(ParseError::DuplicatePool(pool.name).into());
        }
        let event = self.audit_event(
            pool.created_at,
            "system",
            AuditAction::PoolCreate,
            pool.name.clone(),
            format!(
                "parent={} prefixes={:?} scope={}",
                pool.parent, pool.allowed_prefixes, pool.scope
            ),
        );
        self.store
            .apply(&[Record::PutPool(pool.clone()), Record::Audit(event)])?;
        pools.insert(pool.name.clone(), Arc::new(Mutex::new(pool.clone())));
        info!(pool = %pool.name, parent = %pool.parent, scope = %pool.scope, "registry.pool.created");
        Ok(pool)
    }

    /// Hands out the next free `/prefix` block of a pool.
    ///
    /// The search starts at the pool's cursor and wraps to the start of the
    /// parent block. A committed grant moves the cursor past the block; a dry
    /// run leaves the pool untouched and is not audited.
    pub fn allocate_from_pool(
        &self,
        name: &str,
        prefix: u8,
        metadata: &Metadata,
        dry_run: bool,
    ) -> Result<PoolGrant> {
        let result = self.try_allocate_from_pool(name, prefix, metadata, dry_run);
        if !dry_run {
            if let Err(err) = &result {
                self.record_refusal(
                    &metadata.created_by,
                    AuditAction::PoolAllocate,
                    name.to_string(),
                    format!("prefix=/{prefix} resource={}", metadata.resource_name),
                    err,
                );
            }
        }
        result
    }

    fn try_allocate_from_pool(
        &self,
        name: &str,
        prefix: u8,
        metadata: &Metadata,
        dry_run: bool,
    ) -> Result<PoolGrant> {
        let cell = self.pool_cell(name)?;
        let mut pool = cell.lock();
        pool.permit(prefix)?;
        metadata.validate()?;

        let slot = self
            .index
            .slot(&self.index.key_for(&pool.scope, pool.family()));
        let parent = pool.parent;
        let plan = |occupied: Vec<AddressBlock>| {
            resolver::first_fit_among(&parent, prefix, pool.cursor_bits(), &occupied).ok_or_else(
                || IpamError::Exhausted {
                    pool: pool.name.clone(),
                    prefix,
                },
            )
        };

        if dry_run {
            let occupied = self.read_scope(&pool.scope, &parent, resolver::conflicts)?;
            let block = plan(occupied)?;
            return Ok(PoolGrant::DryRun { block });
        }

        let options = CommitOptions::default();
        let (allocation, advanced) = self.commit(&slot, &options).run(
            |index| resolver::conflicts(index, &parent),
            plan,
            |writer, target| {
                let allocation = Allocation::from_request(
                    self.next_allocation_id(),
                    target,
                    &pool.scope,
                    metadata,
                    self.now(),
                );
                let mut advanced = pool.clone();
                advanced.cursor = pool.advance_past(&target);
                let event = self.audit_event(
                    allocation.created_at,
                    &metadata.created_by,
                    AuditAction::PoolAllocate,
                    target.to_string(),
                    format!(
                        "pool={} id={} resource={}",
                        pool.name, allocation.id, metadata.resource_name
                    ),
                );
                self.store.apply(&[
                    Record::InsertAllocation(allocation.clone()),
                    Record::PutPool(advanced.clone()),
                    Record::Audit(event),
                ])?;
                writer.insert(allocation.clone());
                Ok((allocation, advanced))
            },
        )?;
        *pool = advanced;
        self.metrics.record_commit();
        info!(
            pool = %pool.name,
            allocation_id = %allocation.id,
            block = %allocation.block,
            cursor = %pool.cursor,
            "registry.pool.allocated"
        );
        Ok(PoolGrant::Allocated { allocation })
    }

    /// Usage report for one pool.
    pub fn pool_summary(&self, name: &str) -> Result<PoolSummary> {
        let pool = self.pool_cell(name)?.lock().clone();
        let allocations = self.store.allocations()?;
        Ok(PoolSummary::compute(&pool, &allocations))
    }

    /// One pool by name.
    pub fn pool(&self, name: &str) -> Result<Pool> {
        Ok(self.pool_cell(name)?.lock().clone())
    }

    /// Every pool, ordered by name.
    pub fn pools(&self) -> Vec<Pool> {
        self.pools
            .read()
            .values()
            .map(|cell| cell.lock().clone())
            .collect()
    }

    fn pool_cell(&self, name: &str) -> Result<Arc<Mutex<Pool>>> {
        self.pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(Missing::Pool(name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::model::AvailabilityMode;
    use crate::store::MemoryStore;

    fn block(text: &str) -> AddressBlock {
        AddressBlock::parse(text).unwrap()
    }

    fn registry_with_pool(parent: &str, prefixes: &[u8]) -> Registry {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        registry
            .create_pool("apps", &block(parent), prefixes, &Scope::new("vpc-a", "us"))
            .unwrap();
        registry
    }

    #[test]
    fn grants_walk_the_parent_in_order() {
        let registry = registry_with_pool("10.0.0.0/24", &[26]);
        let meta = Metadata::new("subnet", "app");
        let granted: Vec<AddressBlock> = (0..4)
            .map(|_| registry.allocate_from_pool("apps", 26, &meta, false).unwrap().block())
            .collect();
        assert_eq!(
            granted,
            vec![
                block("10.0.0.0/26"),
                block("10.0.0.64/26"),
                block("10.0.0.128/26"),
                block("10.0.0.192/26"),
            ]
        );
        assert!(matches!(
            registry.allocate_from_pool("apps", 26, &meta, false),
            Err(IpamError::Exhausted { prefix: 26, .. })
        ));
        assert_eq!(registry.pool("apps").unwrap().cursor.to_string(), "10.0.0.0");
    }

    #[test]
    fn cursor_wraps_to_reuse_released_space() {
        let registry = registry_with_pool("10.0.0.0/24", &[25]);
        let meta = Metadata::new("subnet", "app");
        let scope = Scope::new("vpc-a", "us");
        let first = registry.allocate_from_pool("apps", 25, &meta, false).unwrap();
        registry.allocate_from_pool("apps", 25, &meta, false).unwrap();
        let PoolGrant::Allocated { allocation } = first else {
            panic!("expected a committed grant");
        };
        registry.release(&scope, allocation.id).unwrap();
        let again = registry.allocate_from_pool("apps", 25, &meta, false).unwrap();
        assert_eq!(again.block(), block("10.0.0.0/25"));
    }

    #[test]
    fn dry_run_changes_nothing() {
        let registry = registry_with_pool("10.0.0.0/24", &[26]);
        let meta = Metadata::new("subnet", "app");
        let preview = registry.allocate_from_pool("apps", 26, &meta, true).unwrap();
        assert_eq!(preview, PoolGrant::DryRun { block: block("10.0.0.0/26") });
        assert_eq!(registry.live_count(), 0);
        let real = registry.allocate_from_pool("apps", 26, &meta, false).unwrap();
        assert_eq!(real.block(), block("10.0.0.0/26"));
    }

    #[test]
    fn pool_respects_explicit_allocations() {
        let registry = registry_with_pool("10.0.0.0/24", &[26]);
        let scope = Scope::new("vpc-a", "us");
        let meta = Metadata::new("subnet", "app");
        registry
            .allocate(&scope, &block("10.0.0.0/25"), &meta, AvailabilityMode::Full)
            .unwrap();
        let grant = registry.allocate_from_pool("apps", 26, &meta, false).unwrap();
        assert_eq!(grant.block(), block("10.0.0.128/26"));
    }

    #[test]
    fn pool_errors_are_typed() {
        let registry = registry_with_pool("10.0.0.0/24", &[26]);
        let meta = Metadata::new("subnet", "app");
        assert!(matches!(
            registry.allocate_from_pool("nope", 26, &meta, false),
            Err(IpamError::NotFound(Missing::Pool(_)))
        ));
        assert!(matches!(
            registry.allocate_from_pool("apps", 27, &meta, false),
            Err(IpamError::Parse(ParseError::PrefixNotAllowed { prefix: 27, .. }))
        ));
        assert!(matches!(
            registry.create_pool("apps", &block("10.1.0.0/24"), &[26], &Scope::new("v", "r")),
            Err(IpamError::Parse(ParseError::DuplicatePool(_)))
        ));
    }

    #[test]
    fn summary_and_cursor_survive_reopen() {
        let store = Arc::new(MemoryStore::new());
        {
            let registry = Registry::open(store.clone(), RegistryConfig::default()).unwrap();
            registry
                .create_pool("apps", &block("10.0.0.0/24"), &[26], &Scope::new("vpc-a", "us"))
                .unwrap();
            registry
                .allocate_from_pool("apps", 26, &Metadata::new("subnet", "a"), false)
                .unwrap();
        }
        let registry = Registry::open(store, RegistryConfig::default()).unwrap();
        let summary = registry.pool_summary("apps").unwrap();
        assert_eq!(summary.used, 64);
        assert_eq!(summary.utilization_pct, 25.0);
        let next = registry
            .allocate_from_pool("apps", 26, &Metadata::new("subnet", "b"), false)
            .unwrap();
        assert_eq!(next.block(), block("10.0.0.64/26"));
        assert_eq!(registry.pools().len(), 1);
    }
}
