#![allow(missing_docs)]

use std::sync::Arc;

use ipam::{
    AddressBlock, AllocationStore, AuditAction, AuditFilter, AvailabilityMode, IpamError, Metadata, Registry,
    RegistryConfig, Result, Scope, SqliteStore, Status,
};
use tempfile::TempDir;

fn block(text: &str) -> AddressBlock {
    text.parse().expect("valid cidr")
}

fn open(dir: &TempDir, config: RegistryConfig) -> Result<Registry> {
    let store = SqliteStore::open(dir.path().join("ipam.db"))?;
    Registry::open(Arc::new(store), config)
}

#[test]
fn committed_state_survives_reopen() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let scope = Scope::new("vpc-a", "eu-west-1");
    let (kept, released) = {
        let registry = open(&dir, RegistryConfig::default())?;
        let kept = registry.allocate(
            &scope,
            &block("10.0.0.0/24"),
            &Metadata::new("subnet", "web").created_by("alice"),
            AvailabilityMode::Full,
        )?;
        let released = registry.allocate(
            &scope,
            &block("10.0.1.0/24"),
            &Metadata::new("subnet", "db"),
            AvailabilityMode::Full,
        )?;
        registry.release(&scope, released.id)?;
        (kept, released)
    };

    let registry = open(&dir, RegistryConfig::default())?;
    assert_eq!(registry.live_count(), 1);
    assert_eq!(registry.get(kept.id)?, kept);

    let reloaded = registry.get(released.id)?;
    assert_eq!(reloaded.status, Status::Released);
    assert!(reloaded.released_at.is_some());

    let err = registry
        .allocate(
            &scope,
            &block("10.0.0.128/25"),
            &Metadata::new("subnet", "late"),
            AvailabilityMode::Full,
        )
        .unwrap_err();
    assert!(matches!(err, IpamError::Conflict { .. }));

    let next = registry.allocate(
        &scope,
        &block("10.0.1.0/24"),
        &Metadata::new("subnet", "db2"),
        AvailabilityMode::Full,
    )?;
    assert!(next.id > released.id);

    let outcomes: Vec<(AuditAction, bool)> = registry
        .audit(10)?
        .iter()
        .map(|e| (e.action, e.ok))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (AuditAction::Allocate, true),
            (AuditAction::Allocate, false),
            (AuditAction::Release, true),
            (AuditAction::Allocate, true),
            (AuditAction::Allocate, true),
        ]
    );
    let refused = registry.audit_query(&AuditFilter::default().outcome(false))?;
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].subject, "10.0.0.128/25");
    assert_eq!(refused[0].actor, "system");
    Ok(())
}

#[test]
fn pools_survive_reopen() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let scope = Scope::new("vpc-a", "eu-west-1");
    {
        let registry = open(&dir, RegistryConfig::default())?;
        registry.create_pool("apps", &block("172.16.0.0/20"), &[24, 26], &scope)?;
        registry.allocate_from_pool("apps", 24, &Metadata::new("subnet", "a"), false)?;
    }
    let registry = open(&dir, RegistryConfig::default())?;
    let pool = registry.pool("apps")?;
    assert_eq!(pool.allowed_prefixes, vec![24, 26]);
    assert_eq!(pool.cursor.to_string(), "172.16.1.0");
    let grant = registry.allocate_from_pool("apps", 24, &Metadata::new("subnet", "b"), false)?;
    assert_eq!(grant.block(), block("172.16.1.0/24"));
    Ok(())
}

#[test]
fn store_reads_match_registry_view() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(SqliteStore::open(dir.path().join("nested/dir/ipam.db"))?);
    let registry = Registry::open(store.clone(), RegistryConfig::global())?;
    let a = registry.allocate(
        &Scope::new("vpc-a", "us"),
        &block("2001:db8::/32"),
        &Metadata::new("vpc", "main"),
        AvailabilityMode::Full,
    )?;
    let snapshot = store.load()?;
    assert_eq!(snapshot.allocations, vec![a]);
    assert_eq!(snapshot.last_audit_id, 1);
    Ok(())
}
