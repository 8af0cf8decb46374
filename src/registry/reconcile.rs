use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CommitOptions, Registry};
use crate::audit::AuditAction;
use crate::block::AddressBlock;
use crate::error::IpamError;
use crate::model::{Allocation, AvailabilityMode, Metadata, Scope};

/// A block observed in an external inventory, e.g. a cloud account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredBlock {
    /// Where it was found.
    pub scope: Scope,
    /// The observed block.
    pub block: AddressBlock,
    /// Resource details to record on adoption.
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// A discovered block that overlaps something the registry already holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileConflict {
    /// The discovered block.
    pub discovered: DiscoveredBlock,
    /// Live blocks it overlaps.
    pub occupied: Vec<AddressBlock>,
}

/// A discovered block that could not be processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    /// The discovered block.
    pub discovered: DiscoveredBlock,
    /// Why it failed.
    pub error: String,
}

/// Outcome of one reconciliation pass. Every input lands in exactly one list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Newly recorded allocations.
    pub adopted: Vec<Allocation>,
    /// Inputs already recorded for the same resource.
    pub already_tracked: Vec<DiscoveredBlock>,
    /// Inputs overlapping a different live allocation.
    pub conflicts: Vec<ReconcileConflict>,
    /// Inputs rejected for any other reason.
    pub failed: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// True when every input was adopted or already tracked.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }
}

impl Registry {
    /// Records externally discovered blocks through the FULL-mode allocate
    /// path. Drift is reported, never dropped.
    pub fn reconcile(&self, discovered: &[DiscoveredBlock]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let options = CommitOptions::default();
        for item in discovered {
            let tracked = match self.overlapping(&item.scope, &item.block) {
                Ok(existing) => existing.iter().any(|existing| {
                    existing.block == item.block
                        && existing.scope == item.scope
                        && existing.resource_name == item.metadata.resource_name
                }),
                Err(err) => {
                    report.failed.push(ReconcileFailure {
                        discovered: item.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            if tracked {
                report.already_tracked.push(item.clone());
                continue;
            }
            match self.claim(
                &item.scope,
                &item.block,
                &item.metadata,
                AvailabilityMode::Full,
                &options,
                AuditAction::Reconcile,
            ) {
                Ok(allocation) => report.adopted.push(allocation),
                Err(IpamError::Conflict { conflicts, .. }) => {
                    warn!(
                        block = %item.block,
                        scope = %item.scope,
                        resource = %item.metadata.resource_name,
                        "registry.reconcile.conflict"
                    );
                    report.conflicts.push(ReconcileConflict {
                        discovered: item.clone(),
                        occupied: conflicts,
                    });
                }
                Err(err) => report.failed.push(ReconcileFailure {
                    discovered: item.clone(),
                    error: err.to_string(),
                }),
            }
        }
        info!(
            adopted = report.adopted.len(),
            already_tracked = report.already_tracked.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            "registry.reconcile"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    fn found(vpc: &str, cidr: &str, name: &str) -> DiscoveredBlock {
        DiscoveredBlock {
            scope: Scope::new(vpc, "us"),
            block: AddressBlock::parse(cidr).unwrap(),
            metadata: Metadata::new("subnet", name).created_by("discovery"),
        }
    }

    #[test]
    fn every_input_is_accounted_for() {
        let registry = Registry::in_memory(RegistryConfig::default()).unwrap();
        let inputs = vec![
            found("vpc-a", "10.0.0.0/24", "web"),
            found("vpc-a", "10.0.0.0/24", "web"),
            found("vpc-a", "10.0.0.128/25", "rogue"),
            found("", "10.0.9.0/24", "broken"),
            found("vpc-b", "10.0.0.0/24", "other"),
        ];
        let report = registry.reconcile(&inputs);
        assert_eq!(report.adopted.len(), 2);
        assert_eq!(report.already_tracked, vec![inputs[1].clone()]);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(
            report.conflicts[0].occupied,
            vec![AddressBlock::parse("10.0.0.0/24").unwrap()]
        );
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_clean());

        let audit = registry.audit(10).unwrap();
        assert_eq!(audit.len(), 4);
        assert!(audit.iter().all(|e| e.action == AuditAction::Reconcile));
        assert_eq!(audit.iter().filter(|e| e.ok).count(), 2);
    }

    #[test]
    fn discovered_blocks_parse_from_json() {
        let json = r#"[{"scope":{"vpc":"vpc-a","region":"us"},"block":"10.1.0.0/16","resource_type":"vpc","resource_name":"main"}]"#;
        let parsed: Vec<DiscoveredBlock> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed[0].metadata.created_by, "system");
        assert_eq!(parsed[0].block.to_string(), "10.1.0.0/16");
    }
}
