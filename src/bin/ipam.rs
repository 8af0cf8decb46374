//! Binary entry point for the IPAM command-line client.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipam::{
    AddressBlock, Allocation, AllocationId, AuditAction, AuditEvent, AuditFilter, AvailabilityMode,
    CheckResult,
    DiscoveredBlock, FileConfig, Metadata, PoolGrant, PoolSummary, ReconcileReport, Registry,
    Scope, SqliteStore, Status,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ipam",
    version,
    about = "CIDR allocation registry",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "IPAM_DB", help = "SQLite database file")]
    db: Option<PathBuf>,

    #[arg(long, global = true, env = "IPAM_CONFIG", help = "Config file (TOML)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim a block atomically
    Allocate(AllocateCmd),
    /// Release an allocation
    Release(ReleaseCmd),
    /// Report whether a block is free without claiming it
    Check(CheckCmd),
    /// List allocations, newest first
    List(ListCmd),
    /// Show one allocation
    Get {
        #[arg(value_name = "ID")]
        id: u64,
    },
    /// Manage allocation pools
    #[command(subcommand)]
    Pool(PoolCommand),
    /// Adopt externally discovered blocks from a JSON file
    Reconcile {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Show audit events, newest first
    Audit(AuditCmd),
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    /// Define a pool
    Create(PoolCreateCmd),
    /// Carve the next free block out of a pool
    Allocate(PoolAllocateCmd),
    /// Show pool utilization
    Summary {
        #[arg(long)]
        name: String,
    },
}

#[derive(Args, Debug)]
struct ScopeArgs {
    #[arg(long, help = "VPC identifier")]
    vpc: String,

    #[arg(long, help = "Region name")]
    region: String,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        Scope::new(self.vpc.as_str(), self.region.as_str())
    }
}

#[derive(Args, Debug)]
struct ResourceArgs {
    #[arg(long, help = "Kind of resource, e.g. subnet")]
    resource_type: String,

    #[arg(long, help = "Resource name")]
    resource_name: String,

    #[arg(long, default_value = "system", help = "Principal recorded on the allocation")]
    created_by: String,
}

impl ResourceArgs {
    fn metadata(&self, status: Status) -> Metadata {
        Metadata::new(self.resource_type.as_str(), self.resource_name.as_str())
            .created_by(self.created_by.as_str())
            .with_status(status)
    }
}

#[derive(Args, Debug)]
struct AllocateCmd {
    #[command(flatten)]
    scope: ScopeArgs,

    #[arg(long, value_name = "CIDR")]
    cidr: AddressBlock,

    #[command(flatten)]
    resource: ResourceArgs,

    #[arg(long, default_value = "full", help = "FULL or PARTIAL")]
    mode: AvailabilityMode,

    #[arg(long, help = "Record as RESERVED instead of ALLOCATED")]
    reserve: bool,
}

#[derive(Args, Debug)]
struct ReleaseCmd {
    #[command(flatten)]
    scope: ScopeArgs,

    #[arg(long)]
    id: u64,
}

#[derive(Args, Debug)]
struct CheckCmd {
    #[command(flatten)]
    scope: ScopeArgs,

    #[arg(long, value_name = "CIDR")]
    cidr: AddressBlock,

    #[arg(long, default_value = "full", help = "FULL or PARTIAL")]
    mode: AvailabilityMode,
}

#[derive(Args, Debug)]
struct ListCmd {
    #[arg(long, requires = "region")]
    vpc: Option<String>,

    #[arg(long, requires = "vpc")]
    region: Option<String>,
}

#[derive(Args, Debug)]
struct PoolCreateCmd {
    #[arg(long)]
    name: String,

    #[arg(long, value_name = "CIDR")]
    parent: AddressBlock,

    #[arg(long, value_delimiter = ',', required = true, help = "Allowed prefix lengths")]
    prefixes: Vec<u8>,

    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Args, Debug)]
struct PoolAllocateCmd {
    #[arg(long)]
    name: String,

    #[arg(long)]
    prefix: u8,

    #[command(flatten)]
    resource: ResourceArgs,

    #[arg(long, help = "Show the block that would be granted without committing")]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct AuditCmd {
    #[arg(long, default_value_t = 20)]
    limit: usize,

    #[arg(long, default_value_t = 0, help = "Skip this many matching events")]
    offset: usize,

    #[arg(long, value_parser = parse_action, help = "allocate, release, pool_create, pool_allocate or reconcile")]
    action: Option<AuditAction>,

    #[arg(long, value_enum)]
    outcome: Option<Outcome>,

    #[arg(long, value_parser = parse_time, value_name = "RFC3339", help = "Events at or after this time")]
    since: Option<OffsetDateTime>,

    #[arg(long, value_parser = parse_time, value_name = "RFC3339", help = "Events before this time")]
    until: Option<OffsetDateTime>,
}

impl AuditCmd {
    fn filter(&self) -> AuditFilter {
        let mut filter = AuditFilter::latest(self.limit)
            .skip(self.offset)
            .between(self.since, self.until);
        if let Some(action) = self.action {
            filter = filter.action(action);
        }
        if let Some(outcome) = self.outcome {
            filter = filter.outcome(outcome == Outcome::Ok);
        }
        filter
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Outcome {
    Ok,
    Failed,
}

fn parse_action(text: &str) -> Result<AuditAction, String> {
    text.parse().map_err(|err| format!("{err}"))
}

fn parse_time(text: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|err| format!("{text:?}: {err}"))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ipam=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let registry = open_registry(&cli)?;
    let format = cli.format;

    match cli.command {
        Command::Allocate(cmd) => {
            let status = if cmd.reserve {
                Status::Reserved
            } else {
                Status::Allocated
            };
            let allocation = registry.allocate(
                &cmd.scope.scope(),
                &cmd.cidr,
                &cmd.resource.metadata(status),
                cmd.mode,
            )?;
            emit(format, &allocation, || print_allocation(&allocation))?;
        }
        Command::Release(cmd) => {
            let released = registry.release(&cmd.scope.scope(), AllocationId(cmd.id))?;
            emit(format, &released, || print_allocation(&released))?;
        }
        Command::Check(cmd) => {
            let result = registry.check(&cmd.scope.scope(), &cmd.cidr, cmd.mode)?;
            emit(format, &result, || print_check(&result))?;
        }
        Command::List(cmd) => {
            let scope = match (cmd.vpc, cmd.region) {
                (Some(vpc), Some(region)) => Some(Scope::new(vpc, region)),
                _ => None,
            };
            let allocations = registry.list(scope.as_ref())?;
            emit(format, &allocations, || {
                allocations.iter().for_each(print_allocation)
            })?;
        }
        Command::Get { id } => {
            let allocation = registry.get(AllocationId(id))?;
            emit(format, &allocation, || print_allocation(&allocation))?;
        }
        Command::Pool(PoolCommand::Create(cmd)) => {
            let pool = registry.create_pool(
                &cmd.name,
                &cmd.parent,
                &cmd.prefixes,
                &cmd.scope.scope(),
            )?;
            emit(format, &pool, || {
                println!(
                    "pool {} parent={} prefixes={:?} scope={}",
                    pool.name, pool.parent, pool.allowed_prefixes, pool.scope
                )
            })?;
        }
        Command::Pool(PoolCommand::Allocate(cmd)) => {
            let grant = registry.allocate_from_pool(
                &cmd.name,
                cmd.prefix,
                &cmd.resource.metadata(Status::Allocated),
                cmd.dry_run,
            )?;
            emit(format, &grant, || print_grant(&grant))?;
        }
        Command::Pool(PoolCommand::Summary { name }) => {
            let summary = registry.pool_summary(&name)?;
            emit(format, &summary, || print_summary(&summary))?;
        }
        Command::Reconcile { file } => {
            let raw = fs::read_to_string(&file)
                .map_err(|err| format!("failed to read {}: {err}", file.display()))?;
            let discovered: Vec<DiscoveredBlock> = serde_json::from_str(&raw)
                .map_err(|err| format!("failed to parse {}: {err}", file.display()))?;
            let report = registry.reconcile(&discovered);
            emit(format, &report, || print_reconcile(&report))?;
            if !report.is_clean() {
                std::process::exit(2);
            }
        }
        Command::Audit(cmd) => {
            let events = registry.audit_query(&cmd.filter())?;
            emit(format, &events, || events.iter().for_each(print_audit))?;
        }
    }
    Ok(())
}

fn open_registry(cli: &Cli) -> Result<Registry, Box<dyn Error>> {
    let file = FileConfig::load(cli.config.as_deref())?;
    let path = cli
        .db
        .clone()
        .or_else(|| file.database_path())
        .ok_or("no database path; pass --db or set [database] path in the config file")?;
    let store = SqliteStore::open(&path)?;
    Ok(Registry::open(Arc::new(store), file.registry)?)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn timestamp(at: &OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn print_allocation(allocation: &Allocation) {
    println!(
        "{id}\t{block}\t{scope}\t{status}\t{kind}/{name}\t{by}\t{at}",
        id = allocation.id,
        block = allocation.block,
        scope = allocation.scope,
        status = allocation.status.as_str(),
        kind = allocation.resource_type,
        name = allocation.resource_name,
        by = allocation.created_by,
        at = timestamp(&allocation.created_at),
    );
}

fn print_check(result: &CheckResult) {
    let verdict = if result.is_free { "free" } else { "taken" };
    println!("{} ({}) is {verdict}", result.requested, result.mode);
    for conflict in &result.conflicts {
        println!("  conflict: {conflict}");
    }
    for free in &result.free_subranges {
        println!("  free: {free}");
    }
}

fn print_grant(grant: &PoolGrant) {
    match grant {
        PoolGrant::DryRun { block } => println!("would allocate {block}"),
        PoolGrant::Allocated { allocation } => print_allocation(allocation),
    }
}

fn print_summary(summary: &PoolSummary) {
    println!(
        "pool {} ({}): used={} free={} total={} utilization={:.2}%",
        summary.pool,
        summary.parent,
        summary.used,
        summary.free,
        summary.total,
        summary.utilization_pct
    );
    for (status, usage) in &summary.by_status {
        println!("  {status}: count={} addresses={}", usage.count, usage.addresses);
    }
    for (prefix, count) in &summary.by_prefix {
        println!("  /{prefix}: {count}");
    }
}

fn print_reconcile(report: &ReconcileReport) {
    println!(
        "adopted={} already_tracked={} conflicts={} failed={}",
        report.adopted.len(),
        report.already_tracked.len(),
        report.conflicts.len(),
        report.failed.len()
    );
    for conflict in &report.conflicts {
        let occupied: Vec<String> = conflict.occupied.iter().map(ToString::to_string).collect();
        println!(
            "  conflict: {} in {} overlaps {}",
            conflict.discovered.block,
            conflict.discovered.scope,
            occupied.join(", ")
        );
    }
    for failure in &report.failed {
        println!(
            "  failed: {} in {}: {}",
            failure.discovered.block, failure.discovered.scope, failure.error
        );
    }
}

fn print_audit(event: &AuditEvent) {
    let outcome = if event.ok { "ok" } else { "failed" };
    println!(
        "{}\t{}\t{}\t{}\t{outcome}\t{}\t{}",
        event.id,
        timestamp(&event.at),
        event.actor,
        event.action,
        event.subject,
        event.detail
    );
}
