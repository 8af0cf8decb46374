use std::net::IpAddr;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use time::OffsetDateTime;
use tracing::debug;

use super::{AllocationStore, Record, Snapshot};
use crate::audit::{AuditAction, AuditEvent, AuditFilter};
use crate::block::AddressBlock;
use crate::error::StoreError;
use crate::model::{Allocation, AllocationId, Scope, Status};
use crate::pool::Pool;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS allocations (
        id INTEGER PRIMARY KEY,
        cidr TEXT NOT NULL,
        vpc TEXT NOT NULL,
        region TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        released_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_allocations_scope ON allocations (vpc, region);
    CREATE TABLE IF NOT EXISTS pools (
        name TEXT PRIMARY KEY,
        parent TEXT NOT NULL,
        allowed_prefixes TEXT NOT NULL,
        vpc TEXT NOT NULL,
        region TEXT NOT NULL,
        cursor TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS audit_events (
        id INTEGER PRIMARY KEY,
        at INTEGER NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        subject TEXT NOT NULL,
        detail TEXT NOT NULL,
        ok INTEGER NOT NULL DEFAULT 1
    );
";

const ALLOCATION_COLUMNS: &str = "id, cidr, vpc, region, resource_type, resource_name, status, \
     created_by, created_at, released_at";

/// SQLite-backed store. Every batch is one transaction with `synchronous=FULL`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        debug!(path = %path.display(), "opened allocation database");
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Brings databases created before refused requests were audited up to
    /// the current schema.
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let has_ok: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('audit_events') WHERE name = 'ok'",
            [],
            |row| row.get(0),
        )?;
        if !has_ok {
            conn.execute_batch("ALTER TABLE audit_events ADD COLUMN ok INTEGER NOT NULL DEFAULT 1")?;
            debug!("added audit_events.ok column");
        }
        conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_audit_events_at ON audit_events (at)")?;
        Ok(())
    }

    fn write(tx: &Transaction<'_>, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::InsertAllocation(a) => {
                tx.execute(
                    "INSERT INTO allocations (id, cidr, vpc, region, resource_type, resource_name, \
                     status, created_by, created_at, released_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        to_sql_id(a.id.0)?,
                        a.block.to_string(),
                        a.scope.vpc,
                        a.scope.region,
                        a.resource_type,
                        a.resource_name,
                        a.status.as_str(),
                        a.created_by,
                        to_nanos(a.created_at)?,
                        a.released_at.map(to_nanos).transpose()?,
                    ],
                )?;
            }
            Record::MarkReleased { id, at } => {
                let changed = tx.execute(
                    "UPDATE allocations SET status = ?1, released_at = ?2 WHERE id = ?3",
                    params![Status::Released.as_str(), to_nanos(*at)?, to_sql_id(id.0)?],
                )?;
                if changed == 0 {
                    return Err(StoreError::Backend(format!(
                        "release of unknown allocation {id}"
                    )));
                }
            }
            Record::PutPool(pool) => {
                let prefixes = serde_json::to_string(&pool.allowed_prefixes)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                tx.execute(
                    "INSERT OR REPLACE INTO pools \
                     (name, parent, allowed_prefixes, vpc, region, cursor, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        pool.name,
                        pool.parent.to_string(),
                        prefixes,
                        pool.scope.vpc,
                        pool.scope.region,
                        pool.cursor.to_string(),
                        to_nanos(pool.created_at)?,
                    ],
                )?;
            }
            Record::Audit(event) => {
                tx.execute(
                    "INSERT INTO audit_events (id, at, actor, action, subject, detail, ok) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        to_sql_id(event.id)?,
                        to_nanos(event.at)?,
                        event.actor,
                        event.action.as_str(),
                        event.subject,
                        event.detail,
                        event.ok,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn query_allocations(
        conn: &Connection,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Allocation>, StoreError> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations {filter}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, RawAllocation::from_row)?;
        rows.map(|row| row?.decode()).collect()
    }

    fn pools(conn: &Connection) -> Result<Vec<Pool>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT name, parent, allowed_prefixes, vpc, region, cursor, created_at FROM pools",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut pools = Vec::new();
        for row in rows {
            let (name, parent, prefixes, vpc, region, cursor, created_at) = row?;
            pools.push(Pool {
                name,
                parent: decode_block(&parent)?,
                allowed_prefixes: serde_json::from_str(&prefixes)
                    .map_err(|e| StoreError::Corruption(format!("pool prefixes: {e}")))?,
                scope: Scope::new(vpc, region),
                cursor: cursor
                    .parse::<IpAddr>()
                    .map_err(|e| StoreError::Corruption(format!("pool cursor {cursor:?}: {e}")))?,
                created_at: from_nanos(created_at)?,
            });
        }
        Ok(pools)
    }
}

impl AllocationStore for SqliteStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn.lock();
        let allocations = Self::query_allocations(&conn, "ORDER BY id", [])?;
        let pools = Self::pools(&conn)?;
        let last_audit_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM audit_events", [], |row| {
                row.get(0)
            })?;
        Ok(Snapshot {
            allocations,
            pools,
            last_audit_id: from_sql_id(last_audit_id)?,
        })
    }

    fn apply(&self, batch: &[Record]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in batch {
            Self::write(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        let conn = self.conn.lock();
        Self::query_allocations(&conn, "", [])
    }

    fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = ?1");
        conn.query_row(&sql, [to_sql_id(id.0)?], RawAllocation::from_row)
            .optional()?
            .map(RawAllocation::decode)
            .transpose()
    }

    fn audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(action) = filter.action {
            clauses.push("action = ?");
            args.push(Value::Text(action.as_str().to_string()));
        }
        if let Some(ok) = filter.ok {
            clauses.push("ok = ?");
            args.push(Value::Integer(i64::from(ok)));
        }
        if let Some(since) = filter.since {
            clauses.push("at >= ?");
            args.push(Value::Integer(to_nanos(since)?));
        }
        if let Some(until) = filter.until {
            clauses.push("at < ?");
            args.push(Value::Integer(to_nanos(until)?));
        }
        let filter_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        // SQLite reads a negative LIMIT as "no limit".
        let limit = filter
            .limit
            .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        args.push(Value::Integer(limit));
        args.push(Value::Integer(i64::try_from(filter.offset).unwrap_or(i64::MAX)));

        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, at, actor, action, subject, detail, ok FROM audit_events \
             {filter_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, at, actor, action, subject, detail, ok) = row?;
            events.push(AuditEvent {
                id: from_sql_id(id)?,
                at: from_nanos(at)?,
                actor,
                action: action.parse::<AuditAction>()?,
                subject,
                detail,
                ok,
            });
        }
        Ok(events)
    }
}

struct RawAllocation {
    id: i64,
    cidr: String,
    vpc: String,
    region: String,
    resource_type: String,
    resource_name: String,
    status: String,
    created_by: String,
    created_at: i64,
    released_at: Option<i64>,
}

impl RawAllocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cidr: row.get(1)?,
            vpc: row.get(2)?,
            region: row.get(3)?,
            resource_type: row.get(4)?,
            resource_name: row.get(5)?,
            status: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
            released_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Allocation, StoreError> {
        Ok(Allocation {
            id: AllocationId(from_sql_id(self.id)?),
            block: decode_block(&self.cidr)?,
            scope: Scope::new(self.vpc, self.region),
            resource_type: self.resource_type,
            resource_name: self.resource_name,
            status: self
                .status
                .parse::<Status>()
                .map_err(|e| StoreError::Corruption(e.to_string()))?,
            created_by: self.created_by,
            created_at: from_nanos(self.created_at)?,
            released_at: self.released_at.map(from_nanos).transpose()?,
        })
    }
}

fn decode_block(text: &str) -> Result<AddressBlock, StoreError> {
    AddressBlock::parse_strict(text)
        .map_err(|e| StoreError::Corruption(format!("stored block {text:?}: {e}")))
}

fn to_nanos(at: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(at.unix_timestamp_nanos())
        .map_err(|_| StoreError::Backend(format!("timestamp {at} out of range")))
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| StoreError::Corruption(format!("timestamp {nanos}: {e}")))
}

fn to_sql_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Backend(format!("id {id} exceeds i64")))
}

fn from_sql_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Corruption(format!("negative id {id}")))
}
