//! Repository database: connection, versioned migrations and id sequences.
//!
//! There is exactly one writer process per repository, so a single
//! `Mutex<Connection>` is shared by every component. Multi-statement updates go
//! through [`ProxyDb::transaction`].

use crate::error::Result;
use crate::sqlite_pragma::apply_pragmas;
use rusqlite::{params, Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Table recording which migration scripts have been applied.
pub const SCHEMA_HISTORY_TABLE: &str = "schema_history";

/// Versioned migration scripts, applied in order and recorded in
/// [`SCHEMA_HISTORY_TABLE`].
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "create repo tables",
    include_str!("../../sql/V001__create_repo_tables.sql"),
)];

pub struct ProxyDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ProxyDb {
    /// Open (or create) the repository database at `path`, apply the
    /// configured PRAGMAs and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>, pragmas: &[String]) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        apply_pragmas(&conn, pragmas)?;
        run_schema_migrations(&mut conn)?;

        log::info!("✅ Repository database ready: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        run_schema_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the shared connection outside of an explicit transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock()?;
        f(&conn)
    }

    /// Run `f` inside one transaction. The transaction commits if `f` returns
    /// `Ok` and rolls back (on drop) otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Highest id currently stored in `table`, or 0 when empty.
    pub fn max_id(&self, table: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", table);
            Ok(conn.query_row(&sql, [], |row| row.get(0))?)
        })
    }

    pub fn count(&self, table: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            Ok(conn.query_row(&sql, [], |row| row.get(0))?)
        })
    }
}

/// Apply every migration newer than the highest recorded version.
///
/// Returns the number of scripts applied.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<usize> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version         INTEGER PRIMARY KEY,
            description     TEXT NOT NULL,
            applied_time_ms INTEGER NOT NULL
        )",
        SCHEMA_HISTORY_TABLE
    ))?;

    let current: i64 = conn.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {}", SCHEMA_HISTORY_TABLE),
        [],
        |row| row.get(0),
    )?;

    let mut applied = 0;
    for (version, description, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        log::info!("   ├─ Applying migration V{:03}: {}", version, description);

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            &format!(
                "INSERT INTO {} (version, description, applied_time_ms) VALUES (?1, ?2, ?3)",
                SCHEMA_HISTORY_TABLE
            ),
            params![version, description, super::now_ms()],
        )?;
        tx.commit()?;
        applied += 1;
    }

    if applied > 0 {
        log::info!("   └─ ✅ {} migration(s) applied", applied);
    }
    Ok(applied)
}

/// In-process id allocator seeded from `max(id)` at startup.
///
/// Ids are never reused, even across restarts, as long as the seed comes from
/// the table the ids are written to. Gaps are allowed.
#[derive(Debug)]
pub struct IdSequence {
    last: AtomicI64,
}

impl IdSequence {
    pub fn seeded(last: i64) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    pub fn from_table(db: &ProxyDb, table: &str) -> Result<Self> {
        Ok(Self::seeded(db.max_id(table)?))
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_pragma::default_pragmas;
    use tempfile::tempdir;

    #[test]
    fn test_migrations_are_recorded_once() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("repo").join("proxy.db");

        let db = ProxyDb::open(&db_path, &default_pragmas()).unwrap();
        assert_eq!(db.count(SCHEMA_HISTORY_TABLE).unwrap(), MIGRATIONS.len() as i64);
        drop(db);

        // Re-opening applies nothing new
        let mut conn = Connection::open(&db_path).unwrap();
        assert_eq!(run_schema_migrations(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_all_tables_exist() {
        let db = ProxyDb::in_memory().unwrap();
        for table in [
            "feed",
            "source",
            "source_item",
            "source_entry",
            "aggregate",
            "aggregate_item",
            "forward_dest",
            "forward_aggregate",
            "forward_source",
        ] {
            assert_eq!(db.count(table).unwrap(), 0, "table {}", table);
        }
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = ProxyDb::in_memory().unwrap();

        let result: Result<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO forward_dest (name) VALUES ('a')", [])?;
            Err(crate::error::RepoError::Send("boom".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(db.count("forward_dest").unwrap(), 0);
    }

    #[test]
    fn test_id_sequence_continues_from_max() {
        let db = ProxyDb::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute("INSERT INTO forward_dest (id, name) VALUES (41, 'a')", [])?;
            Ok(())
        })
        .unwrap();

        let seq = IdSequence::from_table(&db, "forward_dest").unwrap();
        assert_eq!(seq.next(), 42);
        assert_eq!(seq.next(), 43);
    }
}
