//! Connection-level tuning for the repository database.
//!
//! The statements are configuration (`PROXY_DB_PRAGMAS`), not code; the
//! defaults below match what the repository expects in production.

use rusqlite::Connection;

/// Default PRAGMAs: WAL journal, NORMAL sync, in-memory temp store, 256MB mmap.
pub const DEFAULT_PRAGMAS: &[&str] = &[
    "pragma journal_mode = WAL",
    "pragma synchronous = NORMAL",
    "pragma temp_store = MEMORY",
    "pragma mmap_size = 268435456",
    "pragma wal_autocheckpoint = 1000",
];

pub fn default_pragmas() -> Vec<String> {
    DEFAULT_PRAGMAS.iter().map(|s| s.to_string()).collect()
}

/// Apply each statement in order. Some PRAGMAs return a row (journal_mode),
/// so they go through `execute_batch` which discards results.
pub fn apply_pragmas(conn: &Connection, pragmas: &[String]) -> rusqlite::Result<()> {
    for pragma in pragmas {
        let pragma = pragma.trim();
        if pragma.is_empty() {
            continue;
        }
        log::debug!("Applying: {}", pragma);
        conn.execute_batch(pragma)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_pragmas_enable_wal() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();

        apply_pragmas(&conn, &default_pragmas()).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i32 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, 1000);
    }

    #[test]
    fn test_blank_statements_are_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn, &["".to_string(), "  ".to_string()]).unwrap();
    }
}
