//! Interned (feed, type) pairs.
//!
//! Item and aggregate rows reference a small integer id instead of repeating
//! the feed and type strings. The dictionary is append-only.

use super::db::ProxyDb;
use crate::error::Result;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub feed: String,
    pub type_name: String,
}

impl FeedKey {
    /// Trim both names; a missing type is stored as the empty string.
    pub fn new(feed: &str, type_name: Option<&str>) -> Self {
        Self {
            feed: feed.trim().to_string(),
            type_name: type_name.map(str::trim).unwrap_or_default().to_string(),
        }
    }
}

#[derive(Default)]
pub struct FeedKeys {
    cache: Mutex<HashMap<FeedKey, i64>>,
}

impl FeedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the id for `key`, creating the row on first sight.
    ///
    /// Runs in autocommit mode so a cached id always refers to a committed row;
    /// call it before opening a transaction that uses the id.
    pub fn id(&self, db: &ProxyDb, key: &FeedKey) -> Result<i64> {
        if let Some(id) = self.cache.lock()?.get(key) {
            return Ok(*id);
        }

        let id = db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO feed (feed_name, type_name) VALUES (?1, ?2)",
                params![key.feed, key.type_name],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM feed WHERE feed_name = ?1 AND type_name = ?2",
                params![key.feed, key.type_name],
                |row| row.get(0),
            )?)
        })?;

        self.cache.lock()?.insert(key.clone(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_id() {
        let db = ProxyDb::in_memory().unwrap();
        let keys = FeedKeys::new();

        let a = keys.id(&db, &FeedKey::new("TEST-FEED", Some("Raw Events"))).unwrap();
        let b = keys.id(&db, &FeedKey::new(" TEST-FEED ", Some("Raw Events "))).unwrap();
        let c = keys.id(&db, &FeedKey::new("TEST-FEED", None)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.count("feed").unwrap(), 2);
    }

    #[test]
    fn test_ids_survive_a_fresh_cache() {
        let db = ProxyDb::in_memory().unwrap();
        let id = FeedKeys::new().id(&db, &FeedKey::new("F", Some("T"))).unwrap();

        let fresh = FeedKeys::new();
        assert_eq!(fresh.id(&db, &FeedKey::new("F", Some("T"))).unwrap(), id);
        assert_eq!(db.count("feed").unwrap(), 1);
    }
}
