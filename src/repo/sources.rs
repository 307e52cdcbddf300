//! Source registry: one row per received container.

use super::db::{IdSequence, ProxyDb};
use super::feed_keys::{FeedKey, FeedKeys};
use super::forward_dests::undelivered_to_old_destination;
use super::listeners::{Listeners, SourceAdded};
use super::{attribute, headers, AttributeMap};
use crate::error::{RepoError, Result};
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Columns selected by every source query, in [`Source::from_row`] order.
pub(crate) const SOURCE_COLUMNS: &str = "s.id, s.path, s.fk_feed_id, f.feed_name, f.type_name, \
     s.last_modified_time_ms, s.examined";

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: i64,
    /// Path relative to the repository directory.
    pub path: String,
    pub feed_id: i64,
    pub feed: String,
    pub type_name: Option<String>,
    pub last_modified_ms: i64,
    pub examined: bool,
}

impl Source {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let type_name: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            feed_id: row.get(2)?,
            feed: row.get(3)?,
            type_name: if type_name.is_empty() { None } else { Some(type_name) },
            last_modified_ms: row.get(5)?,
            examined: row.get(6)?,
        })
    }
}

/// How sources leave the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Sources are examined and their items forwarded as aggregates; a source
    /// is done once all of its items have been cleaned up.
    Aggregated,
    /// Each source is forwarded as-is; it is done once every enabled
    /// destination has accepted it.
    PerSource,
}

pub struct SourceRegistry {
    db: Arc<ProxyDb>,
    feed_keys: Arc<FeedKeys>,
    ids: IdSequence,
    listeners: Listeners<SourceAdded>,
    /// Ids already returned by `get_new_source`.
    handed_out: Mutex<HashSet<i64>>,
    /// Bumped on every insert; waiters in `get_new_source` sleep on it.
    added: (Mutex<u64>, Condvar),
}

impl SourceRegistry {
    pub fn new(db: Arc<ProxyDb>, feed_keys: Arc<FeedKeys>) -> Result<Self> {
        let ids = IdSequence::from_table(&db, "source")?;
        Ok(Self {
            db,
            feed_keys,
            ids,
            listeners: Listeners::default(),
            handed_out: Mutex::new(HashSet::new()),
            added: (Mutex::new(0), Condvar::new()),
        })
    }

    pub fn add_listener(&self, listener: impl Fn(&SourceAdded) + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    /// Register a container. The feed is mandatory; a blank type falls back to
    /// the `Type` attribute.
    pub fn add_source(
        &self,
        path: &str,
        feed: &str,
        type_name: Option<&str>,
        last_modified_ms: i64,
        attributes: &AttributeMap,
    ) -> Result<i64> {
        if feed.trim().is_empty() {
            return Err(RepoError::MissingFeed(path.to_string()));
        }
        let type_name = type_name
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| attribute(attributes, headers::TYPE));

        let feed_id = self.feed_keys.id(&self.db, &FeedKey::new(feed, type_name))?;
        let id = self.ids.next();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO source (id, path, fk_feed_id, last_modified_time_ms, examined)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![id, path, feed_id, last_modified_ms],
            )?;
            Ok(())
        })?;

        log::debug!("Added source {} ({}) feed={} type={:?}", id, path, feed, type_name);

        {
            let (lock, condvar) = &self.added;
            let mut generation = lock.lock()?;
            *generation += 1;
            condvar.notify_all();
        }

        self.listeners.notify(&SourceAdded {
            source_id: id,
            path: path.to_string(),
        });
        Ok(id)
    }

    /// Wait up to `timeout` for an unexamined source that this method has not
    /// returned before.
    pub fn get_new_source(&self, timeout: Duration) -> Result<Option<Source>> {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &self.added;

        loop {
            let seen = *lock.lock()?;
            if let Some(source) = self.next_unclaimed()? {
                return Ok(Some(source));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let generation = lock.lock()?;
            if *generation == seen {
                // A poisoned wait is treated like a wake-up; the next loop
                // iteration re-locks and reports the poison.
                let _ = condvar.wait_timeout(generation, deadline - now);
            }
        }
    }

    fn next_unclaimed(&self) -> Result<Option<Source>> {
        let mut handed_out = self.handed_out.lock()?;
        let candidates = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM source s JOIN feed f ON f.id = s.fk_feed_id
                 WHERE s.examined = 0
                 ORDER BY s.last_modified_time_ms, s.id",
                SOURCE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], Source::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        let found = candidates.into_iter().find(|s| !handed_out.contains(&s.id));
        if let Some(source) = &found {
            handed_out.insert(source.id);
        }
        Ok(found)
    }

    pub fn get_source(&self, id: i64) -> Result<Option<Source>> {
        self.db.with_conn(|conn| load_source(conn, id))
    }

    /// Up to `limit` sources whose forwarding is finished under `mode`.
    /// `retire_old_destinations` lets never-attempted records of removed
    /// destinations be ignored.
    pub fn get_deletable_sources(
        &self,
        limit: usize,
        mode: ForwardingMode,
        retire_old_destinations: bool,
    ) -> Result<Vec<Source>> {
        let condition = match mode {
            ForwardingMode::Aggregated => "s.examined = 1
                 AND NOT EXISTS (SELECT 1 FROM source_item si WHERE si.fk_source_id = s.id)"
                .to_string(),
            ForwardingMode::PerSource => format!(
                "EXISTS (SELECT 1 FROM forward_dest d WHERE d.enabled = 1)
                 AND NOT EXISTS (
                    SELECT 1 FROM forward_dest d
                    WHERE d.enabled = 1
                      AND NOT EXISTS (
                        SELECT 1 FROM forward_source fs
                        WHERE fs.fk_source_id = s.id
                          AND fs.fk_forward_dest_id = d.id
                          AND fs.success = 1))
                 AND NOT {}",
                undelivered_to_old_destination(
                    "forward_source",
                    "fk_source_id",
                    "s.id",
                    retire_old_destinations,
                )
            ),
        };

        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM source s JOIN feed f ON f.id = s.fk_feed_id
                 WHERE {}
                 ORDER BY s.id
                 LIMIT ?1",
                SOURCE_COLUMNS, condition
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit as i64], Source::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Remove the source row and everything hanging off it. Backing files must
    /// already be gone.
    pub fn delete_source(&self, source: &Source) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM forward_source WHERE fk_source_id = ?1", [source.id])?;
            tx.execute(
                "DELETE FROM aggregate_item WHERE fk_source_item_id IN
                    (SELECT id FROM source_item WHERE fk_source_id = ?1)",
                [source.id],
            )?;
            tx.execute(
                "DELETE FROM source_entry WHERE fk_source_item_id IN
                    (SELECT id FROM source_item WHERE fk_source_id = ?1)",
                [source.id],
            )?;
            tx.execute("DELETE FROM source_item WHERE fk_source_id = ?1", [source.id])?;
            tx.execute("DELETE FROM source WHERE id = ?1", [source.id])?;
            Ok(())
        })?;

        if let Ok(mut handed_out) = self.handed_out.lock() {
            handed_out.remove(&source.id);
        }
        log::debug!("Deleted source {} ({})", source.id, source.path);
        Ok(())
    }

    pub fn source_exists(&self, path: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM source WHERE path = ?1)",
                [path],
                |row| row.get(0),
            )?)
        })
    }

    pub fn count_sources(&self) -> Result<i64> {
        self.db.count("source")
    }
}

pub(crate) fn load_source(conn: &Connection, id: i64) -> Result<Option<Source>> {
    use rusqlite::OptionalExtension;
    let sql = format!(
        "SELECT {} FROM source s JOIN feed f ON f.id = s.fk_feed_id WHERE s.id = ?1",
        SOURCE_COLUMNS
    );
    Ok(conn.query_row(&sql, [id], Source::from_row).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> SourceRegistry {
        let db = Arc::new(ProxyDb::in_memory().unwrap());
        SourceRegistry::new(db, Arc::new(FeedKeys::new())).unwrap()
    }

    #[test]
    fn test_add_source_requires_feed() {
        let registry = registry();
        let err = registry
            .add_source("c1", "  ", Some("T"), 1, &AttributeMap::new())
            .unwrap_err();
        assert!(matches!(err, RepoError::MissingFeed(p) if p == "c1"));
        assert_eq!(registry.count_sources().unwrap(), 0);
    }

    #[test]
    fn test_type_falls_back_to_attribute() {
        let registry = registry();
        let mut attrs = AttributeMap::new();
        attrs.insert("type".to_string(), "Raw Events".to_string());

        let id = registry.add_source("c1", "F", None, 1, &attrs).unwrap();
        let source = registry.get_source(id).unwrap().unwrap();
        assert_eq!(source.feed, "F");
        assert_eq!(source.type_name.as_deref(), Some("Raw Events"));
        assert!(!source.examined);
    }

    #[test]
    fn test_listeners_see_every_add() {
        let registry = registry();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        registry.add_listener(move |event| {
            assert!(event.source_id > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.add_source("a", "F", None, 1, &AttributeMap::new()).unwrap();
        registry.add_source("b", "F", None, 2, &AttributeMap::new()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(registry.source_exists("a").unwrap());
        assert!(!registry.source_exists("c").unwrap());
    }

    #[test]
    fn test_get_new_source_hands_out_once_in_order() {
        let registry = registry();
        registry.add_source("late", "F", None, 20, &AttributeMap::new()).unwrap();
        registry.add_source("early", "F", None, 10, &AttributeMap::new()).unwrap();

        let first = registry.get_new_source(Duration::ZERO).unwrap().unwrap();
        let second = registry.get_new_source(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.path, "early");
        assert_eq!(second.path, "late");
        assert!(registry
            .get_new_source(Duration::from_millis(20))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_get_new_source_wakes_on_add() {
        let registry = Arc::new(registry());
        let waiter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.get_new_source(Duration::from_secs(5)).unwrap())
        };

        std::thread::sleep(Duration::from_millis(50));
        registry.add_source("c1", "F", None, 1, &AttributeMap::new()).unwrap();

        let source = waiter.join().unwrap().unwrap();
        assert_eq!(source.path, "c1");
    }

    #[test]
    fn test_delete_source_removes_row() {
        let registry = registry();
        let id = registry.add_source("c1", "F", None, 1, &AttributeMap::new()).unwrap();
        let source = registry.get_source(id).unwrap().unwrap();

        registry.delete_source(&source).unwrap();
        assert_eq!(registry.count_sources().unwrap(), 0);
    }
}
