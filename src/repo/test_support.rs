//! Shared fixtures for repository unit tests.

use super::db::ProxyDb;
use super::feed_keys::{FeedKey, FeedKeys};
use super::sender::{ForwardDestinations, Sender, SourceItems, StreamHandler, StreamHandlers};
use super::AttributeMap;
use rusqlite::params;
use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_ID: AtomicI64 = AtomicI64::new(1_000);

/// Insert an examined source with one data item per entry of `sizes`.
/// Returns the source id.
pub fn seed_source(
    db: &ProxyDb,
    feed_keys: &FeedKeys,
    path: &str,
    feed: &str,
    type_name: Option<&str>,
    last_modified_ms: i64,
    sizes: &[i64],
) -> i64 {
    let feed_id = feed_keys.id(db, &FeedKey::new(feed, type_name)).unwrap();
    let source_id = NEXT_ID.fetch_add(1, Ordering::SeqCst);

    db.transaction(|tx| {
        tx.execute(
            "INSERT INTO source (id, path, fk_feed_id, last_modified_time_ms, examined, item_count)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![source_id, path, feed_id, last_modified_ms, sizes.len() as i64],
        )?;
        for (n, size) in sizes.iter().enumerate() {
            let item_id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
            tx.execute(
                "INSERT INTO source_item (id, name, item_number, fk_source_id, aggregated)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![item_id, format!("{:03}", n + 1), n as i64 + 1, source_id],
            )?;
            tx.execute(
                "INSERT INTO source_entry (id, extension, extension_type, byte_size, fk_source_item_id)
                 VALUES (?1, '.dat', 3, ?2, ?3)",
                params![NEXT_ID.fetch_add(1, Ordering::SeqCst), size, item_id],
            )?;
        }
        Ok(())
    })
    .unwrap();

    source_id
}

/// `(id, byte_size, items, complete)` of every aggregate, by id.
pub fn aggregates(db: &ProxyDb) -> Vec<(i64, i64, i64, bool)> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, byte_size, items, complete FROM aggregate ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    })
    .unwrap()
}

/// Forwards recorded by [`MemoryDestinations`].
#[derive(Debug, Clone)]
pub struct Received {
    pub destination: String,
    pub feed: String,
    pub attributes: AttributeMap,
    pub entries: Vec<String>,
}

/// In-memory destinations; names listed in `failing` reject every forward.
#[derive(Default)]
pub struct MemoryDestinations {
    pub failing: Mutex<HashSet<String>>,
    pub received: Arc<Mutex<Vec<Received>>>,
}

impl MemoryDestinations {
    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

struct MemoryHandlers {
    name: String,
    fail: bool,
    received: Arc<Mutex<Vec<Received>>>,
}

struct CollectingHandler(Vec<String>);

impl StreamHandler for CollectingHandler {
    fn add_entry(&mut self, name: &str, data: &mut dyn Read) -> io::Result<u64> {
        let n = io::copy(data, &mut io::sink())?;
        self.0.push(name.to_string());
        Ok(n)
    }
}

impl StreamHandlers for MemoryHandlers {
    fn handle(
        &self,
        feed: &str,
        _type_name: Option<&str>,
        attributes: &AttributeMap,
        consumer: &mut dyn FnMut(&mut dyn StreamHandler) -> io::Result<()>,
    ) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is down", self.name),
            ));
        }
        let mut handler = CollectingHandler(Vec::new());
        consumer(&mut handler)?;
        self.received.lock().unwrap().push(Received {
            destination: self.name.clone(),
            feed: feed.to_string(),
            attributes: attributes.clone(),
            entries: handler.0,
        });
        Ok(())
    }
}

impl ForwardDestinations for MemoryDestinations {
    fn provider(&self, name: &str) -> Option<Arc<dyn StreamHandlers>> {
        Some(Arc::new(MemoryHandlers {
            name: name.to_string(),
            fail: self.failing.lock().unwrap().contains(name),
            received: self.received.clone(),
        }))
    }
}

/// Sender that emits one empty entry per item (or one per source) without
/// touching the file system.
pub struct NameOnlySender;

impl Sender for NameOnlySender {
    fn send_aggregate(
        &self,
        items: &[SourceItems],
        handler: &mut dyn StreamHandler,
    ) -> io::Result<()> {
        for source in items {
            for item in &source.items {
                handler.add_entry(&format!("{}/{}", source.source_path, item.name), &mut io::empty())?;
            }
        }
        Ok(())
    }

    fn send_source(
        &self,
        source_path: &str,
        handler: &mut dyn StreamHandler,
    ) -> io::Result<()> {
        handler.add_entry(source_path, &mut io::empty())?;
        Ok(())
    }
}
