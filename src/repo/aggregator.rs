//! Aggregator: bins unaggregated items into per-(feed, type) aggregates.
//!
//! ## Lane lifecycle
//!
//! ```text
//! accepting ──(items, bytes or age limit)──→ closing ──→ closed (complete = 1)
//! ```
//!
//! Items are taken in persisted arrival order (source last-modified, source id,
//! item number). Each item goes to the oldest open aggregate of its feed with
//! room for it, or seeds a new one. The byte limit is soft for the first item
//! of an aggregate (an oversize item becomes a singleton) and hard afterwards.

use super::db::{IdSequence, ProxyDb};
use super::listeners::{AggregatesClosed, Listeners};
use super::now_ms;
use crate::error::Result;
use crate::scheduler::Interrupt;
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_items_per_aggregate: i64,
    pub max_uncompressed_byte_size: i64,
    pub max_aggregate_age_ms: i64,
    /// Minimum spacing between passes that close aggregates by limit or age.
    pub aggregation_frequency_ms: i64,
    /// Unaggregated items claimed per query. A pass keeps loading batches
    /// until one comes back short, so this bounds memory per query, not the
    /// number of items a pass aggregates.
    pub batch_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_aggregate: 1_000,
            max_uncompressed_byte_size: 1024 * 1024 * 1024,
            max_aggregate_age_ms: 10 * 60 * 1000,
            aggregation_frequency_ms: 60 * 1000,
            batch_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingItem {
    id: i64,
    feed_id: i64,
    byte_size: i64,
}

#[derive(Debug, Default)]
struct AggregatorState {
    /// `None` until the first pass.
    last_close_check_ms: Option<i64>,
}

pub struct Aggregator {
    db: Arc<ProxyDb>,
    config: AggregatorConfig,
    aggregate_ids: IdSequence,
    /// Serialises passes within the process.
    state: Mutex<AggregatorState>,
    listeners: Listeners<AggregatesClosed>,
}

impl Aggregator {
    pub fn new(db: Arc<ProxyDb>, config: AggregatorConfig) -> Result<Self> {
        let aggregate_ids = IdSequence::from_table(&db, "aggregate")?;
        Ok(Self {
            db,
            config,
            aggregate_ids,
            state: Mutex::new(AggregatorState::default()),
            listeners: Listeners::default(),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: impl Fn(&AggregatesClosed) + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    /// Run one aggregation pass. Returns the number of aggregates closed.
    pub fn aggregate(&self, interrupt: &Interrupt) -> Result<usize> {
        self.aggregate_at(interrupt, now_ms())
    }

    /// Run one aggregation pass as if the clock read `now`.
    ///
    /// # Arguments
    /// * `interrupt` - checked between items; a pass stops early once it fires
    /// * `now` - milliseconds since the epoch, used for create times and age
    pub fn aggregate_at(&self, interrupt: &Interrupt, now: i64) -> Result<usize> {
        let mut state = self.state.lock()?;
        let first_pass = state.last_close_check_ms.is_none();
        let mut closed = 0;

        let close_due = match state.last_close_check_ms {
            None => true,
            Some(last) => now - last >= self.config.aggregation_frequency_ms,
        };
        if close_due {
            closed += self.close_old_aggregates(now)?;
            state.last_close_check_ms = Some(now);
        }

        let mut added = 0usize;
        'sweeps: loop {
            let batch = self.unaggregated_items()?;
            for item in &batch {
                if interrupt.is_interrupted() {
                    break 'sweeps;
                }
                let (was_added, was_closed) =
                    self.db.transaction(|tx| self.add_item(tx, item, now))?;
                added += usize::from(was_added);
                closed += usize::from(was_closed);
            }
            if batch.len() < self.config.batch_size {
                break;
            }
        }

        if added > 0 || closed > 0 {
            log::debug!("Aggregation pass: {} item(s) added, {} aggregate(s) closed", added, closed);
        }

        if closed > 0 || first_pass {
            self.listeners.notify(&AggregatesClosed { closed });
        }
        Ok(closed)
    }

    /// Mark open aggregates complete once they hit a limit or get too old.
    fn close_old_aggregates(&self, now: i64) -> Result<usize> {
        let oldest_allowed = now.saturating_sub(self.config.max_aggregate_age_ms);
        let closed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE aggregate SET complete = 1
                 WHERE complete = 0
                   AND (items >= ?1 OR byte_size >= ?2 OR create_time_ms <= ?3)",
                params![
                    self.config.max_items_per_aggregate,
                    self.config.max_uncompressed_byte_size,
                    oldest_allowed
                ],
            )?)
        })?;
        if closed > 0 {
            log::info!("📦 Closed {} aggregate(s) on limits/age", closed);
        }
        Ok(closed)
    }

    fn unaggregated_items(&self) -> Result<Vec<PendingItem>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT si.id,
                        COALESCE(si.fk_feed_id, s.fk_feed_id),
                        COALESCE((SELECT SUM(e.byte_size) FROM source_entry e
                                  WHERE e.fk_source_item_id = si.id), 0)
                 FROM source_item si
                 JOIN source s ON s.id = si.fk_source_id
                 WHERE si.aggregated = 0 AND s.examined = 1
                 ORDER BY s.last_modified_time_ms, s.id, si.item_number
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([self.config.batch_size as i64], |row| {
                Ok(PendingItem {
                    id: row.get(0)?,
                    feed_id: row.get(1)?,
                    byte_size: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Place one item. Returns `(added, closed)`.
    fn add_item(&self, tx: &Transaction<'_>, item: &PendingItem, now: i64) -> Result<(bool, bool)> {
        let max_items = self.config.max_items_per_aggregate;
        let max_bytes = self.config.max_uncompressed_byte_size;
        let max_existing_size = (max_bytes - item.byte_size).max(0);

        let claimed = tx.execute(
            "UPDATE source_item SET aggregated = 1 WHERE id = ?1 AND aggregated = 0",
            [item.id],
        )?;
        if claimed == 0 {
            return Ok((false, false));
        }

        let open: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT id, byte_size, items FROM aggregate
                 WHERE fk_feed_id = ?1 AND complete = 0 AND byte_size <= ?2 AND items < ?3
                 ORDER BY create_time_ms, id
                 LIMIT 1",
                params![item.feed_id, max_existing_size, max_items],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (aggregate_id, byte_size, items) = match open {
            Some((id, byte_size, items)) => {
                tx.execute(
                    "UPDATE aggregate SET byte_size = byte_size + ?1, items = items + 1 WHERE id = ?2",
                    params![item.byte_size, id],
                )?;
                (id, byte_size + item.byte_size, items + 1)
            }
            None => {
                let id = self.aggregate_ids.next();
                tx.execute(
                    "INSERT INTO aggregate (id, create_time_ms, fk_feed_id, byte_size, items, complete)
                     VALUES (?1, ?2, ?3, ?4, 1, 0)",
                    params![id, now, item.feed_id, item.byte_size],
                )?;
                (id, item.byte_size, 1)
            }
        };

        tx.execute(
            "UPDATE source_item SET fk_aggregate_id = ?1 WHERE id = ?2",
            params![aggregate_id, item.id],
        )?;
        tx.execute(
            "INSERT INTO aggregate_item (fk_aggregate_id, fk_source_item_id) VALUES (?1, ?2)",
            params![aggregate_id, item.id],
        )?;

        let close = items >= max_items || byte_size >= max_bytes;
        if close {
            tx.execute("UPDATE aggregate SET complete = 1 WHERE id = ?1", [aggregate_id])?;
            log::debug!(
                "Closed aggregate {} ({} items, {} bytes)",
                aggregate_id,
                items,
                byte_size
            );
        }
        Ok((true, close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::feed_keys::FeedKeys;
    use crate::repo::test_support::{aggregates, seed_source};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: i64 = 1_700_000_000_000;

    fn setup(config: AggregatorConfig) -> (Arc<ProxyDb>, FeedKeys, Aggregator) {
        let db = Arc::new(ProxyDb::in_memory().unwrap());
        let aggregator = Aggregator::new(db.clone(), config).unwrap();
        (db, FeedKeys::new(), aggregator)
    }

    fn config(max_items: i64, max_bytes: i64) -> AggregatorConfig {
        AggregatorConfig {
            max_items_per_aggregate: max_items,
            max_uncompressed_byte_size: max_bytes,
            ..AggregatorConfig::default()
        }
    }

    #[test]
    fn test_count_limit_closes_and_starts_new_aggregate() {
        let (db, keys, aggregator) = setup(config(2, 1000));
        seed_source(&db, &keys, "s1", "F", Some("T"), 1, &[400, 400, 400]);

        let closed = aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();

        assert_eq!(closed, 1);
        let aggs = aggregates(&db);
        assert_eq!(aggs.len(), 2);
        assert_eq!((aggs[0].1, aggs[0].2, aggs[0].3), (800, 2, true));
        assert_eq!((aggs[1].1, aggs[1].2, aggs[1].3), (400, 1, false));
    }

    #[test]
    fn test_oversize_item_becomes_singleton() {
        let (db, keys, aggregator) = setup(config(10, 1000));
        seed_source(&db, &keys, "s1", "F", Some("T"), 1, &[2000]);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();

        let aggs = aggregates(&db);
        assert_eq!(aggs.len(), 1);
        assert_eq!((aggs[0].1, aggs[0].2), (2000, 1));
    }

    #[test]
    fn test_byte_limit_is_never_exceeded_by_multi_item_aggregates() {
        let (db, keys, aggregator) = setup(AggregatorConfig {
            batch_size: 7,
            ..config(5, 1000)
        });
        let sizes: Vec<i64> = (0..60).map(|i| (i * 137) % 1300 + 1).collect();
        seed_source(&db, &keys, "s1", "F", None, 1, &sizes);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();

        let aggs = aggregates(&db);
        assert_eq!(aggs.iter().map(|a| a.2).sum::<i64>(), 60);
        for (id, byte_size, items, _) in aggs {
            assert!(items <= 5, "aggregate {} has {} items", id, items);
            assert!(
                items == 1 || byte_size <= 1000,
                "aggregate {} has {} bytes in {} items",
                id,
                byte_size,
                items
            );
        }
    }

    #[test]
    fn test_items_are_aggregated_once() {
        let (db, keys, aggregator) = setup(config(3, 10_000));
        seed_source(&db, &keys, "s1", "F", None, 1, &[10, 20, 30, 40]);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();
        aggregator.aggregate_at(&Interrupt::never(), NOW + 1).unwrap();
        seed_source(&db, &keys, "s2", "F", None, 2, &[50]);
        aggregator.aggregate_at(&Interrupt::never(), NOW + 2).unwrap();

        assert_eq!(db.count("aggregate_item").unwrap(), 5);
        let unstamped: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM source_item WHERE aggregated = 0 OR fk_aggregate_id IS NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(unstamped, 0);
        assert_eq!(aggregates(&db).iter().map(|a| a.2).sum::<i64>(), 5);
    }

    #[test]
    fn test_feeds_do_not_share_aggregates() {
        let (db, keys, aggregator) = setup(config(10, 10_000));
        seed_source(&db, &keys, "s1", "A", None, 1, &[10]);
        seed_source(&db, &keys, "s2", "B", None, 2, &[10]);
        seed_source(&db, &keys, "s3", "A", Some("T"), 3, &[10]);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();
        assert_eq!(aggregates(&db).len(), 3);
    }

    #[test]
    fn test_old_aggregates_close_after_frequency() {
        let (db, keys, aggregator) = setup(AggregatorConfig {
            max_aggregate_age_ms: 10_000,
            aggregation_frequency_ms: 5_000,
            ..config(10, 10_000)
        });
        seed_source(&db, &keys, "s1", "F", None, 1, &[10]);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();
        assert!(!aggregates(&db)[0].3);

        aggregator.aggregate_at(&Interrupt::never(), NOW + 10_000).unwrap();
        assert!(aggregates(&db)[0].3);
    }

    #[test]
    fn test_close_check_is_gated_by_frequency() {
        let (db, keys, aggregator) = setup(AggregatorConfig {
            max_aggregate_age_ms: 1_000,
            aggregation_frequency_ms: 60_000,
            ..config(10, 10_000)
        });
        seed_source(&db, &keys, "s1", "F", None, 1, &[10]);

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();
        aggregator.aggregate_at(&Interrupt::never(), NOW + 2_000).unwrap();
        assert!(!aggregates(&db)[0].3);

        aggregator.aggregate_at(&Interrupt::never(), NOW + 60_000).unwrap();
        assert!(aggregates(&db)[0].3);
    }

    #[test]
    fn test_first_pass_always_notifies() {
        let (_db, _keys, aggregator) = setup(AggregatorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        aggregator.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        aggregator.aggregate_at(&Interrupt::never(), NOW).unwrap();
        aggregator.aggregate_at(&Interrupt::never(), NOW + 1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
