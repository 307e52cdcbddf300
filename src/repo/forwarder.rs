//! Forwarder: one forward record per (target, destination), driven through the
//! [`ForwardState`] machine until it is delivered.
//!
//! The same machinery forwards closed aggregates ([`AggregateKind`]) and whole
//! sources ([`SourceKind`]); the kind only decides which table holds the
//! records, which targets are ready and how a target's bytes are streamed.

use super::db::ProxyDb;
use super::forward_dests::ForwardDestRegistry;
use super::retry::{is_retry_due, ForwardState};
use super::sender::{ForwardDestinations, ItemParts, Sender, SourceItems, StreamHandler};
use super::sources::load_source;
use super::{headers, now_ms, AttributeMap};
use crate::error::Result;
use crate::scheduler::Interrupt;
use rusqlite::{params, Connection, OptionalExtension};
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

/// What a forwarder forwards.
pub trait ForwardKind: Send + Sync + 'static {
    type Target: Send;

    /// Table holding the forward records.
    const TABLE: &'static str;
    /// Column of the record table referencing the target.
    const TARGET_COLUMN: &'static str;
    /// Query yielding `id` for every target that should have records.
    const READY_SQL: &'static str;
    /// Used in log lines.
    const LABEL: &'static str;

    /// Load a target with its feed and type. `None` if it no longer exists.
    fn load(conn: &Connection, id: i64) -> Result<Option<(String, Option<String>, Self::Target)>>;

    fn send(sender: &dyn Sender, target: &Self::Target, handler: &mut dyn StreamHandler) -> io::Result<()>;
}

/// Closed aggregates, streamed item by item.
pub struct AggregateKind;

impl ForwardKind for AggregateKind {
    type Target = Vec<SourceItems>;

    const TABLE: &'static str = "forward_aggregate";
    const TARGET_COLUMN: &'static str = "fk_aggregate_id";
    const READY_SQL: &'static str = "SELECT id FROM aggregate WHERE complete = 1";
    const LABEL: &'static str = "aggregate";

    fn load(conn: &Connection, id: i64) -> Result<Option<(String, Option<String>, Self::Target)>> {
        let feed: Option<(String, String)> = conn
            .query_row(
                "SELECT f.feed_name, f.type_name FROM aggregate a
                 JOIN feed f ON f.id = a.fk_feed_id WHERE a.id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((feed, type_name)) = feed else {
            return Ok(None);
        };

        let mut item_stmt = conn.prepare(
            "SELECT s.path, si.id, si.name FROM aggregate_item ai
             JOIN source_item si ON si.id = ai.fk_source_item_id
             JOIN source s ON s.id = si.fk_source_id
             WHERE ai.fk_aggregate_id = ?1
             ORDER BY s.last_modified_time_ms, s.id, si.item_number",
        )?;
        let rows: Vec<(String, i64, String)> = item_stmt
            .query_map([id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut entry_stmt = conn.prepare(
            "SELECT extension FROM source_entry WHERE fk_source_item_id = ?1
             ORDER BY extension_type, id",
        )?;

        let mut grouped: Vec<SourceItems> = Vec::new();
        for (path, item_id, name) in rows {
            let extensions = entry_stmt
                .query_map([item_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            let item = ItemParts { name, extensions };
            match grouped.last_mut() {
                Some(last) if last.source_path == path => last.items.push(item),
                _ => grouped.push(SourceItems {
                    source_path: path,
                    items: vec![item],
                }),
            }
        }

        Ok(Some((feed, non_empty(type_name), grouped)))
    }

    fn send(sender: &dyn Sender, target: &Self::Target, handler: &mut dyn StreamHandler) -> io::Result<()> {
        sender.send_aggregate(target, handler)
    }
}

/// Whole sources, forwarded without examination.
pub struct SourceKind;

impl ForwardKind for SourceKind {
    type Target = String;

    const TABLE: &'static str = "forward_source";
    const TARGET_COLUMN: &'static str = "fk_source_id";
    const READY_SQL: &'static str = "SELECT id FROM source";
    const LABEL: &'static str = "source";

    fn load(conn: &Connection, id: i64) -> Result<Option<(String, Option<String>, Self::Target)>> {
        Ok(load_source(conn, id)?.map(|s| (s.feed, s.type_name, s.path)))
    }

    fn send(sender: &dyn Sender, target: &Self::Target, handler: &mut dyn StreamHandler) -> io::Result<()> {
        sender.send_source(target, handler)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub retry_frequency_ms: i64,
    pub max_retry_delay_ms: i64,
    pub max_tries: i64,
    /// Delete never-attempted records of destinations that are no longer
    /// configured. Off by default: unsent records are kept.
    pub retire_old_destinations: bool,
    pub batch_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            retry_frequency_ms: 60 * 1000,
            max_retry_delay_ms: 24 * 60 * 60 * 1000,
            max_tries: 10,
            retire_old_destinations: false,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct ForwardRecord {
    id: i64,
    dest_id: i64,
    target_id: i64,
    tries: i64,
    error: Option<String>,
    last_try_ms: Option<i64>,
}

pub struct Forwarder<K: ForwardKind> {
    db: Arc<ProxyDb>,
    dests: Arc<ForwardDestRegistry>,
    destinations: Arc<dyn ForwardDestinations>,
    failure_destinations: Arc<dyn ForwardDestinations>,
    sender: Arc<dyn Sender>,
    config: ForwarderConfig,
    _kind: PhantomData<K>,
}

impl<K: ForwardKind> Forwarder<K> {
    pub fn new(
        db: Arc<ProxyDb>,
        dests: Arc<ForwardDestRegistry>,
        destinations: Arc<dyn ForwardDestinations>,
        failure_destinations: Arc<dyn ForwardDestinations>,
        sender: Arc<dyn Sender>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            db,
            dests,
            destinations,
            failure_destinations,
            sender,
            config,
            _kind: PhantomData,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Make sure every ready target has one record per enabled destination.
    /// Returns the number of records created.
    pub fn create_forward_records(&self) -> Result<usize> {
        let sql = format!(
            "INSERT OR IGNORE INTO {table} (update_time_ms, fk_forward_dest_id, {column}, success, tries)
             SELECT ?1, d.id, t.id, 0, 0
             FROM ({ready}) t CROSS JOIN forward_dest d
             WHERE d.enabled = 1",
            table = K::TABLE,
            column = K::TARGET_COLUMN,
            ready = K::READY_SQL,
        );
        let created = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, [now_ms()])?))?;
        if created > 0 {
            log::debug!("Created {} {} forward record(s)", created, K::LABEL);
        }
        Ok(created)
    }

    /// Create records, then attempt every record that has never been tried.
    /// Returns the number of successful forwards.
    pub fn forward(&self, interrupt: &Interrupt) -> Result<usize> {
        self.create_forward_records()?;

        let sql = format!(
            "{} WHERE d.enabled = 1 AND r.success = 0 AND r.tries = 0
             ORDER BY r.id LIMIT ?1",
            self.record_select()
        );

        let mut delivered = 0;
        loop {
            let batch = self.load_records(&sql, params![self.config.batch_size as i64])?;
            for record in &batch {
                if interrupt.is_interrupted() {
                    return Ok(delivered);
                }
                delivered += usize::from(self.attempt(record, now_ms())?);
            }
            if batch.len() < self.config.batch_size {
                return Ok(delivered);
            }
        }
    }

    pub fn forward_retry(&self, interrupt: &Interrupt) -> Result<usize> {
        self.forward_retry_at(interrupt, now_ms())
    }

    /// Walk the retry queue once, oldest first. Records whose backoff has not
    /// elapsed are pushed to the back of the queue.
    pub fn forward_retry_at(&self, interrupt: &Interrupt, now: i64) -> Result<usize> {
        let queue = format!(
            "{} WHERE d.enabled = 1 AND r.success = 0 AND r.tries > 0 AND r.update_time_ms < ?1
             ORDER BY r.update_time_ms, r.id LIMIT ?2",
            self.record_select()
        );

        let oldest = self.load_records(&queue, params![now, 1])?;
        let Some(oldest) = oldest.first() else {
            return Ok(0);
        };
        let oldest_last_try = oldest.last_try_ms.unwrap_or(0);
        if oldest_last_try.saturating_add(self.config.retry_frequency_ms) > now {
            log::trace!("Oldest {} retry not due yet", K::LABEL);
            return Ok(0);
        }

        let mut delivered = 0;
        loop {
            let batch = self.load_records(&queue, params![now, self.config.batch_size as i64])?;
            for record in &batch {
                if interrupt.is_interrupted() {
                    return Ok(delivered);
                }
                let due = is_retry_due(
                    now,
                    record.last_try_ms.unwrap_or(0),
                    record.tries,
                    self.config.retry_frequency_ms,
                    self.config.max_retry_delay_ms,
                );
                if due {
                    delivered += usize::from(self.attempt(record, now)?);
                } else {
                    self.push_back(record, now)?;
                }
            }
            if batch.len() < self.config.batch_size {
                return Ok(delivered);
            }
        }
    }

    /// With `retire_old_destinations` set, delete never-attempted records of
    /// destinations that are no longer configured.
    pub fn retire_old_destinations(&self) -> Result<usize> {
        if !self.config.retire_old_destinations {
            return Ok(0);
        }
        let old = self.dests.old_ids();
        if old.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE success = 0 AND tries = 0 AND fk_forward_dest_id = ?1",
            K::TABLE
        );
        let retired = self.db.transaction(|tx| {
            let mut retired = 0;
            for id in &old {
                retired += tx.execute(&sql, [id])?;
            }
            Ok(retired)
        })?;
        if retired > 0 {
            log::info!("🔧 Retired {} unsent {} forward(s) to old destinations", retired, K::LABEL);
        }
        Ok(retired)
    }

    fn record_select(&self) -> String {
        format!(
            "SELECT r.id, r.fk_forward_dest_id, r.{column}, r.tries, r.error, r.last_try_time_ms
             FROM {table} r JOIN forward_dest d ON d.id = r.fk_forward_dest_id",
            table = K::TABLE,
            column = K::TARGET_COLUMN,
        )
    }

    fn load_records(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ForwardRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, |row| {
                Ok(ForwardRecord {
                    id: row.get(0)?,
                    dest_id: row.get(1)?,
                    target_id: row.get(2)?,
                    tries: row.get(3)?,
                    error: row.get(4)?,
                    last_try_ms: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn push_back(&self, record: &ForwardRecord, now: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET update_time_ms = ?1 WHERE id = ?2", K::TABLE);
        self.db
            .with_conn(|conn| Ok(conn.execute(&sql, params![now, record.id]).map(|_| ())?))
    }

    /// Send one record and store the outcome. Returns whether it was delivered.
    fn attempt(&self, record: &ForwardRecord, now: i64) -> Result<bool> {
        let state = ForwardState::of(false, record.tries, self.config.max_tries);
        let dest_name = self.dests.name(record.dest_id).unwrap_or_default().to_string();

        let loaded = self.db.with_conn(|conn| K::load(conn, record.target_id))?;
        let Some((feed, type_name, target)) = loaded else {
            log::warn!(
                "Dropping forward {}: {} {} no longer exists",
                record.id,
                K::LABEL,
                record.target_id
            );
            let sql = format!("DELETE FROM {} WHERE id = ?1", K::TABLE);
            self.db.with_conn(|conn| Ok(conn.execute(&sql, [record.id]).map(|_| ())?))?;
            return Ok(false);
        };

        let mut attributes = AttributeMap::new();
        attributes.insert(headers::COMPRESSION.to_string(), headers::COMPRESSION_ZIP.to_string());
        attributes.insert(headers::RECEIVED_PATH.to_string(), hostname().to_string());
        attributes.insert(headers::FEED.to_string(), feed.clone());
        if let Some(type_name) = &type_name {
            attributes.insert(headers::TYPE.to_string(), type_name.clone());
        }
        if cfg!(debug_assertions) {
            attributes.insert(headers::PROXY_FORWARD_ID.to_string(), record.id.to_string());
        }

        let provider = if state.uses_failure_destination() {
            if let Some(error) = &record.error {
                attributes.insert(headers::FORWARD_ERROR.to_string(), error.clone());
            }
            self.failure_destinations.provider(&dest_name)
        } else {
            self.destinations.provider(&dest_name)
        };

        let result = match provider {
            Some(provider) => provider.handle(&feed, type_name.as_deref(), &attributes, &mut |handler| {
                K::send(self.sender.as_ref(), &target, handler)
            }),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no provider for destination '{}'", dest_name),
            )),
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        let success = error.is_none();
        let sql = format!(
            "UPDATE {} SET success = ?1, error = ?2, tries = tries + 1,
                 last_try_time_ms = ?3, update_time_ms = ?3
             WHERE id = ?4",
            K::TABLE
        );
        self.db
            .with_conn(|conn| Ok(conn.execute(&sql, params![success, error, now, record.id])?))?;

        let route = if state.uses_failure_destination() { " (failure destination)" } else { "" };
        match &error {
            None => log::info!(
                "✅ Forwarded {} {} to {}{}",
                K::LABEL,
                record.target_id,
                dest_name,
                route
            ),
            Some(e) => log::warn!(
                "⚠️  Forward of {} {} to {}{} failed (try {}): {}",
                K::LABEL,
                record.target_id,
                dest_name,
                route,
                record.tries + 1,
                e
            ),
        }
        Ok(success)
    }
}

/// Host name reported in the `ReceivedPath` attribute, resolved once.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}
