//! Source item examiner: turns each unexamined container into item and entry
//! rows exactly once.

use super::db::{IdSequence, ProxyDb};
use super::error_receiver::ErrorReceiver;
use super::feed_keys::{FeedKey, FeedKeys};
use super::listeners::{Listeners, SourceExamined};
use super::sender::SourceReader;
use super::sources::{Source, SOURCE_COLUMNS};
use super::{attribute, headers, parse_attributes, split_entry_name, ExtensionType};
use crate::error::{RepoError, Result};
use crate::scheduler::Interrupt;
use rayon::prelude::*;
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One classified part of a container.
#[derive(Debug, Clone)]
struct Part {
    item_name: String,
    extension: String,
    extension_type: ExtensionType,
    size: u64,
}

pub struct Examiner {
    db: Arc<ProxyDb>,
    feed_keys: Arc<FeedKeys>,
    reader: Arc<dyn SourceReader>,
    errors: Arc<dyn ErrorReceiver>,
    repo_dir: PathBuf,
    item_ids: IdSequence,
    entry_ids: IdSequence,
    /// Sources that failed examination in this process; not retried.
    failed: Mutex<HashSet<i64>>,
    listeners: Listeners<SourceExamined>,
}

impl Examiner {
    pub fn new(
        db: Arc<ProxyDb>,
        feed_keys: Arc<FeedKeys>,
        reader: Arc<dyn SourceReader>,
        errors: Arc<dyn ErrorReceiver>,
        repo_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let item_ids = IdSequence::from_table(&db, "source_item")?;
        let entry_ids = IdSequence::from_table(&db, "source_entry")?;
        Ok(Self {
            db,
            feed_keys,
            reader,
            errors,
            repo_dir: repo_dir.into(),
            item_ids,
            entry_ids,
            failed: Mutex::new(HashSet::new()),
            listeners: Listeners::default(),
        })
    }

    pub fn add_listener(&self, listener: impl Fn(&SourceExamined) + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    /// Examine every unexamined source in parallel. Returns how many were
    /// examined successfully.
    pub fn examine(&self, interrupt: &Interrupt) -> Result<usize> {
        let failed = self.failed.lock()?.clone();
        let pending: Vec<Source> = self
            .unexamined_sources()?
            .into_iter()
            .filter(|s| !failed.contains(&s.id))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        log::debug!("Examining {} source(s)", pending.len());

        let examined = pending
            .par_iter()
            .filter(|_| !interrupt.is_interrupted())
            .filter(|source| match self.examine_source(source) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Failed to examine source {} ({}): {}", source.id, source.path, e);
                    false
                }
            })
            .count();

        Ok(examined)
    }

    fn unexamined_sources(&self) -> Result<Vec<Source>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM source s JOIN feed f ON f.id = s.fk_feed_id
                 WHERE s.examined = 0
                 ORDER BY s.last_modified_time_ms, s.id",
                SOURCE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], Source::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Examine one source. Unreadable containers are reported as fatal and
    /// remembered; database failures are returned so the next pass retries.
    pub fn examine_source(&self, source: &Source) -> Result<()> {
        let container = self.repo_dir.join(&source.path);

        let (parts, item_feeds) = match self.read_parts(&container) {
            Ok(read) => read,
            Err(e) => {
                self.errors
                    .fatal(Path::new(&source.path), &format!("unable to examine: {}", e));
                self.failed.lock()?.insert(source.id);
                return Err(e);
            }
        };

        // Intern feed keys before taking the transaction.
        let mut feed_ids: HashMap<String, i64> = HashMap::new();
        for (item_name, key) in &item_feeds {
            feed_ids.insert(item_name.clone(), self.feed_keys.id(&self.db, key)?);
        }

        let item_count = self.db.transaction(|tx| {
            let mut next_item_number: i64 = tx.query_row(
                "SELECT COALESCE(MAX(item_number), 0) FROM source_item WHERE fk_source_id = ?1",
                [source.id],
                |row| row.get(0),
            )?;

            // Item numbers follow name order, whatever order the parts are read in.
            let mut item_names: Vec<&str> = parts.iter().map(|p| p.item_name.as_str()).collect();
            item_names.sort_unstable();
            item_names.dedup();

            let mut ids_by_name: HashMap<&str, i64> = HashMap::with_capacity(item_names.len());
            for name in item_names {
                let feed_id = feed_ids.get(name).copied();
                let existing: Option<(i64, Option<i64>)> = tx
                    .query_row(
                        "SELECT id, fk_feed_id FROM source_item WHERE fk_source_id = ?1 AND name = ?2",
                        params![source.id, name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let item_id = match existing {
                    Some((id, None)) if feed_id.is_some() => {
                        tx.execute(
                            "UPDATE source_item SET fk_feed_id = ?1 WHERE id = ?2",
                            params![feed_id, id],
                        )?;
                        id
                    }
                    Some((id, _)) => id,
                    None => {
                        let id = self.item_ids.next();
                        next_item_number += 1;
                        tx.execute(
                            "INSERT INTO source_item (id, name, item_number, fk_feed_id, fk_source_id, aggregated)
                             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                            params![id, name, next_item_number, feed_id, source.id],
                        )?;
                        id
                    }
                };
                ids_by_name.insert(name, item_id);
            }

            for part in &parts {
                let Some(&item_id) = ids_by_name.get(part.item_name.as_str()) else {
                    continue;
                };
                tx.execute(
                    "INSERT INTO source_entry (id, extension, extension_type, byte_size, fk_source_item_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        self.entry_ids.next(),
                        part.extension,
                        part.extension_type.as_i64(),
                        part.size as i64,
                        item_id
                    ],
                )?;
            }

            let item_count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM source_item WHERE fk_source_id = ?1",
                [source.id],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE source SET examined = 1, item_count = ?1 WHERE id = ?2",
                params![item_count, source.id],
            )?;
            Ok(item_count)
        })?;

        log::debug!(
            "Examined source {} ({}): {} part(s), {} item(s)",
            source.id,
            source.path,
            parts.len(),
            item_count
        );

        self.listeners.notify(&SourceExamined {
            source_id: source.id,
        });
        Ok(())
    }

    /// List and classify parts (meta, then context, then data) and read the
    /// feed/type of every item that has a meta part naming a feed.
    fn read_parts(&self, container: &Path) -> Result<(Vec<Part>, HashMap<String, FeedKey>)> {
        let mut parts: Vec<Part> = self
            .reader
            .list_entries(container)?
            .into_iter()
            .filter_map(|entry| {
                let (stem, extension) = split_entry_name(&entry.name);
                let extension_type = ExtensionType::from_extension(extension)?;
                Some(Part {
                    item_name: stem.to_string(),
                    extension: extension.to_string(),
                    extension_type,
                    size: entry.size,
                })
            })
            .collect();
        parts.sort_by(|a, b| {
            a.extension_type
                .cmp(&b.extension_type)
                .then_with(|| a.item_name.cmp(&b.item_name))
        });

        let mut item_feeds = HashMap::new();
        for part in parts.iter().filter(|p| p.extension_type == ExtensionType::Meta) {
            let mut text = String::new();
            self.reader
                .open_entry(container, &format!("{}{}", part.item_name, part.extension))?
                .read_to_string(&mut text)
                .map_err(RepoError::from)?;

            let attributes = parse_attributes(&text);
            if let Some(feed) = attribute(&attributes, headers::FEED) {
                item_feeds.insert(
                    part.item_name.clone(),
                    FeedKey::new(feed, attribute(&attributes, headers::TYPE)),
                );
            }
        }

        Ok((parts, item_feeds))
    }

    #[cfg(test)]
    fn failed_count(&self) -> usize {
        self.failed.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::error_receiver::FileErrorReceiver;
    use crate::repo::sender::DirSourceReader;
    use crate::repo::sources::SourceRegistry;
    use crate::repo::AttributeMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        db: Arc<ProxyDb>,
        sources: SourceRegistry,
        examiner: Examiner,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(ProxyDb::in_memory().unwrap());
        let feed_keys = Arc::new(FeedKeys::new());
        let sources = SourceRegistry::new(db.clone(), feed_keys.clone()).unwrap();
        let examiner = Examiner::new(
            db.clone(),
            feed_keys,
            Arc::new(DirSourceReader),
            Arc::new(FileErrorReceiver::new(dir.path())),
            dir.path(),
        )
        .unwrap();
        Fixture { dir, db, sources, examiner }
    }

    fn write_container(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            fs::write(dir.join(file), content).unwrap();
        }
    }

    #[test]
    fn test_items_and_entries_are_recorded() {
        let f = fixture();
        write_container(
            f.dir.path(),
            "c1",
            &[
                ("001.dat", "0123456789"),
                ("001.meta", "Feed:OTHER\nType:Events"),
                ("002.dat", "abc"),
                ("002.ctx", "c"),
                ("readme.txt", "skipped"),
            ],
        );
        f.sources.add_source("c1", "F", None, 1, &AttributeMap::new()).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        f.examiner.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        assert_eq!(f.db.count("source_item").unwrap(), 2);
        assert_eq!(f.db.count("source_entry").unwrap(), 4);

        let (examined, item_count): (bool, i64) = f
            .db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT examined, item_count FROM source", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?)
            })
            .unwrap();
        assert!(examined);
        assert_eq!(item_count, 2);

        // Item 001 carries its own feed from the meta part; 002 inherits.
        let feeds: Vec<(String, Option<String>)> = f
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT si.name, fe.feed_name FROM source_item si
                     LEFT JOIN feed fe ON fe.id = si.fk_feed_id ORDER BY si.item_number",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .unwrap();
        assert_eq!(
            feeds,
            vec![
                ("001".to_string(), Some("OTHER".to_string())),
                ("002".to_string(), None)
            ]
        );

        // Nothing left to examine
        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 0);
    }

    #[test]
    fn test_item_numbers_follow_name_order() {
        let f = fixture();
        write_container(
            f.dir.path(),
            "c1",
            &[("001.dat", "a"), ("002.meta", "Feed:OTHER"), ("002.dat", "b"), ("003.ctx", "c")],
        );
        f.sources.add_source("c1", "F", None, 1, &AttributeMap::new()).unwrap();
        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 1);

        let numbers: Vec<(String, i64)> = f
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT name, item_number FROM source_item ORDER BY name")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .unwrap();
        assert_eq!(
            numbers,
            vec![("001".to_string(), 1), ("002".to_string(), 2), ("003".to_string(), 3)]
        );
    }

    #[test]
    fn test_unreadable_source_is_marked_bad_and_skipped() {
        let f = fixture();
        f.sources.add_source("missing", "F", None, 1, &AttributeMap::new()).unwrap();

        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 0);
        assert_eq!(f.examiner.failed_count(), 1);
        assert!(f.dir.path().join("missing.err").exists());

        // Not retried, and still unexamined
        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 0);
        assert_eq!(f.db.count("source_item").unwrap(), 0);
        let unexamined: i64 = f
            .db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM source WHERE examined = 0", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(unexamined, 1);
    }

    #[test]
    fn test_many_sources_examined_in_parallel() {
        let f = fixture();
        for i in 0..20 {
            let name = format!("c{}", i);
            write_container(f.dir.path(), &name, &[("001.dat", "x"), ("002.dat", "yy")]);
            f.sources.add_source(&name, "F", None, i, &AttributeMap::new()).unwrap();
        }

        assert_eq!(f.examiner.examine(&Interrupt::never()).unwrap(), 20);
        assert_eq!(f.db.count("source_item").unwrap(), 40);
    }
}
