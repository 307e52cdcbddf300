//! Cleanup: removes data whose forwarding is finished.
//!
//! Aggregates go first (with their items and entries), which in turn makes
//! their sources deletable. A source's files are always deleted before its
//! rows; if the files can't be removed the rows stay and the next pass retries.

use super::db::ProxyDb;
use super::forward_dests::undelivered_to_old_destination;
use super::sources::{ForwardingMode, Source, SourceRegistry};
use crate::error::Result;
use crate::scheduler::Interrupt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub aggregates: usize,
    pub sources: usize,
}

pub struct Cleanup {
    db: Arc<ProxyDb>,
    sources: Arc<SourceRegistry>,
    repo_dir: PathBuf,
    mode: ForwardingMode,
    batch_size: usize,
    retire_old_destinations: bool,
}

impl Cleanup {
    pub fn new(
        db: Arc<ProxyDb>,
        sources: Arc<SourceRegistry>,
        repo_dir: impl Into<PathBuf>,
        mode: ForwardingMode,
        batch_size: usize,
        retire_old_destinations: bool,
    ) -> Self {
        Self {
            db,
            sources,
            repo_dir: repo_dir.into(),
            mode,
            batch_size: batch_size.max(1),
            retire_old_destinations,
        }
    }

    pub fn cleanup(&self, interrupt: &Interrupt) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        if self.mode == ForwardingMode::Aggregated {
            stats.aggregates = self.delete_forwarded_aggregates(interrupt)?;
        }
        stats.sources = self.delete_finished_sources(interrupt)?;

        if stats != CleanupStats::default() {
            log::info!(
                "🧹 Cleanup removed {} aggregate(s), {} source(s)",
                stats.aggregates,
                stats.sources
            );
        }
        Ok(stats)
    }

    /// Complete aggregates that every enabled destination has accepted and no
    /// old destination still waits for.
    fn forwarded_aggregates(&self) -> Result<Vec<i64>> {
        let held = undelivered_to_old_destination(
            "forward_aggregate",
            "fk_aggregate_id",
            "a.id",
            self.retire_old_destinations,
        );
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT a.id FROM aggregate a
                 WHERE a.complete = 1
                   AND EXISTS (SELECT 1 FROM forward_dest d WHERE d.enabled = 1)
                   AND NOT EXISTS (
                      SELECT 1 FROM forward_dest d
                      WHERE d.enabled = 1
                        AND NOT EXISTS (
                          SELECT 1 FROM forward_aggregate fa
                          WHERE fa.fk_aggregate_id = a.id
                            AND fa.fk_forward_dest_id = d.id
                            AND fa.success = 1))
                   AND NOT {}
                 ORDER BY a.id
                 LIMIT ?1",
                held
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([self.batch_size as i64], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
        })
    }

    fn delete_forwarded_aggregates(&self, interrupt: &Interrupt) -> Result<usize> {
        let mut deleted = 0;
        loop {
            let batch = self.forwarded_aggregates()?;
            for id in &batch {
                if interrupt.is_interrupted() {
                    return Ok(deleted);
                }
                self.delete_aggregate(*id)?;
                deleted += 1;
            }
            if batch.len() < self.batch_size {
                return Ok(deleted);
            }
        }
    }

    /// Children go before parents: join rows reference items, entries
    /// reference items, forward records and join rows reference the aggregate.
    fn delete_aggregate(&self, id: i64) -> Result<()> {
        self.db.transaction(|tx| {
            let item_ids: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT fk_source_item_id FROM aggregate_item WHERE fk_aggregate_id = ?1")?;
                let rows = stmt.query_map([id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            tx.execute("DELETE FROM forward_aggregate WHERE fk_aggregate_id = ?1", [id])?;
            tx.execute("DELETE FROM aggregate_item WHERE fk_aggregate_id = ?1", [id])?;
            for item_id in &item_ids {
                tx.execute("DELETE FROM source_entry WHERE fk_source_item_id = ?1", [item_id])?;
                tx.execute("DELETE FROM source_item WHERE id = ?1", [item_id])?;
            }
            tx.execute("DELETE FROM aggregate WHERE id = ?1", [id])?;
            Ok(())
        })?;
        log::debug!("Deleted aggregate {}", id);
        Ok(())
    }

    fn delete_finished_sources(&self, interrupt: &Interrupt) -> Result<usize> {
        let mut deleted = 0;
        let mut skipped = 0;
        loop {
            let batch = self.sources.get_deletable_sources(
                self.batch_size + skipped,
                self.mode,
                self.retire_old_destinations,
            )?;
            let fetched = batch.len();
            let mut progressed = false;
            for source in batch.iter().skip(skipped) {
                if interrupt.is_interrupted() {
                    return Ok(deleted);
                }
                if self.delete_source(source)? {
                    deleted += 1;
                    progressed = true;
                } else {
                    skipped += 1;
                }
            }
            if fetched < self.batch_size + skipped || !progressed {
                return Ok(deleted);
            }
        }
    }

    /// Returns false when the files could not be removed; the rows are kept.
    fn delete_source(&self, source: &Source) -> Result<bool> {
        let path = self.repo_dir.join(&source.path);
        if let Err(e) = remove_path(&path) {
            log::error!("Unable to delete {}: {}", path.display(), e);
            return Ok(false);
        }
        self.sources.delete_source(source)?;
        self.remove_empty_parents(&path);
        Ok(true)
    }

    fn remove_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.repo_dir || !dir.starts_with(&self.repo_dir) {
                break;
            }
            // Fails (and stops) on the first non-empty directory.
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    /// Remove empty directories under the repository root that are not
    /// registered sources. Returns how many were removed.
    pub fn delete_orphans(&self) -> Result<usize> {
        if !self.repo_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&self.repo_dir)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let is_empty = fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(false);
            if !is_empty {
                continue;
            }
            let Some(relative) = path
                .strip_prefix(&self.repo_dir)
                .ok()
                .and_then(|p| p.to_str())
                .map(|p| p.replace('\\', "/"))
            else {
                continue;
            };
            if self.sources.source_exists(&relative)? {
                continue;
            }
            if fs::remove_dir(path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("🧹 Removed {} empty director(ies)", removed);
        }
        Ok(removed)
    }
}

/// Delete a file or directory tree; a missing path counts as deleted.
fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
