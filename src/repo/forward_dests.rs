//! Stable ids for forward destination names.
//!
//! Names are reconciled against the `forward_dest` table at startup. Names seen
//! before but no longer configured become "old" (`enabled = 0`): they get no new
//! forward records and cleanup no longer waits for them to succeed. Records they
//! already hold are kept, so their data stays until the name is configured again.

use super::db::ProxyDb;
use crate::error::{RepoError, Result};
use rusqlite::params;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub struct ForwardDestRegistry {
    names: BTreeMap<i64, String>,
    enabled: BTreeSet<i64>,
    new_ids: BTreeSet<i64>,
    old_ids: BTreeSet<i64>,
}

impl ForwardDestRegistry {
    pub fn reconcile(db: &ProxyDb, configured: &[String]) -> Result<Self> {
        let configured: BTreeSet<&str> = configured
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        if configured.is_empty() {
            return Err(RepoError::Config(
                "at least one forward destination is required".to_string(),
            ));
        }

        db.transaction(|tx| {
            let known: Vec<(i64, String, bool)> = {
                let mut stmt = tx.prepare("SELECT id, name, enabled FROM forward_dest ORDER BY id")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut registry = Self {
                names: BTreeMap::new(),
                enabled: BTreeSet::new(),
                new_ids: BTreeSet::new(),
                old_ids: BTreeSet::new(),
            };

            for (id, name, was_enabled) in known {
                let wanted = configured.contains(name.as_str());
                if wanted != was_enabled {
                    tx.execute(
                        "UPDATE forward_dest SET enabled = ?1 WHERE id = ?2",
                        params![wanted, id],
                    )?;
                }
                if wanted {
                    registry.enabled.insert(id);
                } else {
                    registry.old_ids.insert(id);
                }
                registry.names.insert(id, name);
            }

            for name in configured {
                if registry.names.values().any(|known| known == name) {
                    continue;
                }
                tx.execute(
                    "INSERT INTO forward_dest (name, enabled) VALUES (?1, 1)",
                    [name],
                )?;
                let id = tx.last_insert_rowid();
                registry.names.insert(id, name.to_string());
                registry.enabled.insert(id);
                registry.new_ids.insert(id);
            }

            Ok(registry)
        })
        .map(|registry| {
            log::info!("🔧 Forward destinations:");
            for (id, name) in &registry.names {
                let state = if registry.new_ids.contains(id) {
                    "new"
                } else if registry.old_ids.contains(id) {
                    "old"
                } else {
                    "enabled"
                };
                log::info!("   ├─ {} (id {}, {})", name, id, state);
            }
            registry
        })
    }

    /// Known destinations that are no longer configured.
    pub fn old_ids(&self) -> Vec<i64> {
        self.old_ids.iter().copied().collect()
    }

    /// Every configured destination.
    pub fn ids(&self) -> Vec<i64> {
        self.enabled.iter().copied().collect()
    }

    pub fn name(&self, id: i64) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }
}

/// SQL condition that holds while `target` still has an undelivered record in
/// `table` for a destination that is no longer configured. Such records are
/// kept (and block cleanup) until the destination is re-added. With
/// `retire_old` set, never-attempted records don't count.
pub(crate) fn undelivered_to_old_destination(
    table: &str,
    target_column: &str,
    target: &str,
    retire_old: bool,
) -> String {
    format!(
        "EXISTS (SELECT 1 FROM {table} r JOIN forward_dest od ON od.id = r.fk_forward_dest_id
                 WHERE r.{target_column} = {target} AND od.enabled = 0 AND r.success = 0{attempted})",
        attempted = if retire_old { " AND r.tries > 0" } else { "" },
    )
}
