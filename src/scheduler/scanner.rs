//! Directory scanner: registers containers that appear under the configured
//! scan directories.
//!
//! A container is a directory holding at least one recognised part file. Its
//! feed and type come from the first meta part that names a feed.

use super::Interrupt;
use crate::error::{RepoError, Result};
use crate::repo::error_receiver::BAD_SUFFIX;
use crate::repo::sender::SourceReader;
use crate::repo::sources::SourceRegistry;
use crate::repo::{attribute, headers, parse_attributes, split_entry_name, ExtensionType};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub struct RepoDirScanner {
    repo_dir: PathBuf,
    scan_dirs: Vec<PathBuf>,
    sources: Arc<SourceRegistry>,
    reader: Arc<dyn SourceReader>,
}

impl RepoDirScanner {
    /// Relative scan directories are resolved against `repo_dir`. Every scan
    /// directory must live inside the repository and no two may overlap.
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        scan_dirs: &[PathBuf],
        sources: Arc<SourceRegistry>,
        reader: Arc<dyn SourceReader>,
    ) -> Result<Self> {
        let repo_dir = repo_dir.into();
        let scan_dirs: Vec<PathBuf> = if scan_dirs.is_empty() {
            vec![repo_dir.clone()]
        } else {
            scan_dirs
                .iter()
                .map(|d| if d.is_absolute() { d.clone() } else { repo_dir.join(d) })
                .collect()
        };

        for dir in &scan_dirs {
            if !dir.starts_with(&repo_dir) {
                return Err(RepoError::Config(format!(
                    "scan directory {} is outside the repository {}",
                    dir.display(),
                    repo_dir.display()
                )));
            }
        }
        check_overlap(&scan_dirs)?;

        Ok(Self {
            repo_dir,
            scan_dirs,
            sources,
            reader,
        })
    }

    pub fn scan_dirs(&self) -> &[PathBuf] {
        &self.scan_dirs
    }

    /// Walk every scan directory once. Returns the number of new sources.
    pub fn scan(&self, interrupt: &Interrupt) -> Result<usize> {
        let mut added = 0;
        for dir in &self.scan_dirs {
            if !dir.is_dir() {
                log::debug!("Scan directory {} does not exist yet", dir.display());
                continue;
            }

            let mut walker = WalkDir::new(dir).follow_links(false).into_iter();
            while let Some(entry) = walker.next() {
                if interrupt.is_interrupted() {
                    return Ok(added);
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("⚠️  Scan error under {}: {}", dir.display(), e);
                        continue;
                    }
                };
                if !entry.file_type().is_dir() {
                    continue;
                }
                if entry.file_name().to_string_lossy().ends_with(BAD_SUFFIX) {
                    walker.skip_current_dir();
                    continue;
                }
                if self.try_register(entry.path())? {
                    added += 1;
                }
                // Containers don't nest.
                if self.is_container(entry.path()) {
                    walker.skip_current_dir();
                }
            }
        }

        if added > 0 {
            log::info!("📥 Scanner registered {} new source(s)", added);
        }
        Ok(added)
    }

    fn is_container(&self, dir: &Path) -> bool {
        self.reader
            .list_entries(dir)
            .map(|entries| {
                entries.iter().any(|e| {
                    ExtensionType::from_extension(split_entry_name(&e.name).1).is_some()
                })
            })
            .unwrap_or(false)
    }

    /// Register `dir` if it is an unregistered container with a feed.
    fn try_register(&self, dir: &Path) -> Result<bool> {
        let Some(relative) = self.relative_path(dir) else {
            return Ok(false);
        };
        if relative.is_empty() || !self.is_container(dir) || self.sources.source_exists(&relative)? {
            return Ok(false);
        }

        let mut entries = self.reader.list_entries(dir)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut feed_and_type = None;
        for entry in &entries {
            let (_, extension) = split_entry_name(&entry.name);
            if ExtensionType::from_extension(extension) != Some(ExtensionType::Meta) {
                continue;
            }
            let mut text = String::new();
            self.reader.open_entry(dir, &entry.name)?.read_to_string(&mut text)?;
            let attributes = parse_attributes(&text);
            if let Some(feed) = attribute(&attributes, headers::FEED) {
                feed_and_type = Some((
                    feed.to_string(),
                    attribute(&attributes, headers::TYPE).map(str::to_string),
                    attributes,
                ));
                break;
            }
        }

        let Some((feed, type_name, attributes)) = feed_and_type else {
            log::debug!("Container {} has no feed yet; skipping", dir.display());
            return Ok(false);
        };

        let last_modified_ms = std::fs::metadata(dir)
            .and_then(|m| m.modified())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or_else(|_| crate::repo::now_ms());

        self.sources
            .add_source(&relative, &feed, type_name.as_deref(), last_modified_ms, &attributes)?;
        Ok(true)
    }

    fn relative_path(&self, dir: &Path) -> Option<String> {
        dir.strip_prefix(&self.repo_dir)
            .ok()
            .and_then(|p| p.to_str())
            .map(|p| p.replace('\\', "/"))
    }
}

/// Fail if any scan directory contains another.
fn check_overlap(dirs: &[PathBuf]) -> Result<()> {
    for (i, a) in dirs.iter().enumerate() {
        for b in dirs.iter().skip(i + 1) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(RepoError::Config(format!(
                    "scan directories overlap: {} and {}",
                    a.display(),
                    b.display()
                )));
            }
        }
    }
    Ok(())
}
