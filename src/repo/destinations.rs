//! File-system forward destinations.
//!
//! Each destination name maps to a directory. Every forward lands in its own
//! numbered sub-directory holding the forwarded entries plus a `forward.json`
//! manifest. Work happens in a hidden staging directory that is renamed into
//! place once complete, so a half-written forward is never visible.

use super::sender::{id_path, ForwardDestinations, StreamHandler, StreamHandlers};
use super::AttributeMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const MANIFEST_FILE: &str = "forward.json";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardManifest {
    pub feed: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub attributes: AttributeMap,
    pub entries: Vec<ManifestEntry>,
    pub forwarded_at: i64,
}

impl ForwardManifest {
    pub fn load(dir: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        serde_json::from_str(&json).map_err(io::Error::from)
    }
}

/// One destination directory.
pub struct FileStreamHandlers {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl FileStreamHandlers {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let last = highest_forward_number(&dir)?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(last),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StreamHandlers for FileStreamHandlers {
    fn handle(
        &self,
        feed: &str,
        type_name: Option<&str>,
        attributes: &AttributeMap,
        consumer: &mut dyn FnMut(&mut dyn StreamHandler) -> io::Result<()>,
    ) -> io::Result<()> {
        let number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let staging = self.dir.join(format!("{}{}", STAGING_PREFIX, id_path(number)));
        fs::create_dir_all(&staging)?;

        let mut handler = FileStreamHandler {
            dir: &staging,
            entries: Vec::new(),
        };

        let result = consumer(&mut handler).and_then(|_| {
            let manifest = ForwardManifest {
                feed: feed.to_string(),
                type_name: type_name.map(str::to_string),
                attributes: attributes.clone(),
                entries: std::mem::take(&mut handler.entries),
                forwarded_at: super::now_ms(),
            };
            let file = File::create(staging.join(MANIFEST_FILE))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &manifest)?;
            writer.flush()?;
            fs::rename(&staging, self.dir.join(id_path(number)))
        });

        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                log::warn!("Failed to remove staging dir {}: {}", staging.display(), e);
            }
        }
        result
    }
}

struct FileStreamHandler<'a> {
    dir: &'a Path,
    entries: Vec<ManifestEntry>,
}

impl StreamHandler for FileStreamHandler<'_> {
    fn add_entry(&mut self, name: &str, data: &mut dyn Read) -> io::Result<u64> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == MANIFEST_FILE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid entry name '{}'", name),
            ));
        }
        let mut out = BufWriter::new(File::create(self.dir.join(name))?);
        let size = io::copy(data, &mut out)?;
        out.flush()?;
        self.entries.push(ManifestEntry {
            name: name.to_string(),
            size,
        });
        Ok(size)
    }
}

/// Maps destination names to directories beneath one root. The same type backs
/// the failure destinations, rooted elsewhere.
pub struct FileForwardDestinations {
    root: PathBuf,
    handlers: Mutex<HashMap<String, Arc<FileStreamHandlers>>>,
}

impl FileForwardDestinations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ForwardDestinations for FileForwardDestinations {
    fn provider(&self, name: &str) -> Option<Arc<dyn StreamHandlers>> {
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name.starts_with('.') {
            log::error!("Invalid forward destination name '{}'", name);
            return None;
        }

        let mut handlers = self.handlers.lock().ok()?;
        if let Some(existing) = handlers.get(name) {
            return Some(existing.clone());
        }
        match FileStreamHandlers::open(self.root.join(name)) {
            Ok(created) => {
                let created = Arc::new(created);
                handlers.insert(name.to_string(), created.clone());
                Some(created)
            }
            Err(e) => {
                log::error!("Failed to open forward destination '{}': {}", name, e);
                None
            }
        }
    }
}

/// Largest numbered forward directory (staging directories included) so
/// numbering continues after a restart.
fn highest_forward_number(dir: &Path) -> io::Result<u64> {
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let digits = name.strip_prefix(STAGING_PREFIX).unwrap_or(&name);
        if let Ok(n) = digits.parse::<u64>() {
            highest = highest.max(n);
        }
    }
    Ok(highest)
}
