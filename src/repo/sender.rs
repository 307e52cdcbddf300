//! Boundary traits for reading containers and streaming their bytes out.
//!
//! The repository never interprets container bytes. It only knows that a
//! container holds named entries with sizes; [`SourceReader`] lists and opens
//! them and [`Sender`] copies them into a destination's [`StreamHandler`].

use super::AttributeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: String,
    pub size: u64,
}

/// Read access to the entries of a container.
pub trait SourceReader: Send + Sync {
    fn list_entries(&self, container: &Path) -> io::Result<Vec<RawEntry>>;

    fn open_entry(&self, container: &Path, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Containers stored as plain directories: each regular file is one entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirSourceReader;

impl SourceReader for DirSourceReader {
    fn list_entries(&self, container: &Path) -> io::Result<Vec<RawEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(container)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(RawEntry {
                name: dir_entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open_entry(&self, container: &Path, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(container.join(name))?))
    }
}

/// Receives the entries of one forward, in order.
pub trait StreamHandler {
    /// Copy one entry; returns the number of bytes written.
    fn add_entry(&mut self, name: &str, data: &mut dyn Read) -> io::Result<u64>;
}

/// A destination: opens a handler for one forward and finishes it once the
/// consumer has written every entry. Any error means nothing was delivered.
pub trait StreamHandlers: Send + Sync {
    fn handle(
        &self,
        feed: &str,
        type_name: Option<&str>,
        attributes: &AttributeMap,
        consumer: &mut dyn FnMut(&mut dyn StreamHandler) -> io::Result<()>,
    ) -> io::Result<()>;
}

/// Resolves configured destination names to destinations.
pub trait ForwardDestinations: Send + Sync {
    fn provider(&self, name: &str) -> Option<Arc<dyn StreamHandlers>>;
}

/// One item of an aggregate and the extensions of its parts, in send order.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemParts {
    pub name: String,
    pub extensions: Vec<String>,
}

/// The items of an aggregate that came from one source container.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItems {
    pub source_path: String,
    pub items: Vec<ItemParts>,
}

/// Streams stored data into a destination handler.
pub trait Sender: Send + Sync {
    fn send_aggregate(&self, items: &[SourceItems], handler: &mut dyn StreamHandler) -> io::Result<()>;

    fn send_source(&self, source_path: &str, handler: &mut dyn StreamHandler) -> io::Result<()>;
}

/// [`Sender`] over containers stored beneath a repository directory.
pub struct RepoSender {
    repo_dir: PathBuf,
    reader: Arc<dyn SourceReader>,
}

impl RepoSender {
    pub fn new(repo_dir: impl Into<PathBuf>, reader: Arc<dyn SourceReader>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            reader,
        }
    }

    fn copy_entry(
        &self,
        container: &Path,
        source_name: &str,
        target_name: &str,
        handler: &mut dyn StreamHandler,
    ) -> io::Result<()> {
        let mut input = self.reader.open_entry(container, source_name)?;
        let written = handler.add_entry(target_name, &mut input)?;
        if written == 0 {
            log::warn!("Entry {} in {} IS BLANK", source_name, container.display());
        }
        log::trace!("Sent {} as {} ({} bytes)", source_name, target_name, written);
        Ok(())
    }
}

impl Sender for RepoSender {
    /// Items are renumbered `001`, `002`, ... in the forwarded stream so names
    /// from different sources can't collide.
    fn send_aggregate(&self, items: &[SourceItems], handler: &mut dyn StreamHandler) -> io::Result<()> {
        let mut sequence = 1u64;
        for source in items {
            let container = self.repo_dir.join(&source.source_path);
            for item in &source.items {
                let target_name = id_path(sequence);
                sequence += 1;
                for extension in &item.extensions {
                    self.copy_entry(
                        &container,
                        &format!("{}{}", item.name, extension),
                        &format!("{}{}", target_name, extension),
                        handler,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn send_source(&self, source_path: &str, handler: &mut dyn StreamHandler) -> io::Result<()> {
        let container = self.repo_dir.join(source_path);
        for entry in self.reader.list_entries(&container)? {
            self.copy_entry(&container, &entry.name, &entry.name, handler)?;
        }
        Ok(())
    }
}

/// Zero-pad `id` to a multiple of three digits: 1 → `001`, 1234 → `001234`.
pub fn id_path(id: u64) -> String {
    let digits = id.to_string();
    let width = digits.len().div_ceil(3) * 3;
    format!("{:0>width$}", digits, width = width)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Handler that keeps everything in memory.
    #[derive(Default)]
    pub(crate) struct CapturingHandler {
        pub entries: Vec<(String, Vec<u8>)>,
    }

    impl StreamHandler for CapturingHandler {
        fn add_entry(&mut self, name: &str, data: &mut dyn Read) -> io::Result<u64> {
            let mut buf = Vec::new();
            let n = data.read_to_end(&mut buf)?;
            self.entries.push((name.to_string(), buf));
            Ok(n as u64)
        }
    }

    #[test]
    fn test_id_path_padding() {
        assert_eq!(id_path(1), "001");
        assert_eq!(id_path(999), "999");
        assert_eq!(id_path(1000), "001000");
        assert_eq!(id_path(123456), "123456");
    }

    #[test]
    fn test_dir_reader_lists_files_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("002.dat"), b"bb").unwrap();
        fs::write(dir.path().join("001.dat"), b"a").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let entries = DirSourceReader.list_entries(dir.path()).unwrap();
        assert_eq!(
            entries,
            vec![
                RawEntry { name: "001.dat".to_string(), size: 1 },
                RawEntry { name: "002.dat".to_string(), size: 2 },
            ]
        );
    }

    #[test]
    fn test_send_aggregate_renumbers_across_sources() {
        let repo = tempdir().unwrap();
        for (src, name) in [("a", "x"), ("b", "x")] {
            let dir = repo.path().join(src);
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join(format!("{}.meta", name)), format!("Feed:{}", src)).unwrap();
            fs::write(dir.join(format!("{}.dat", name)), src).unwrap();
        }

        let sender = RepoSender::new(repo.path(), Arc::new(DirSourceReader));
        let items: Vec<SourceItems> = ["a", "b"]
            .iter()
            .map(|src| SourceItems {
                source_path: src.to_string(),
                items: vec![ItemParts {
                    name: "x".to_string(),
                    extensions: vec![".meta".to_string(), ".dat".to_string()],
                }],
            })
            .collect();

        let mut handler = CapturingHandler::default();
        sender.send_aggregate(&items, &mut handler).unwrap();

        let names: Vec<&str> = handler.entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["001.meta", "001.dat", "002.meta", "002.dat"]);
        assert_eq!(handler.entries[3].1, b"b");
    }

    #[test]
    fn test_send_missing_source_fails() {
        let repo = tempdir().unwrap();
        let sender = RepoSender::new(repo.path(), Arc::new(DirSourceReader));
        let mut handler = CapturingHandler::default();
        assert!(sender.send_source("missing", &mut handler).is_err());
    }
}
