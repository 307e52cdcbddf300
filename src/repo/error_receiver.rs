//! Where problems with individual containers are reported.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const ERROR_SUFFIX: &str = ".err";
pub const BAD_SUFFIX: &str = ".bad";

pub trait ErrorReceiver: Send + Sync {
    /// A recoverable problem with one container.
    fn error(&self, path: &Path, message: &str);

    /// The container can't be used at all and must be moved out of the way.
    fn fatal(&self, path: &Path, message: &str);
}

/// Writes errors next to the container and renames fatal containers with a
/// `.bad` suffix so the scanner won't pick them up again.
pub struct FileErrorReceiver {
    repo_dir: PathBuf,
}

impl FileErrorReceiver {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_dir.join(path)
        }
    }

    fn append_error(&self, container: &Path, message: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(with_suffix(container, ERROR_SUFFIX))?;
        writeln!(
            file,
            "{} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        )
    }
}

impl ErrorReceiver for FileErrorReceiver {
    fn error(&self, path: &Path, message: &str) {
        let container = self.resolve(path);
        log::warn!("⚠️  {}: {}", container.display(), message);
        if let Err(e) = self.append_error(&container, message) {
            log::error!("Failed to record error for {}: {}", container.display(), e);
        }
    }

    fn fatal(&self, path: &Path, message: &str) {
        let container = self.resolve(path);
        log::error!("❌ {}: {}", container.display(), message);
        if let Err(e) = self.append_error(&container, message) {
            log::error!("Failed to record error for {}: {}", container.display(), e);
        }
        if container.exists() {
            let bad = with_suffix(&container, BAD_SUFFIX);
            if let Err(e) = fs::rename(&container, &bad) {
                log::error!("Failed to rename {} to {}: {}", container.display(), bad.display(), e);
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
