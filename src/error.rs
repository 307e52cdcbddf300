//! Repository error types.

/// Errors produced by the proxy repository and its background tasks.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (reading a container, writing a forward).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Inconsistent configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A source was offered without a feed name.
    #[error("feed name is required for source '{0}'")]
    MissingFeed(String),

    /// A destination rejected or failed to receive forwarded data.
    #[error("send failed: {0}")]
    Send(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("repository lock poisoned")]
    LockPoisoned,
}

impl<T> From<std::sync::PoisonError<T>> for RepoError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        RepoError::LockPoisoned
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RepoError>;
