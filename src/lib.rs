//! feedproxy - store-and-forward proxy repository.
//!
//! Received containers are registered as sources, examined into items,
//! packed into aggregates and forwarded to every configured destination with
//! retry and failover. Forwarded data is then cleaned out of the repository.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod repo;
pub mod scheduler;
pub mod sqlite_pragma;

pub use config::ProxyRepoConfig;
pub use error::{RepoError, Result};
pub use lifecycle::{PassStats, ProxyRepo};
