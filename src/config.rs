//! Proxy repository configuration from environment variables.

use crate::error::{RepoError, Result};
use crate::repo::{AggregatorConfig, ForwarderConfig, ForwardingMode};
use crate::sqlite_pragma::default_pragmas;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Everything needed to build a [`crate::lifecycle::ProxyRepo`].
#[derive(Debug, Clone)]
pub struct ProxyRepoConfig {
    /// Root directory holding received containers
    pub repo_dir: PathBuf,

    /// Path to the SQLite repository database
    pub db_path: PathBuf,

    /// PRAGMA statements applied when the database is opened
    pub db_pragmas: Vec<String>,

    /// Names of the configured forward destinations
    pub forward_destinations: Vec<String>,

    /// Root directory of the file-system destinations
    pub forward_dir: PathBuf,

    /// Root directory of the failure destinations
    pub failed_forward_dir: PathBuf,

    /// Examine and aggregate sources (true) or forward whole sources (false)
    pub aggregation_enabled: bool,

    pub aggregator: AggregatorConfig,

    pub forwarder: ForwarderConfig,

    pub cleanup_frequency_ms: u64,
    pub cleanup_batch_size: usize,

    /// Directories watched for new containers; empty means the whole repository
    pub scan_dirs: Vec<PathBuf>,
    pub scan_frequency_ms: u64,
}

impl Default for ProxyRepoConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("./repo"),
            db_path: PathBuf::from("./proxy-repo.db"),
            db_pragmas: default_pragmas(),
            forward_destinations: Vec::new(),
            forward_dir: PathBuf::from("./forward"),
            failed_forward_dir: PathBuf::from("./failed-forward"),
            aggregation_enabled: true,
            aggregator: AggregatorConfig::default(),
            forwarder: ForwarderConfig::default(),
            cleanup_frequency_ms: 60_000,
            cleanup_batch_size: 1_000,
            scan_dirs: Vec::new(),
            scan_frequency_ms: 10_000,
        }
    }
}

impl ProxyRepoConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `PROXY_REPO_DIR` (default: ./repo)
    /// - `PROXY_DB_PATH` (default: ./proxy-repo.db)
    /// - `PROXY_DB_PRAGMAS` (semicolon separated, default: WAL tuning set)
    /// - `PROXY_FORWARD_DESTINATIONS` (comma separated, required)
    /// - `PROXY_FORWARD_DIR` (default: ./forward)
    /// - `PROXY_FAILED_FORWARD_DIR` (default: ./failed-forward)
    /// - `PROXY_AGGREGATION_ENABLED` (default: true)
    /// - `PROXY_MAX_ITEMS_PER_AGGREGATE` (default: 1000)
    /// - `PROXY_MAX_UNCOMPRESSED_BYTES` (default: 1 GiB)
    /// - `PROXY_MAX_AGGREGATE_AGE_MS` (default: 600000)
    /// - `PROXY_AGGREGATION_FREQUENCY_MS` (default: 60000)
    /// - `PROXY_RETRY_FREQUENCY_MS` (default: 60000)
    /// - `PROXY_MAX_RETRY_DELAY_MS` (default: 86400000)
    /// - `PROXY_MAX_TRIES` (default: 10)
    /// - `PROXY_FORWARD_RETIRE_OLD` (default: false)
    /// - `PROXY_CLEANUP_FREQUENCY_MS` (default: 60000)
    /// - `PROXY_CLEANUP_BATCH_SIZE` (default: 1000)
    /// - `PROXY_SCAN_DIRS` (comma separated, default: the repository root)
    /// - `PROXY_SCAN_FREQUENCY_MS` (default: 10000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let aggregator = AggregatorConfig {
            max_items_per_aggregate: parse_or(&var, "PROXY_MAX_ITEMS_PER_AGGREGATE", defaults.aggregator.max_items_per_aggregate),
            max_uncompressed_byte_size: parse_or(&var, "PROXY_MAX_UNCOMPRESSED_BYTES", defaults.aggregator.max_uncompressed_byte_size),
            max_aggregate_age_ms: parse_or(&var, "PROXY_MAX_AGGREGATE_AGE_MS", defaults.aggregator.max_aggregate_age_ms),
            aggregation_frequency_ms: parse_or(&var, "PROXY_AGGREGATION_FREQUENCY_MS", defaults.aggregator.aggregation_frequency_ms),
            batch_size: parse_or(&var, "PROXY_AGGREGATION_BATCH_SIZE", defaults.aggregator.batch_size),
        };

        let forwarder = ForwarderConfig {
            retry_frequency_ms: parse_or(&var, "PROXY_RETRY_FREQUENCY_MS", defaults.forwarder.retry_frequency_ms),
            max_retry_delay_ms: parse_or(&var, "PROXY_MAX_RETRY_DELAY_MS", defaults.forwarder.max_retry_delay_ms),
            max_tries: parse_or(&var, "PROXY_MAX_TRIES", defaults.forwarder.max_tries),
            retire_old_destinations: parse_or(&var, "PROXY_FORWARD_RETIRE_OLD", defaults.forwarder.retire_old_destinations),
            ..defaults.forwarder.clone()
        };

        Self {
            repo_dir: var("PROXY_REPO_DIR").map(PathBuf::from).unwrap_or(defaults.repo_dir),
            db_path: var("PROXY_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            db_pragmas: var("PROXY_DB_PRAGMAS")
                .map(|s| split_list(&s, ';'))
                .unwrap_or(defaults.db_pragmas),
            forward_destinations: var("PROXY_FORWARD_DESTINATIONS")
                .map(|s| split_list(&s, ','))
                .unwrap_or_default(),
            forward_dir: var("PROXY_FORWARD_DIR").map(PathBuf::from).unwrap_or(defaults.forward_dir),
            failed_forward_dir: var("PROXY_FAILED_FORWARD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.failed_forward_dir),
            aggregation_enabled: parse_or(&var, "PROXY_AGGREGATION_ENABLED", defaults.aggregation_enabled),
            aggregator,
            forwarder,
            cleanup_frequency_ms: parse_or(&var, "PROXY_CLEANUP_FREQUENCY_MS", defaults.cleanup_frequency_ms),
            cleanup_batch_size: parse_or(&var, "PROXY_CLEANUP_BATCH_SIZE", defaults.cleanup_batch_size),
            scan_dirs: var("PROXY_SCAN_DIRS")
                .map(|s| split_list(&s, ',').into_iter().map(PathBuf::from).collect())
                .unwrap_or_default(),
            scan_frequency_ms: parse_or(&var, "PROXY_SCAN_FREQUENCY_MS", defaults.scan_frequency_ms),
        }
    }

    pub fn forwarding_mode(&self) -> ForwardingMode {
        if self.aggregation_enabled {
            ForwardingMode::Aggregated
        } else {
            ForwardingMode::PerSource
        }
    }

    /// Reject configurations that can't work.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(RepoError::Config(msg.to_string())) };

        if self.forward_destinations.is_empty() {
            return fail("PROXY_FORWARD_DESTINATIONS must name at least one destination");
        }
        if self.forward_dir == self.failed_forward_dir {
            return fail("forward and failed-forward directories must differ");
        }
        for dir in [&self.forward_dir, &self.failed_forward_dir] {
            if dir.starts_with(&self.repo_dir) {
                return fail("forward directories must live outside the repository");
            }
        }
        if self.aggregator.max_items_per_aggregate < 1 {
            return fail("max items per aggregate must be at least 1");
        }
        if self.aggregator.max_uncompressed_byte_size < 1 {
            return fail("max uncompressed byte size must be at least 1");
        }
        if self.aggregator.max_aggregate_age_ms < 0 || self.aggregator.aggregation_frequency_ms < 1 {
            return fail("aggregate age must be >= 0 and aggregation frequency >= 1ms");
        }
        if self.forwarder.retry_frequency_ms < 1 || self.forwarder.max_retry_delay_ms < 1 {
            return fail("retry frequency and max retry delay must be at least 1ms");
        }
        if self.forwarder.max_tries < 1 {
            return fail("max tries must be at least 1");
        }
        if self.cleanup_frequency_ms == 0 || self.scan_frequency_ms == 0 {
            return fail("cleanup and scan frequencies must be at least 1ms");
        }
        if self.cleanup_batch_size == 0 || self.aggregator.batch_size == 0 {
            return fail("cleanup and aggregation batch sizes must be at least 1");
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        log::info!("🔧 Proxy repository configuration:");
        log::info!("   ├─ Repository: {}", self.repo_dir.display());
        log::info!("   ├─ Database: {}", self.db_path.display());
        log::info!("   ├─ Destinations: {}", self.forward_destinations.join(", "));
        log::info!("   ├─ Forward dir: {}", self.forward_dir.display());
        log::info!("   ├─ Failed forward dir: {}", self.failed_forward_dir.display());
        if self.aggregation_enabled {
            log::info!(
                "   ├─ Aggregation: max {} items, {} bytes, {}ms age",
                self.aggregator.max_items_per_aggregate,
                self.aggregator.max_uncompressed_byte_size,
                self.aggregator.max_aggregate_age_ms
            );
        } else {
            log::info!("   ├─ Aggregation: disabled (forwarding whole sources)");
        }
        log::info!(
            "   └─ Retry: every {}ms, max delay {}ms, max tries {}",
            self.forwarder.retry_frequency_ms,
            self.forwarder.max_retry_delay_ms,
            self.forwarder.max_tries
        );
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("⚠️  Ignoring unparsable {}={}", key, raw);
            default
        }),
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
