//! Proxy repository lifecycle: builds every component from a
//! [`ProxyRepoConfig`], wires stage notifications together and owns the
//! background executors.
//!
//! Aggregated mode:
//! ```text
//! scan ─→ examine ─→ aggregate ─→ forward ─→ cleanup
//!                                    ↑
//!                                  retry
//! ```
//! Per-source mode skips examination and aggregation and forwards each source
//! as a whole.

use crate::config::ProxyRepoConfig;
use crate::error::Result;
use crate::repo::error_receiver::{ErrorReceiver, FileErrorReceiver};
use crate::repo::sender::{DirSourceReader, ForwardDestinations, RepoSender, Sender, SourceReader};
use crate::repo::{
    AggregateKind, Aggregator, Cleanup, Examiner, FeedKeys, ForwardDestRegistry, Forwarder,
    ForwardingMode, ProxyDb, SourceKind, SourceRegistry,
};
use crate::scheduler::{
    work, ChangeExecutor, ChangeSignal, ExecutorHandle, FrequencyExecutor, Interrupt,
    RepoDirScanner,
};
use std::sync::Arc;
use std::time::Duration;

/// Mode-specific stages.
enum Stages {
    Aggregated {
        examiner: Arc<Examiner>,
        aggregator: Arc<Aggregator>,
        forwarder: Arc<Forwarder<AggregateKind>>,
    },
    PerSource {
        forwarder: Arc<Forwarder<SourceKind>>,
    },
}

/// Totals from one synchronous [`ProxyRepo::process_once`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub scanned: usize,
    pub examined: usize,
    pub closed: usize,
    pub forwarded: usize,
    pub retried: usize,
    pub deleted_aggregates: usize,
    pub deleted_sources: usize,
}

pub struct ProxyRepo {
    config: ProxyRepoConfig,
    db: Arc<ProxyDb>,
    dests: Arc<ForwardDestRegistry>,
    sources: Arc<SourceRegistry>,
    scanner: Arc<RepoDirScanner>,
    cleanup: Arc<Cleanup>,
    stages: Stages,
    examine_signal: Arc<ChangeSignal>,
    aggregate_signal: Arc<ChangeSignal>,
    forward_signal: Arc<ChangeSignal>,
    executors: Vec<ExecutorHandle>,
}

impl ProxyRepo {
    /// Open the repository and build every component. Nothing runs until
    /// [`start`](Self::start) (or [`process_once`](Self::process_once)).
    pub fn open(
        config: ProxyRepoConfig,
        destinations: Arc<dyn ForwardDestinations>,
        failure_destinations: Arc<dyn ForwardDestinations>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.repo_dir)?;

        let db = Arc::new(ProxyDb::open(&config.db_path, &config.db_pragmas)?);
        Self::with_db(config, db, destinations, failure_destinations)
    }

    /// Build on an already opened database.
    pub fn with_db(
        config: ProxyRepoConfig,
        db: Arc<ProxyDb>,
        destinations: Arc<dyn ForwardDestinations>,
        failure_destinations: Arc<dyn ForwardDestinations>,
    ) -> Result<Self> {
        let dests = Arc::new(ForwardDestRegistry::reconcile(&db, &config.forward_destinations)?);
        let feed_keys = Arc::new(FeedKeys::new());
        let reader: Arc<dyn SourceReader> = Arc::new(DirSourceReader);
        let sender: Arc<dyn Sender> = Arc::new(RepoSender::new(&config.repo_dir, reader.clone()));

        let sources = Arc::new(SourceRegistry::new(db.clone(), feed_keys.clone())?);
        let scanner = Arc::new(RepoDirScanner::new(
            &config.repo_dir,
            &config.scan_dirs,
            sources.clone(),
            reader.clone(),
        )?);

        let mode = config.forwarding_mode();
        let cleanup = Arc::new(Cleanup::new(
            db.clone(),
            sources.clone(),
            &config.repo_dir,
            mode,
            config.cleanup_batch_size,
            config.forwarder.retire_old_destinations,
        ));

        let examine_signal = ChangeSignal::new();
        let aggregate_signal = ChangeSignal::new();
        let forward_signal = ChangeSignal::new();

        let stages = match mode {
            ForwardingMode::Aggregated => {
                let errors: Arc<dyn ErrorReceiver> = Arc::new(FileErrorReceiver::new(&config.repo_dir));
                let examiner = Arc::new(Examiner::new(
                    db.clone(),
                    feed_keys.clone(),
                    reader.clone(),
                    errors,
                    &config.repo_dir,
                )?);
                let aggregator = Arc::new(Aggregator::new(db.clone(), config.aggregator.clone())?);
                let forwarder = Arc::new(Forwarder::<AggregateKind>::new(
                    db.clone(),
                    dests.clone(),
                    destinations,
                    failure_destinations,
                    sender,
                    config.forwarder.clone(),
                ));

                let signal = examine_signal.clone();
                sources.add_listener(move |_| signal.signal());
                let signal = aggregate_signal.clone();
                examiner.add_listener(move |_| signal.signal());
                let signal = forward_signal.clone();
                aggregator.add_listener(move |_| signal.signal());

                Stages::Aggregated {
                    examiner,
                    aggregator,
                    forwarder,
                }
            }
            ForwardingMode::PerSource => {
                let forwarder = Arc::new(Forwarder::<SourceKind>::new(
                    db.clone(),
                    dests.clone(),
                    destinations,
                    failure_destinations,
                    sender,
                    config.forwarder.clone(),
                ));

                let signal = forward_signal.clone();
                sources.add_listener(move |_| signal.signal());

                Stages::PerSource { forwarder }
            }
        };

        Ok(Self {
            config,
            db,
            dests,
            sources,
            scanner,
            cleanup,
            stages,
            examine_signal,
            aggregate_signal,
            forward_signal,
            executors: Vec::new(),
        })
    }

    pub fn config(&self) -> &ProxyRepoConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<ProxyDb> {
        &self.db
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn destinations(&self) -> &Arc<ForwardDestRegistry> {
        &self.dests
    }

    pub fn is_running(&self) -> bool {
        !self.executors.is_empty()
    }

    /// Work that must happen once before the loops start.
    fn prepare(&self) -> Result<()> {
        let retired = match &self.stages {
            Stages::Aggregated { forwarder, .. } => forwarder.retire_old_destinations()?,
            Stages::PerSource { forwarder } => forwarder.retire_old_destinations()?,
        };
        if retired > 0 {
            log::info!("🧹 Retired {} record(s) for removed destinations", retired);
        }

        let orphans = self.cleanup.delete_orphans()?;
        if orphans > 0 {
            log::info!("🧹 Removed {} orphaned director(ies)", orphans);
        }
        Ok(())
    }

    /// Spawn every executor. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!("⚠️  Proxy repository already started");
            return Ok(());
        }
        self.prepare()?;

        log::info!("🚀 Starting proxy repository executors...");
        let ms = Duration::from_millis;
        let forwarder_cfg = &self.config.forwarder;
        let retry_every = ms(forwarder_cfg.retry_frequency_ms.max(1) as u64);
        let aggregate_every = ms(self.config.aggregator.aggregation_frequency_ms.max(1) as u64);

        let scanner = self.scanner.clone();
        self.executors.push(FrequencyExecutor::spawn(
            "scanner",
            ms(self.config.scan_frequency_ms),
            work(move |interrupt| scanner.scan(interrupt).map(drop)),
        ));

        match &self.stages {
            Stages::Aggregated {
                examiner,
                aggregator,
                forwarder,
            } => {
                let examiner = examiner.clone();
                self.executors.push(ChangeExecutor::spawn(
                    "examiner",
                    self.examine_signal.clone(),
                    aggregate_every,
                    work(move |interrupt| examiner.examine(interrupt).map(drop)),
                ));

                let aggregator = aggregator.clone();
                self.executors.push(ChangeExecutor::spawn(
                    "aggregator",
                    self.aggregate_signal.clone(),
                    aggregate_every,
                    work(move |interrupt| aggregator.aggregate(interrupt).map(drop)),
                ));

                let (forward, retry) = (forwarder.clone(), forwarder.clone());
                self.executors.push(ChangeExecutor::spawn(
                    "aggregate forwarder",
                    self.forward_signal.clone(),
                    retry_every,
                    work(move |interrupt| forward.forward(interrupt).map(drop)),
                ));
                self.executors.push(FrequencyExecutor::spawn(
                    "aggregate retry",
                    retry_every,
                    work(move |interrupt| retry.forward_retry(interrupt).map(drop)),
                ));
            }
            Stages::PerSource { forwarder } => {
                let (forward, retry) = (forwarder.clone(), forwarder.clone());
                self.executors.push(ChangeExecutor::spawn(
                    "source forwarder",
                    self.forward_signal.clone(),
                    retry_every,
                    work(move |interrupt| forward.forward(interrupt).map(drop)),
                ));
                self.executors.push(FrequencyExecutor::spawn(
                    "source retry",
                    retry_every,
                    work(move |interrupt| retry.forward_retry(interrupt).map(drop)),
                ));
            }
        }

        let cleanup = self.cleanup.clone();
        self.executors.push(FrequencyExecutor::spawn(
            "cleanup",
            ms(self.config.cleanup_frequency_ms),
            work(move |interrupt| cleanup.cleanup(interrupt).map(drop)),
        ));

        for (i, handle) in self.executors.iter().enumerate() {
            let branch = if i + 1 == self.executors.len() { "└─" } else { "├─" };
            log::info!("   {} {}", branch, handle.name());
        }
        log::info!("✅ Proxy repository running ({} executors)", self.executors.len());
        Ok(())
    }

    /// Stop every executor and wait for in-flight work to finish.
    pub async fn stop(&mut self) {
        if self.executors.is_empty() {
            return;
        }
        log::info!("⚠️  Stopping proxy repository...");
        for handle in &self.executors {
            handle.stop();
        }
        for handle in self.executors.drain(..).rev() {
            handle.shutdown().await;
        }
        log::info!("✅ Proxy repository stopped");
    }

    /// Run every stage once, in pipeline order, on the calling thread.
    pub fn process_once(&self, interrupt: &Interrupt) -> Result<PassStats> {
        let mut stats = PassStats {
            scanned: self.scanner.scan(interrupt)?,
            ..PassStats::default()
        };

        match &self.stages {
            Stages::Aggregated {
                examiner,
                aggregator,
                forwarder,
            } => {
                stats.examined = examiner.examine(interrupt)?;
                stats.closed = aggregator.aggregate(interrupt)?;
                stats.forwarded = forwarder.forward(interrupt)?;
                stats.retried = forwarder.forward_retry(interrupt)?;
            }
            Stages::PerSource { forwarder } => {
                stats.forwarded = forwarder.forward(interrupt)?;
                stats.retried = forwarder.forward_retry(interrupt)?;
            }
        }

        let cleaned = self.cleanup.cleanup(interrupt)?;
        stats.deleted_aggregates = cleaned.aggregates;
        stats.deleted_sources = cleaned.sources;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_support::MemoryDestinations;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(repo_dir: &Path, aggregated: bool) -> ProxyRepoConfig {
        let mut config = ProxyRepoConfig {
            repo_dir: repo_dir.to_path_buf(),
            forward_destinations: vec!["primary".to_string()],
            forward_dir: repo_dir.with_extension("forward"),
            failed_forward_dir: repo_dir.with_extension("failed"),
            aggregation_enabled: aggregated,
            ..ProxyRepoConfig::default()
        };
        config.aggregator.max_aggregate_age_ms = 0;
        config.aggregator.aggregation_frequency_ms = 10;
        config
    }

    fn container(root: &Path, path: &str, feed: &str) {
        let dir = root.join(path);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("001.meta"), format!("Feed:{}\n", feed)).unwrap();
        std::fs::write(dir.join("001.dat"), "payload").unwrap();
    }

    fn repo(config: ProxyRepoConfig, dests: Arc<MemoryDestinations>) -> ProxyRepo {
        let db = Arc::new(ProxyDb::in_memory().unwrap());
        ProxyRepo::with_db(config, db, dests, Arc::new(MemoryDestinations::default())).unwrap()
    }

    #[test]
    fn test_process_once_aggregated() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        container(&repo_dir, "in/c1", "FEED-A");
        container(&repo_dir, "in/c2", "FEED-A");

        let dests = Arc::new(MemoryDestinations::default());
        let mut config = config(&repo_dir, true);
        config.aggregator.max_items_per_aggregate = 2;
        let repo = repo(config, dests.clone());

        let stats = repo.process_once(&Interrupt::never()).unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.deleted_aggregates, 1);
        assert_eq!(stats.deleted_sources, 2);

        assert_eq!(dests.received().len(), 1);
        assert_eq!(repo.sources().count_sources().unwrap(), 0);
        assert!(!repo_dir.join("in/c1").exists());
    }

    #[test]
    fn test_process_once_per_source() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        container(&repo_dir, "c1", "FEED-A");

        let dests = Arc::new(MemoryDestinations::default());
        let repo = repo(config(&repo_dir, false), dests.clone());

        let stats = repo.process_once(&Interrupt::never()).unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.examined, 0);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.deleted_sources, 1);
        assert_eq!(dests.received().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        let mut config = config(&repo_dir, true);
        config.scan_frequency_ms = 10;
        config.cleanup_frequency_ms = 10;
        container(&repo_dir, "in/c1", "FEED-A");

        let dests = Arc::new(MemoryDestinations::default());
        let mut repo = repo(config, dests.clone());
        repo.start().unwrap();
        assert!(repo.is_running());

        // scan → examine → aggregate → forward are chained by signals
        let mut delivered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !dests.received().is_empty() {
                delivered = true;
                break;
            }
        }

        repo.stop().await;
        assert!(!repo.is_running());
        assert!(delivered);
    }
}
