//! Change-driven execution.
//!
//! A [`ChangeSignal`] is bumped by whoever creates new work. The executor runs
//! its unit, then waits for the next signal (or `frequency`, whichever comes
//! first). Any number of signals raised while a run is in progress collapse
//! into exactly one follow-up run, detected by comparing the generation seen
//! before the run with the current one.

use super::interrupt::interrupt_pair;
use super::{run_unit, ExecutorHandle, Work};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ChangeSignal {
    generation: AtomicU64,
    notify: Notify,
}

impl ChangeSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a change. Safe to call from any thread, including blocking
    /// units of work.
    pub fn signal(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of signals raised so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Wait until the generation moves past `seen`. Returns at once if it
    /// already has.
    pub async fn changed_since(&self, seen: u64) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking, so a signal in between still wakes us.
        notified.as_mut().enable();
        if self.generation() != seen {
            return;
        }
        notified.await;
    }
}

pub struct ChangeExecutor;

impl ChangeExecutor {
    /// Run `work` immediately, then again after every signal and at least once
    /// per `frequency`.
    pub fn spawn(
        name: impl Into<String>,
        signal: Arc<ChangeSignal>,
        frequency: Duration,
        work: Work,
    ) -> ExecutorHandle {
        let name = name.into();
        let (trigger, interrupt) = interrupt_pair();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            log::info!(
                "🔔 Starting {} (on change, at least every {}ms)",
                task_name,
                frequency.as_millis()
            );
            let mut stop = interrupt.clone();

            while !interrupt.is_interrupted() {
                let generation = signal.generation();
                run_unit(&task_name, &work, &interrupt).await;
                log::trace!("{} ran at generation {}", task_name, generation);

                tokio::select! {
                    _ = signal.changed_since(generation) => {}
                    _ = tokio::time::sleep(frequency) => {}
                    _ = stop.interrupted() => break,
                }
            }

            log::info!("   └─ {} stopped", task_name);
        });

        ExecutorHandle {
            name,
            trigger,
            task,
        }
    }
}
