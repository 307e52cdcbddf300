//! Background scheduling scaffold.
//!
//! Every repository task (examine, aggregate, forward, retry, cleanup, scan) is
//! a blocking unit of work driven by one long-lived tokio task:
//!
//! - [`FrequencyExecutor`]: run, then sleep out the rest of the period.
//! - [`ChangeExecutor`]: run, then wait for a [`ChangeSignal`] or the period.
//!
//! Units run on the blocking pool. A failing or panicking unit is logged and
//! the loop carries on.

pub mod change;
pub mod frequency;
pub mod interrupt;
pub mod scanner;

pub use change::{ChangeExecutor, ChangeSignal};
pub use frequency::FrequencyExecutor;
pub use interrupt::{interrupt_pair, Interrupt, InterruptTrigger};
pub use scanner::RepoDirScanner;

use crate::error::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A unit of work. It should return promptly once `interrupt` fires.
pub type Work = Arc<dyn Fn(&Interrupt) -> Result<()> + Send + Sync>;

/// Box a closure as [`Work`].
pub fn work<F>(f: F) -> Work
where
    F: Fn(&Interrupt) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle to a running executor.
pub struct ExecutorHandle {
    name: String,
    trigger: InterruptTrigger,
    task: JoinHandle<()>,
}

impl ExecutorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the executor to stop. An in-flight unit runs to completion.
    pub fn stop(&self) {
        self.trigger.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            log::error!("❌ Executor {} ended abnormally: {}", self.name, e);
        }
    }
}

/// Run `work` once on the blocking pool, logging failures and panics.
async fn run_unit(name: &str, work: &Work, interrupt: &Interrupt) {
    let work = work.clone();
    let unit_interrupt = interrupt.clone();
    match tokio::task::spawn_blocking(move || work(&unit_interrupt)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("❌ {} failed: {}", name, e),
        Err(e) if e.is_panic() => log::error!("❌ {} panicked", name),
        Err(e) => log::warn!("⚠️  {} was cancelled: {}", name, e),
    }
}
