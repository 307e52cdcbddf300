use super::interrupt::interrupt_pair;
use super::{run_unit, ExecutorHandle, Work};
use std::time::Duration;
use tokio::time::Instant;

/// Runs a unit of work, then sleeps for whatever is left of `frequency`.
/// Runs never overlap: a slow run simply delays the next one.
pub struct FrequencyExecutor;

impl FrequencyExecutor {
    pub fn spawn(name: impl Into<String>, frequency: Duration, work: Work) -> ExecutorHandle {
        let name = name.into();
        let (trigger, interrupt) = interrupt_pair();
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            log::info!("⏰ Starting {} (every {}ms)", task_name, frequency.as_millis());
            let mut stop = interrupt.clone();

            while !interrupt.is_interrupted() {
                let started = Instant::now();
                run_unit(&task_name, &work, &interrupt).await;

                let wait = frequency.saturating_sub(started.elapsed());
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
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
