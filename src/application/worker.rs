use super::executor::ConversionExecutor;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Summary of one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTick {
    pub recovered: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub awaiting_reconciliation: usize,
}

/// Drains pending conversions and sweeps stale executions on a fixed interval.
pub struct ConversionWorker {
    executor: Arc<ConversionExecutor>,
    poll_interval: Duration,
}

impl ConversionWorker {
    pub fn new(executor: Arc<ConversionExecutor>, poll_interval: Duration) -> Self {
        Self {
            executor,
            poll_interval,
        }
    }

    pub async fn run_once(&self) -> Result<WorkerTick> {
        let mut tick = WorkerTick {
            recovered: self.executor.recover_stale_executions().await?.len(),
            ..WorkerTick::default()
        };

        for entry in self.executor.list_pending_conversions().await? {
            tick.attempted += 1;
            match self.executor.resume_conversion(entry.id).await {
                Ok(result) if result.success => tick.completed += 1,
                Ok(_) => tick.failed += 1,
                Err(e) if e.is_conflict() => {
                    debug!(conversion_id = %entry.id, error = %e, "Skipping conversion");
                    tick.skipped += 1;
                }
                Err(e) => {
                    error!(conversion_id = %entry.id, error = %e, "Conversion retry errored");
                    tick.failed += 1;
                }
            }
        }

        tick.awaiting_reconciliation = self
            .executor
            .list_conversions_for_reconciliation()
            .await?
            .len();
        if tick.awaiting_reconciliation > 0 {
            warn!(
                count = tick.awaiting_reconciliation,
                "Conversions awaiting manual reconciliation"
            );
        }
        Ok(tick)
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX);
        info!(interval_ms, "Conversion worker started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(tick) if tick.attempted > 0 || tick.recovered > 0 => {
                            info!(?tick, "Conversion worker pass finished");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Conversion worker pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Conversion worker stopped");
    }
}
