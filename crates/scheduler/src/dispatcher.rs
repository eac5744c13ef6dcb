//! Timer-driven dispatcher evaluating rule schedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::scheduler::{JobScheduler, TickOutcome};

pub struct Dispatcher {
    scheduler: Arc<JobScheduler>,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<JobScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Run the tick loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "Dispatcher started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcomes = self.scheduler.tick(Utc::now()).await;
                let enqueued = outcomes
                    .iter()
                    .filter(|o| matches!(o, TickOutcome::Enqueued { .. }))
                    .count();
                metrics::counter!("scheduler.ticks").increment(1);
                if !outcomes.is_empty() {
                    debug!(enqueued, skipped = outcomes.len() - enqueued, "Dispatcher tick");
                }
            }
        })
    }
}
