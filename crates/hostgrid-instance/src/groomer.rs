//! Periodic reconciliation.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::orchestrator::InstanceOrchestrator;

pub struct Groomer {
    orchestrator: InstanceOrchestrator,
    interval: Duration,
}

impl Groomer {
    pub fn new(orchestrator: InstanceOrchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run a groom pass every interval until `shutdown` flips to true.
    ///
    /// The first pass happens one interval after start; recovery has just
    /// reconciled everything by then.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs_f64(), "groomer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.orchestrator.groom().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("groomer shutting down");
                        break;
                    }
                }
            }
        }
    }
}
