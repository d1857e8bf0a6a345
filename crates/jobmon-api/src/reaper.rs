// Reaper: periodic heartbeat policing.
//
// Runs inside the API server process. Multiple servers may run this loop;
// the database lease makes sure only one sweeps per tick.

use jobmon_core::ReaperConfig;
use jobmon_storage::Database;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct Reaper {
    db: Database,
    config: ReaperConfig,
    holder: String,
}

impl Reaper {
    pub fn new(db: Database, config: ReaperConfig) -> Self {
        let holder = format!("jobmon-reaper-{}", std::process::id());
        Self { db, config, holder }
    }

    /// Spawn the sweep loop; it stops when the shutdown channel flips.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval());
            info!(
                poll_interval_minutes = self.config.poll_interval_minutes,
                grace_period_minutes = self.config.grace_period().num_minutes(),
                "Reaper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        // Lease for two tick lengths so a slow sweep does not lose it
        // mid-flight.
        let ttl = (self.config.poll_interval().as_secs() * 2) as i64;
        match self.db.try_acquire_reaper_lease(&self.holder, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Reaper lease held elsewhere, skipping tick");
                return;
            }
            Err(e) => {
                error!(error = %e, "Reaper lease acquisition failed");
                return;
            }
        }

        match self
            .db
            .terminate_stale_workflow_runs(self.config.grace_period())
            .await
        {
            Ok(reaped) if !reaped.is_empty() => {
                info!(runs = reaped.len(), "Reaped stale workflow runs");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Workflow run sweep failed"),
        }

        match self.db.expire_lapsed_task_instances().await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "Expired lapsed task instances"),
            Err(e) => error!(error = %e, "Task instance sweep failed"),
        }
    }
}
