use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::PurgeReport;
use crate::store::Store;

/// Periodically purges every user whose deletion time has passed.
///
/// The first pass runs immediately on start. A pass always completes before
/// the next one begins, and a stop request is only observed between passes.
pub struct PurgeWorker {
    store: Arc<Store>,
    interval: Duration,
}

impl PurgeWorker {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn start(self) -> PurgeWorkerHandle {
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.run(token.clone()));
        PurgeWorkerHandle { token, handle }
    }

    async fn run(self, token: CancellationToken) {
        log::info!("Purge worker started, polling every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        log::info!("Purge worker stopped");
    }

    /// One pass over all due users, on the blocking pool.
    pub async fn tick(&self) -> PurgeReport {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.purge_due_users(Utc::now())).await {
            Ok(Ok(report)) => {
                if !report.purged.is_empty() || !report.failed.is_empty() {
                    log::info!(
                        "Purge pass finished: {} purged, {} failed",
                        report.purged.len(),
                        report.failed.len()
                    );
                }
                report
            }
            Ok(Err(e)) => {
                log::error!("Failed to load users due for purge: {}", e);
                PurgeReport::default()
            }
            Err(e) => {
                log::error!("Purge pass aborted: {}", e);
                PurgeReport::default()
            }
        }
    }
}

/// Handle to a running `PurgeWorker`.
pub struct PurgeWorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PurgeWorkerHandle {
    /// Ask the worker to stop and wait until the current pass, if any, has finished.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            log::error!("Purge worker task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
