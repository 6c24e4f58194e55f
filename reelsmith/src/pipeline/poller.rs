//! Claims ready stages and hands them to the executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::StageExecutor;
use crate::domain::StageKind;
use crate::store::JobStore;

/// Configuration for the stage poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Upper bound between two claim attempts, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum stages executing at once.
    pub max_concurrent: usize,
    /// Per stage kind cap on running stages, within `max_concurrent`.
    /// Kinds not listed are only bounded by `max_concurrent`.
    pub kind_limits: HashMap<StageKind, usize>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_concurrent: 2,
            // One render at a time.
            kind_limits: HashMap::from([(StageKind::Video, 1)]),
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Dispatch loop over the pipeline table.
///
/// Wakes on [`Notify`], on the poll interval, or when the earliest scheduled
/// stage becomes ready, whichever comes first. Each claimed stage runs in its
/// own task holding a semaphore permit.
pub struct StagePoller {
    store: Arc<JobStore>,
    executor: Arc<StageExecutor>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
    config: PollerConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl StagePoller {
    pub fn new(
        store: Arc<JobStore>,
        executor: Arc<StageExecutor>,
        notify: Arc<Notify>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            notify,
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the dispatch loop.
    pub fn start(&self) {
        let store = self.store.clone();
        let executor = self.executor.clone();
        let semaphore = self.semaphore.clone();
        let notify = self.notify.clone();
        let cancellation_token = self.cancellation_token.clone();
        let poll_interval = self.config.poll_interval();
        let kind_limits = self.config.kind_limits.clone();

        info!(
            max_concurrent = self.config.max_concurrent,
            kind_limits = ?self.config.kind_limits,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting stage poller"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Stage poller already stopped");
            return;
        };

        join_set.spawn(async move {
            let mut running: JoinSet<()> = JoinSet::new();

            loop {
                while let Some(result) = running.try_join_next() {
                    if let Err(e) = result {
                        error!(error = %e, "Stage task panicked");
                    }
                }

                let available = semaphore.available_permits();
                if available > 0 {
                    match store
                        .pipelines()
                        .claim_ready_within(available as i64, &kind_limits)
                        .await
                    {
                        Ok(stages) => {
                            for stage in stages {
                                // Permits only shrink inside this loop, so this cannot fail.
                                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                    warn!(job_id = %stage.job_id, "No permit for claimed stage");
                                    break;
                                };
                                debug!(job_id = %stage.job_id, stage = %stage.kind, "Dispatching stage");
                                let executor = executor.clone();
                                running.spawn(async move {
                                    let _permit = permit;
                                    executor.execute(stage).await;
                                });
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to claim ready stages"),
                    }
                }

                let wait = match store.pipelines().next_ready_at().await {
                    Ok(Some(at)) => (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_millis(10))
                        .min(poll_interval),
                    _ => poll_interval,
                };

                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    Some(result) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = result {
                            error!(error = %e, "Stage task panicked");
                        }
                    }
                }
            }

            debug!(in_flight = running.len(), "Stage poller draining");
            while let Some(result) = running.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Stage task panicked");
                }
            }
        });
    }

    /// Stop claiming new stages and wait for in-flight ones to finish.
    ///
    /// Call after the supervisor has been told to shut down, so running
    /// workers are interrupted rather than awaited to completion.
    pub async fn stop(&self) {
        info!("Stopping stage poller");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Stage poller stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn active_count(&self) -> usize {
        self.config.max_concurrent.max(1) - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.kind_limits.get(&StageKind::Video), Some(&1));
    }

    #[test]
    fn config_from_toml() {
        let config: PollerConfig = toml::from_str("max_concurrent = 4").unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));

        let config: PollerConfig = toml::from_str(
            r#"
            [kind_limits]
            video = 2
            upload = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.kind_limits.get(&StageKind::Video), Some(&2));
        assert_eq!(config.kind_limits.get(&StageKind::Upload), Some(&1));
        assert_eq!(config.kind_limits.get(&StageKind::Script), None);
    }
}
