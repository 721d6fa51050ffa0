//! Deferred retry of failed instance destroys.
//!
//! When a provider fails to release an instance, the manager hands the
//! instance to the cleanup worker instead of surfacing the error. The worker
//! retries every pending destroy once per interval and gives up after
//! `max_attempts`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::provider::{InstanceProvider, InstanceRef};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    /// Failed attempts after which every further failure logs at error level.
    pub log_after_attempts: u32,
    /// Failed attempts after which the instance is abandoned.
    pub max_attempts: u32,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            log_after_attempts: 10,
            max_attempts: 100,
        }
    }
}

struct PendingDestroy {
    provider: Arc<dyn InstanceProvider>,
    instance: InstanceRef,
    attempts: u32,
}

/// Outcome of a single pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPass {
    pub destroyed: usize,
    pub retrying: usize,
    pub abandoned: usize,
}

pub struct CleanupWorker {
    config: CleanupWorkerConfig,
    pending: Mutex<Vec<PendingDestroy>>,
}

impl CleanupWorker {
    pub fn new(config: CleanupWorkerConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue an instance whose destroy failed once already.
    pub async fn submit(&self, provider: Arc<dyn InstanceProvider>, instance: InstanceRef) {
        debug!(
            instance_id = %instance.handle().instance_id,
            machine_type = %provider.machine_type(),
            "Queued instance for cleanup"
        );
        self.pending.lock().await.push(PendingDestroy {
            provider,
            instance,
            attempts: 1,
        });
    }

    /// Number of instances waiting for a retry.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_attempts = self.config.max_attempts,
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }

        let last = self.run_pass().await;
        if last.retrying > 0 {
            warn!(remaining = last.retrying, "Cleanup worker stopped with pending destroys");
        }
    }

    /// Retry every pending destroy once.
    pub async fn run_pass(&self) -> CleanupPass {
        // Take the queue so submissions during the pass are not blocked.
        let batch = std::mem::take(&mut *self.pending.lock().await);
        let mut pass = CleanupPass::default();
        let mut retry = Vec::new();

        for mut entry in batch {
            let instance_id = entry.instance.handle().instance_id;
            match entry.provider.destroy(&entry.instance).await {
                Ok(()) => {
                    debug!(instance_id = %instance_id, attempts = entry.attempts, "Deferred destroy succeeded");
                    pass.destroyed += 1;
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.max_attempts {
                        error!(
                            instance_id = %instance_id,
                            attempts = entry.attempts,
                            error = %e,
                            "Giving up on instance destroy"
                        );
                        pass.abandoned += 1;
                        continue;
                    }

                    if entry.attempts >= self.config.log_after_attempts {
                        error!(instance_id = %instance_id, attempts = entry.attempts, error = %e, "Deferred destroy failed");
                    } else {
                        warn!(instance_id = %instance_id, attempts = entry.attempts, error = %e, "Deferred destroy failed");
                    }
                    retry.push(entry);
                }
            }
        }

        pass.retrying = retry.len();
        self.pending.lock().await.extend(retry);

        if pass.destroyed > 0 || pass.abandoned > 0 {
            info!(
                destroyed = pass.destroyed,
                retrying = pass.retrying,
                abandoned = pass.abandoned,
                "Cleanup pass complete"
            );
        }
        pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Recipe;
    use crate::provider::mock::MockProvider;
    use crate::provider::BuildCancel;
    use crate::sink::LogSink;

    async fn instance(provider: &MockProvider) -> InstanceRef {
        provider
            .provision(
                &Recipe::new("FROM base", "mock"),
                LogSink::discard(),
                BuildCancel::never(),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = CleanupWorkerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.log_after_attempts, 10);
        assert_eq!(config.max_attempts, 100);
    }

    #[tokio::test]
    async fn test_pass_retries_until_success() {
        let provider = Arc::new(MockProvider::new().with_failing_destroys(1));
        let worker = CleanupWorker::new(CleanupWorkerConfig::default());
        worker.submit(provider.clone(), instance(&provider).await).await;

        let first = worker.run_pass().await;
        assert_eq!(first, CleanupPass { destroyed: 0, retrying: 1, abandoned: 0 });

        let second = worker.run_pass().await;
        assert_eq!(second.destroyed, 1);
        assert_eq!(worker.pending().await, 0);
        assert_eq!(provider.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let provider = Arc::new(MockProvider::new().with_failing_destroys(10));
        let worker = CleanupWorker::new(CleanupWorkerConfig {
            max_attempts: 3,
            log_after_attempts: 2,
            ..Default::default()
        });
        worker.submit(provider.clone(), instance(&provider).await).await;

        assert_eq!(worker.run_pass().await.retrying, 1);
        assert_eq!(worker.run_pass().await.abandoned, 1);
        assert_eq!(worker.pending().await, 0);
        assert_eq!(provider.destroyed_count(), 0);
    }

    #[tokio::test]
    async fn test_run_does_final_pass_on_shutdown() {
        let provider = Arc::new(MockProvider::new());
        let worker = Arc::new(CleanupWorker::new(CleanupWorkerConfig {
            interval: Duration::from_secs(3600),
            ..Default::default()
        }));
        worker.submit(provider.clone(), instance(&provider).await).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(shutdown_rx).await }
        });

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(worker.pending().await, 0);
        assert_eq!(provider.destroyed_count(), 1);
    }
}
