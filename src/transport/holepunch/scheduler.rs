use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::TransportError;

/// A session step that can be re-run after a delay
#[async_trait]
pub trait ScheduledPunch: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Send the punch packets, returning how many went out
    async fn try_connect(&self) -> Result<usize, TransportError>;
}

/// Runs scheduled punch attempts
pub trait PunchScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, punch: Arc<dyn ScheduledPunch>);
}

/// Scheduler backed by tokio timers; must be used inside a runtime
#[derive(Debug, Clone, Default)]
pub struct TokioPunchScheduler {
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl TokioPunchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts scheduled but not yet run
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Drop every attempt that has not fired yet
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl PunchScheduler for TokioPunchScheduler {
    fn schedule(&self, delay: Duration, punch: Arc<dyn ScheduledPunch>) {
        let shutdown = self.shutdown.clone();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::AcqRel);
        debug!("scheduling punch retry for session {} in {:?}", punch.session_id(), delay);

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("scheduler shut down, dropping retry for session {}", punch.session_id());
                }
                _ = sleep(delay) => {
                    match punch.try_connect().await {
                        Ok(sent) => info!("session {} retry sent {} punches", punch.session_id(), sent),
                        Err(e) => warn!("session {} retry failed: {}", punch.session_id(), e),
                    }
                }
            }
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingPunch {
        id: Uuid,
        fired: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledPunch for CountingPunch {
        fn session_id(&self) -> Uuid {
            self.id
        }

        async fn try_connect(&self) -> Result<usize, TransportError> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn punch() -> Arc<CountingPunch> {
        Arc::new(CountingPunch { id: Uuid::new_v4(), fired: AtomicUsize::new(0) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = TokioPunchScheduler::new();
        let punch = punch();

        scheduler.schedule(Duration::from_secs(10), punch.clone());
        assert_eq!(scheduler.pending(), 1);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(punch.fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(punch.fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending() {
        let scheduler = TokioPunchScheduler::new();
        let punch = punch();

        scheduler.schedule(Duration::from_secs(10), punch.clone());
        scheduler.shutdown();

        sleep(Duration::from_secs(20)).await;
        assert_eq!(punch.fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }
}
