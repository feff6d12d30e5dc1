//! Periodic status sweep

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Runs idle/lost-process transitions and activity persistence on a timer
pub struct StatusSweeper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl StatusSweeper {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run until `shutdown` fires
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let changed = self.registry.sweep_statuses(Instant::now()).await;
                        if changed > 0 {
                            debug!("Status sweep changed {} sessions", changed);
                        }
                        self.registry.persist_activity().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Status sweeper stopping");
                        break;
                    }
                }
            }
            self.registry.persist_activity().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::status::SessionStatus;
    use crate::relay::testing::{create_live, eventually, harness};

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let h = harness();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = StatusSweeper::new(h.registry.clone(), Duration::from_millis(10))
            .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_marks_quiet_session_idle() {
        let h = harness();
        let entry = create_live(&h, "quiet").await;
        let process = h.backend.process(entry.id()).unwrap();

        tokio::time::pause();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = StatusSweeper::new(h.registry.clone(), Duration::from_secs(5))
            .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(entry.status().await, Some(SessionStatus::Running));

        // idle_threshold is 30s in the test settings
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(entry.status().await, Some(SessionStatus::Idle));

        process.emit(b"awake").await;
        let watched = Arc::clone(&entry);
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            async move { watched.status().await == Some(SessionStatus::Running) }
        })
        .await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
