//! Broadcast hub
//!
//! Observer-facing side of the relay: attach with replay, detach, fan-out
//! and input ingestion. Observers never talk to the process directly; every
//! write and resize goes through the bridge.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::session::{ObserverId, SessionEntry};
use super::{now_millis, RelayError, RelayResult};
use crate::pty::TerminalSize;

pub struct BroadcastHub {
    registry: Arc<SessionRegistry>,
    queue_frames: usize,
}

impl BroadcastHub {
    pub fn new(registry: Arc<SessionRegistry>, queue_frames: usize) -> Self {
        Self {
            registry,
            queue_frames,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// A bounded queue for one observer
    pub fn observer_channel(&self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        mpsc::channel(self.queue_frames.max(1))
    }

    /// Register an observer, replay history to it, and make sure a process
    /// is running.
    ///
    /// A backend failure leaves the observer attached without data; only
    /// `NotFound` is returned as an error.
    pub async fn attach(&self, id: &str, tx: mpsc::Sender<Vec<u8>>) -> RelayResult<ObserverId> {
        let entry = self.registry.resolve(id).await?;
        let observer = entry
            .add_observer(tx)
            .await
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        info!("Observer {} attached to session {}", observer, id);

        match self.registry.bridge().ensure_live(&entry).await {
            Ok(()) => {}
            Err(RelayError::NotFound(_)) => {
                return Err(RelayError::NotFound(id.to_string()));
            }
            Err(e) => {
                warn!(
                    "Session {} has no process ({}); observer {} left waiting",
                    id, e, observer
                );
            }
        }
        Ok(observer)
    }

    /// Remove an observer; repeated or unknown detaches are no-ops
    pub async fn detach(&self, id: &str, observer: ObserverId) -> bool {
        let Some(entry) = self.registry.entry(id).await else {
            return false;
        };
        let removed = entry.remove_observer(observer).await;
        if removed {
            info!("Observer {} detached from session {}", observer, id);
        }
        removed
    }

    /// Deliver bytes to every attached observer, recording them in history
    pub async fn publish(&self, id: &str, data: &[u8]) -> RelayResult<()> {
        self.live_entry(id).await?.publish(data).await;
        Ok(())
    }

    /// Route observer input to the process; returns whether it was written
    pub async fn submit_input(&self, id: &str, data: &[u8]) -> RelayResult<bool> {
        let entry = self.live_entry(id).await?;
        {
            let mut state = entry.state.lock().await;
            let now = now_millis();
            state.last_activity = now;
            state.last_input_at = Some(now);
            state.status.record_input();
        }
        debug!("Input of {} bytes for session {}", data.len(), id);
        Ok(self.registry.bridge().write(&entry, data).await)
    }

    pub async fn resize(&self, id: &str, size: TerminalSize) -> RelayResult<()> {
        let entry = self.live_entry(id).await?;
        self.registry.bridge().resize(&entry, size).await;
        Ok(())
    }

    /// Current scrollback window of a session
    pub async fn snapshot(&self, id: &str) -> RelayResult<Vec<u8>> {
        Ok(self.live_entry(id).await?.snapshot().await)
    }

    async fn live_entry(&self, id: &str) -> RelayResult<Arc<SessionEntry>> {
        self.registry
            .entry(id)
            .await
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, FileCatalog, SessionCatalog};
    use crate::relay::session::SpawnPhase;
    use crate::relay::status::SessionStatus;
    use crate::relay::testing::{create_live, eventually, harness};
    use std::time::Duration;

    async fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            out.extend(frame);
        }
        out
    }

    async fn wait_for_snapshot(entry: &Arc<SessionEntry>, expected: &[u8]) {
        let watched = Arc::clone(entry);
        let expected = expected.to_vec();
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            let expected = expected.clone();
            async move { watched.snapshot().await == expected }
        })
        .await);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let h = harness();
        let (tx, _rx) = h.hub.observer_channel();
        assert_eq!(
            h.hub.attach("missing", tx).await,
            Err(RelayError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_two_observers_one_write() {
        let h = harness();
        let entry = create_live(&h, "shared").await;
        let id = entry.id().to_string();
        let process = h.backend.process(&id).unwrap();

        let (tx_a, mut rx_a) = h.hub.observer_channel();
        let (tx_b, mut rx_b) = h.hub.observer_channel();
        h.hub.attach(&id, tx_a).await.unwrap();
        h.hub.attach(&id, tx_b).await.unwrap();

        assert!(h.hub.submit_input(&id, b"ls\n").await.unwrap());
        assert_eq!(process.written(), b"ls\n");

        process.emit(b"file-a\r\n").await;
        process.emit(b"file-b\r\n").await;

        let a = drain(&mut rx_a).await;
        let b = drain(&mut rx_b).await;
        assert_eq!(a, b"file-a\r\nfile-b\r\n");
        assert_eq!(a, b);
        assert_eq!(h.backend.attach_count(&id), 1);
    }

    #[tokio::test]
    async fn test_late_observer_gets_replay_then_live() {
        let h = harness();
        let entry = create_live(&h, "replay").await;
        let id = entry.id().to_string();
        let process = h.backend.process(&id).unwrap();

        let (tx_a, mut rx_a) = h.hub.observer_channel();
        h.hub.attach(&id, tx_a).await.unwrap();

        process.emit(b"one ").await;
        process.emit(b"two ").await;
        wait_for_snapshot(&entry, b"one two ").await;

        let (tx_b, mut rx_b) = h.hub.observer_channel();
        h.hub.attach(&id, tx_b).await.unwrap();
        process.emit(b"three").await;

        let first = rx_b.recv().await.unwrap();
        assert_eq!(first, b"one two ");
        let rest = drain(&mut rx_b).await;
        assert_eq!(rest, b"three");

        // Replay plus live reconstructs the permanent observer's view
        let full = drain(&mut rx_a).await;
        assert_eq!([first, rest].concat(), full);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_and_keeps_process() {
        let h = harness();
        let entry = create_live(&h, "solo").await;
        let id = entry.id().to_string();

        let (tx, _rx) = h.hub.observer_channel();
        let observer = h.hub.attach(&id, tx).await.unwrap();
        assert!(h.hub.detach(&id, observer).await);
        assert!(!h.hub.detach(&id, observer).await);
        assert!(!h.hub.detach("missing", observer).await);

        // Output keeps accumulating with nobody watching
        h.backend.process(&id).unwrap().emit(b"still here").await;
        wait_for_snapshot(&entry, b"still here").await;
        assert_eq!(entry.phase().await, SpawnPhase::Live);
    }

    #[tokio::test]
    async fn test_exit_notice_then_fresh_attach() {
        let h = harness();
        let entry = create_live(&h, "crashy").await;
        let id = entry.id().to_string();
        let process = h.backend.process(&id).unwrap();

        let (tx, mut rx) = h.hub.observer_channel();
        h.hub.attach(&id, tx).await.unwrap();
        process.exit(1).await;

        let seen = drain(&mut rx).await;
        assert_eq!(seen, b"\r\n[process exited with code 1]\r\n");
        assert_eq!(entry.status().await, Some(SessionStatus::Error));
        assert_eq!(entry.phase().await, SpawnPhase::Detached);
        assert!(process.is_killed());

        // Input is dropped while there is no process
        assert!(!h.hub.submit_input(&id, b"x").await.unwrap());

        let (tx2, _rx2) = h.hub.observer_channel();
        h.hub.attach(&id, tx2).await.unwrap();
        assert_eq!(entry.phase().await, SpawnPhase::Live);
        assert_eq!(h.backend.attach_count(&id), 2);
        assert_eq!(entry.status().await, Some(SessionStatus::Running));
        assert!(!h.backend.process(&id).unwrap().is_killed());
    }

    #[tokio::test]
    async fn test_failed_reattach_keeps_observer_and_retries() {
        let h = harness();
        let entry = create_live(&h, "flaky").await;
        let id = entry.id().to_string();
        h.backend.process(&id).unwrap().exit(1).await;
        let watched = Arc::clone(&entry);
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            async move { watched.phase().await == SpawnPhase::Detached }
        })
        .await);

        h.backend.fail_attach(true);
        let (tx, mut rx) = h.hub.observer_channel();
        h.hub.attach(&id, tx).await.unwrap();
        assert_eq!(entry.observer_count().await, 1);
        assert_eq!(entry.phase().await, SpawnPhase::Detached);
        assert_eq!(entry.status().await, None);
        assert_eq!(h.backend.attach_count(&id), 1);
        assert_eq!(h.backend.create_count(&id), 1);

        // The next attach starts over and feeds the waiting observer too
        h.backend.fail_attach(false);
        let (tx2, _rx2) = h.hub.observer_channel();
        h.hub.attach(&id, tx2).await.unwrap();
        assert_eq!(entry.phase().await, SpawnPhase::Live);
        assert_eq!(entry.status().await, Some(SessionStatus::Running));
        assert_eq!(h.backend.attach_count(&id), 2);

        drain(&mut rx).await;
        h.backend.process(&id).unwrap().emit(b"back online").await;
        assert_eq!(drain(&mut rx).await, b"back online");
    }

    #[tokio::test]
    async fn test_concurrent_first_observers_share_one_handle() {
        let h = harness();
        let catalog = FileCatalog::new(h.dir.path().join("catalog.json"));
        catalog
            .upsert_session(CatalogEntry {
                id: "restored".to_string(),
                name: "restored".to_string(),
                group: None,
                working_dir: std::env::temp_dir(),
                created_at: 1,
                modified_at: 1,
                message_count: 0,
                pinned: false,
                archived: false,
                custom_name: None,
            })
            .await
            .unwrap();
        h.backend.set_exists("restored");

        let hub = Arc::new(h.hub);
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = hub.observer_channel();
                let observer = hub.attach("restored", tx).await.unwrap();
                (observer, rx)
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let entry = hub.registry().entry("restored").await.unwrap();
        let watched = Arc::clone(&entry);
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            async move { watched.phase().await == SpawnPhase::Live }
        })
        .await);
        assert_eq!(h.backend.attach_count("restored"), 1);
        assert_eq!(h.backend.create_count("restored"), 0);
    }

    #[tokio::test]
    async fn test_backend_unavailable_leaves_observer_waiting() {
        let h = harness();
        h.backend.fail_create(true);
        let record = h.registry.create(crate::relay::testing::request("down")).await.unwrap();
        let entry = h.registry.entry(&record.id).await.unwrap();
        let watched = Arc::clone(&entry);
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            async move { watched.status().await.is_none() }
        })
        .await);

        let (tx, mut rx) = h.hub.observer_channel();
        h.hub.attach(&record.id, tx).await.unwrap();
        assert_eq!(entry.observer_count().await, 1);
        assert!(drain(&mut rx).await.is_empty());

        // The next attach retries from scratch
        h.backend.fail_create(false);
        let (tx2, _rx2) = h.hub.observer_channel();
        h.hub.attach(&record.id, tx2).await.unwrap();
        assert_eq!(entry.phase().await, SpawnPhase::Live);
    }

    #[tokio::test]
    async fn test_resize_and_publish() {
        let h = harness();
        let entry = create_live(&h, "sized").await;
        let id = entry.id().to_string();

        h.hub.resize(&id, TerminalSize::new(132, 43)).await.unwrap();
        let process = h.backend.process(&id).unwrap();
        assert_eq!(process.resizes(), vec![TerminalSize::new(132, 43)]);

        h.hub.publish(&id, b"notice").await.unwrap();
        assert_eq!(h.hub.snapshot(&id).await.unwrap(), b"notice");
        assert!(matches!(
            h.hub.publish("missing", b"x").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_initial_input_forwarded_after_delay() {
        let h = harness();
        let mut req = crate::relay::testing::request("primed");
        req.initial_input = Some("hello agent\n".to_string());
        let record = h.registry.create(req).await.unwrap();

        let backend = h.backend.clone();
        let id = record.id.clone();
        assert!(eventually(|| {
            let backend = backend.clone();
            let id = id.clone();
            async move {
                backend
                    .process(&id)
                    .is_some_and(|p| p.written() == b"hello agent\n")
            }
        })
        .await);
    }
}
