//! Session relay core
//!
//! Owns the mapping from a session id to its persistent process, scrollback
//! window, derived status and connected observers.
//!
//! Layering, leaves first: scrollback → bridge → status → registry → hub.
//! Per-session mutable state lives behind one lock per session
//! (`SessionEntry`); the registry's map lock is only ever held for lookups.

mod bridge;
mod hub;
mod record;
mod registry;
mod scrollback;
mod session;
mod status;
mod sweep;

pub use bridge::{BridgeSettings, ProcessBridge};
pub use hub::BroadcastHub;
pub use record::SessionRecord;
pub use registry::{
    CreateRequest, RegistrySettings, SessionRegistry, MAX_INITIAL_INPUT_BYTES, MAX_LABEL_LENGTH,
};
pub use scrollback::ScrollbackBuffer;
pub use session::{ObserverId, SessionEntry, SpawnPhase};
pub use status::{heuristic_status, SessionStatus, StatusTracker};
pub use sweep::StatusSweeper;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Failures visible to relay callers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Wall-clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for relay tests

    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::backend::FakeBackend;
    use crate::catalog::{CatalogEntry, CatalogResult, FileCatalog, MetaPatch, SessionCatalog};
    use crate::config::BackendSettings;
    use crate::pty::TerminalSize;

    pub struct Harness {
        pub backend: FakeBackend,
        pub catalog: Arc<SpyCatalog>,
        pub registry: Arc<SessionRegistry>,
        pub hub: BroadcastHub,
        pub dir: tempfile::TempDir,
    }

    /// File catalog that counts batch touches and can hold removals open
    pub struct SpyCatalog {
        inner: FileCatalog,
        touch_calls: AtomicUsize,
        hold_removals: AtomicBool,
        removal_started: Notify,
        release: Semaphore,
    }

    impl SpyCatalog {
        pub fn new(path: &Path) -> Self {
            Self {
                inner: FileCatalog::new(path),
                touch_calls: AtomicUsize::new(0),
                hold_removals: AtomicBool::new(false),
                removal_started: Notify::new(),
                release: Semaphore::new(0),
            }
        }

        pub fn touch_calls(&self) -> usize {
            self.touch_calls.load(Ordering::SeqCst)
        }

        /// Park every `remove_session` until `release_removal`
        pub fn hold_removals(&self) {
            self.hold_removals.store(true, Ordering::SeqCst);
        }

        pub fn release_removal(&self) {
            self.release.add_permits(1);
        }

        /// Resolves once a held removal is parked
        pub async fn removal_started(&self) {
            self.removal_started.notified().await;
        }
    }

    #[async_trait]
    impl SessionCatalog for SpyCatalog {
        async fn list_catalog_sessions(
            &self,
            include_archived: bool,
        ) -> CatalogResult<Vec<CatalogEntry>> {
            self.inner.list_catalog_sessions(include_archived).await
        }

        async fn patch_session_meta(
            &self,
            id: &str,
            patch: &MetaPatch,
        ) -> CatalogResult<CatalogEntry> {
            self.inner.patch_session_meta(id, patch).await
        }

        async fn upsert_session(&self, entry: CatalogEntry) -> CatalogResult<()> {
            self.inner.upsert_session(entry).await
        }

        async fn touch_sessions(&self, updates: &[(String, u64)]) -> CatalogResult<usize> {
            self.touch_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.touch_sessions(updates).await
        }

        async fn remove_session(&self, id: &str) -> CatalogResult<bool> {
            if self.hold_removals.load(Ordering::SeqCst) {
                self.removal_started.notify_one();
                if let Ok(permit) = self.release.acquire().await {
                    permit.forget();
                }
            }
            self.inner.remove_session(id).await
        }
    }

    pub fn bridge_settings() -> BridgeSettings {
        BridgeSettings {
            spawn_settle: Duration::from_millis(5),
            initial_input_delay: Duration::from_millis(20),
            backend: BackendSettings {
                program: "agent".to_string(),
                resume_args: vec!["--resume".to_string()],
                ..BackendSettings::default()
            },
        }
    }

    pub fn registry_settings() -> RegistrySettings {
        RegistrySettings {
            scrollback_bytes: 64,
            preview_max_chars: 40,
            list_cache_ttl: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(30),
            default_size: TerminalSize::default(),
        }
    }

    pub fn harness() -> Harness {
        harness_with(registry_settings())
    }

    pub fn harness_with(settings: RegistrySettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let catalog = Arc::new(SpyCatalog::new(&dir.path().join("catalog.json")));
        let bridge = Arc::new(ProcessBridge::new(
            Arc::new(backend.clone()),
            bridge_settings(),
        ));
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&catalog) as Arc<dyn SessionCatalog>,
            bridge,
            settings,
        ));
        let hub = BroadcastHub::new(Arc::clone(&registry), 16);
        Harness {
            backend,
            catalog,
            registry,
            hub,
            dir,
        }
    }

    pub fn request(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            group: None,
            working_dir: Some(std::env::temp_dir()),
            initial_input: None,
        }
    }

    /// Poll until `check` holds or a second passes
    pub async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Create a session and wait until its process is live
    pub async fn create_live(h: &Harness, name: &str) -> Arc<SessionEntry> {
        let record = h.registry.create(request(name)).await.unwrap();
        let entry = h.registry.entry(&record.id).await.unwrap();
        let watched = Arc::clone(&entry);
        assert!(eventually(|| {
            let watched = Arc::clone(&watched);
            async move { watched.phase().await == SpawnPhase::Live }
        })
        .await);
        entry
    }
}
