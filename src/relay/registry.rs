//! Session registry
//!
//! Single source of truth for which sessions exist and which are live.
//! The map lock only guards membership; everything else about a session is
//! behind that session's own lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::ProcessBridge;
use super::record::SessionRecord;
use super::session::{SessionEntry, SpawnPhase};
use super::status::{heuristic_status, StatusTracker};
use super::{now_millis, RelayError, RelayResult};
use crate::catalog::{CatalogEntry, CatalogError, MetaPatch, SessionCatalog};
use crate::config::RelayConfig;
use crate::git;
use crate::pty::TerminalSize;

/// Maximum length of a session name or group label
pub const MAX_LABEL_LENGTH: usize = 256;

/// Maximum size of a queued initial input
pub const MAX_INITIAL_INPUT_BYTES: usize = 64 * 1024;

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub scrollback_bytes: usize,
    pub preview_max_chars: usize,
    pub list_cache_ttl: Duration,
    pub idle_threshold: Duration,
    pub default_size: TerminalSize,
}

impl RegistrySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            scrollback_bytes: config.scrollback_bytes,
            preview_max_chars: config.preview_max_chars,
            list_cache_ttl: config.list_cache_ttl(),
            idle_threshold: config.idle_threshold(),
            default_size: TerminalSize::new(
                config.backend.default_cols,
                config.backend.default_rows,
            ),
        }
    }
}

/// Parameters for a new session
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub group: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Written to the process shortly after it goes live
    pub initial_input: Option<String>,
}

struct CachedList {
    at: Instant,
    include_archived: bool,
    records: Vec<SessionRecord>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// Serializes catalog adoption against deletion; never held with `sessions`
    membership: Mutex<()>,
    catalog: Arc<dyn SessionCatalog>,
    bridge: Arc<ProcessBridge>,
    settings: RegistrySettings,
    list_cache: StdMutex<Option<CachedList>>,
}

impl SessionRegistry {
    pub fn new(
        catalog: Arc<dyn SessionCatalog>,
        bridge: Arc<ProcessBridge>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            membership: Mutex::new(()),
            catalog,
            bridge,
            settings,
            list_cache: StdMutex::new(None),
        }
    }

    pub fn bridge(&self) -> &Arc<ProcessBridge> {
        &self.bridge
    }

    /// Number of sessions in the live table
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Register a new session and start its process in the background
    pub async fn create(&self, request: CreateRequest) -> RelayResult<SessionRecord> {
        let (name, working_dir) = validate_create(&request)?;
        let group = match request.group.map(|g| g.trim().to_string()) {
            Some(g) if !g.is_empty() => Some(g),
            _ => git::repository_label(&working_dir),
        };

        let now = now_millis();
        let meta = CatalogEntry {
            id: Uuid::new_v4().to_string(),
            name,
            group,
            working_dir,
            created_at: now,
            modified_at: now,
            message_count: 0,
            pinned: false,
            archived: false,
            custom_name: None,
        };
        let id = meta.id.clone();

        if let Err(e) = self.catalog.upsert_session(meta.clone()).await {
            warn!("Failed to record session {} in catalog: {}", id, e);
        }
        let entry = Arc::new(self.new_entry(meta, StatusTracker::running(Instant::now())));
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&entry));
        self.invalidate_cache();

        let record = entry.record().await;
        info!("Created session {} ({})", id, record.name);
        self.bridge.spawn_in_background(entry, request.initial_input);
        Ok(record)
    }

    /// Live record, or the catalog record with a heuristic status
    pub async fn get(&self, id: &str) -> RelayResult<SessionRecord> {
        if let Some(entry) = self.entry(id).await {
            return Ok(entry.record().await);
        }
        let meta = self
            .catalog_entry(id)
            .await
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        Ok(catalog_record(&meta, now_millis()))
    }

    /// Live table merged with the catalog; pinned first, then most recent
    pub async fn list(&self, include_archived: bool) -> Vec<SessionRecord> {
        if let Some(records) = self.cached_list(include_archived) {
            return records;
        }

        let catalog = match self.catalog.list_catalog_sessions(true).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read session catalog: {}", e);
                Vec::new()
            }
        };
        let live: Vec<Arc<SessionEntry>> =
            self.sessions.read().await.values().cloned().collect();

        let now = now_millis();
        let mut merged: HashMap<String, SessionRecord> = catalog
            .iter()
            .map(|meta| (meta.id.clone(), catalog_record(meta, now)))
            .collect();
        for entry in live {
            let record = entry.record().await;
            let record = match catalog.iter().find(|m| m.id == record.id) {
                Some(meta) => merge_display_fields(meta, record),
                None => record,
            };
            merged.insert(record.id.clone(), record);
        }

        let mut records: Vec<SessionRecord> = merged
            .into_values()
            .filter(|r| include_archived || !r.archived)
            .collect();
        sort_records(&mut records);

        if let Ok(mut cache) = self.list_cache.lock() {
            *cache = Some(CachedList {
                at: Instant::now(),
                include_archived,
                records: records.clone(),
            });
        }
        records
    }

    /// Tear down the process, close observers, drop history, forget the record
    pub async fn delete(&self, id: &str) -> RelayResult<()> {
        let (entry, in_catalog) = {
            let _membership = self.membership.lock().await;
            let entry = self.sessions.write().await.remove(id);
            let in_catalog = match self.catalog.remove_session(id).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!("Failed to remove session {} from catalog: {}", id, e);
                    false
                }
            };
            (entry, in_catalog)
        };
        self.invalidate_cache();

        if entry.is_none() && !in_catalog {
            return Err(RelayError::NotFound(id.to_string()));
        }

        let handle = match &entry {
            Some(entry) => entry.shut_down().await,
            None => None,
        };
        self.bridge.teardown(id, handle).await;
        info!("Deleted session {}", id);
        Ok(())
    }

    /// Update display metadata in both the live table and the catalog
    pub async fn patch_meta(&self, id: &str, patch: &MetaPatch) -> RelayResult<SessionRecord> {
        if patch.is_empty() {
            return Err(RelayError::InvalidArgument(
                "patch sets no fields".to_string(),
            ));
        }
        if let Some(name) = &patch.custom_name {
            validate_label("custom name", name)?;
        }
        if let Some(project) = &patch.project {
            validate_label("project", project)?;
        }

        let live = self.entry(id).await;
        let updated = match self.catalog.patch_session_meta(id, patch).await {
            Ok(meta) => Some(meta),
            Err(CatalogError::NotFound(_)) => None,
            Err(e) => {
                warn!("Failed to patch catalog entry {}: {}", id, e);
                None
            }
        };
        self.invalidate_cache();

        match (live, updated) {
            (Some(entry), _) => {
                let meta = {
                    let mut state = entry.state.lock().await;
                    patch.apply(&mut state.meta);
                    state.meta.clone()
                };
                if let Err(e) = self.catalog.upsert_session(meta).await {
                    warn!("Failed to persist metadata for {}: {}", id, e);
                }
                debug!("Patched live session {}", id);
                Ok(entry.record().await)
            }
            (None, Some(meta)) => Ok(catalog_record(&meta, now_millis())),
            (None, None) => Err(RelayError::NotFound(id.to_string())),
        }
    }

    /// Session from the live table only
    pub async fn entry(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Session from the live table, adopting it from the catalog if needed
    pub async fn resolve(&self, id: &str) -> RelayResult<Arc<SessionEntry>> {
        if let Some(entry) = self.entry(id).await {
            return Ok(entry);
        }

        // A delete in progress finishes before the catalog is consulted
        let _membership = self.membership.lock().await;
        if let Some(entry) = self.entry(id).await {
            return Ok(entry);
        }
        let meta = self
            .catalog_entry(id)
            .await
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        let entry = Arc::new(self.new_entry(meta, StatusTracker::unset(Instant::now())));
        self.sessions
            .write()
            .await
            .insert(id.to_string(), Arc::clone(&entry));

        self.invalidate_cache();
        info!("Adopted session {} from catalog", id);
        Ok(entry)
    }

    /// Apply idle and lost-process transitions; returns how many changed
    pub async fn sweep_statuses(&self, now: Instant) -> usize {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.read().await.values().cloned().collect();

        let mut changed = 0;
        for entry in entries {
            let mut state = entry.state.lock().await;
            let phase = state.slot.phase();
            let live = phase == SpawnPhase::Live;
            let spawning = matches!(phase, SpawnPhase::Creating | SpawnPhase::Attaching);
            if let Some(status) =
                state
                    .status
                    .sweep(now, live, spawning, self.settings.idle_threshold)
            {
                debug!("Session {} is now {:?}", entry.id(), status);
                changed += 1;
            }
        }
        if changed > 0 {
            self.invalidate_cache();
        }
        changed
    }

    /// Write advanced activity timestamps back to the catalog
    pub async fn persist_activity(&self) {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.read().await.values().cloned().collect();

        let mut pending = Vec::new();
        for entry in entries {
            let mut state = entry.state.lock().await;
            if state.last_activity > state.persisted_activity {
                state.persisted_activity = state.last_activity;
                pending.push((entry.id().to_string(), state.last_activity));
            }
        }
        if pending.is_empty() {
            return;
        }

        match self.catalog.touch_sessions(&pending).await {
            Ok(advanced) => debug!("Persisted activity for {} sessions", advanced),
            Err(e) => warn!("Failed to persist activity for {} sessions: {}", pending.len(), e),
        }
    }

    fn new_entry(&self, meta: CatalogEntry, status: StatusTracker) -> SessionEntry {
        SessionEntry::new(
            meta,
            status,
            self.settings.scrollback_bytes,
            self.settings.preview_max_chars,
            self.settings.default_size,
        )
    }

    async fn catalog_entry(&self, id: &str) -> Option<CatalogEntry> {
        match self.catalog.list_catalog_sessions(true).await {
            Ok(entries) => entries.into_iter().find(|e| e.id == id),
            Err(e) => {
                warn!("Failed to read session catalog: {}", e);
                None
            }
        }
    }

    fn cached_list(&self, include_archived: bool) -> Option<Vec<SessionRecord>> {
        let cache = self.list_cache.lock().ok()?;
        let cached = cache.as_ref()?;
        if cached.include_archived == include_archived
            && cached.at.elapsed() < self.settings.list_cache_ttl
        {
            Some(cached.records.clone())
        } else {
            None
        }
    }

    fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.list_cache.lock() {
            *cache = None;
        }
    }
}

fn validate_label(field: &str, value: &str) -> RelayResult<()> {
    if value.len() > MAX_LABEL_LENGTH {
        return Err(RelayError::InvalidArgument(format!(
            "{} exceeds {} bytes",
            field, MAX_LABEL_LENGTH
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(RelayError::InvalidArgument(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

fn validate_create(request: &CreateRequest) -> RelayResult<(String, PathBuf)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(RelayError::InvalidArgument("name is required".to_string()));
    }
    validate_label("name", name)?;
    if let Some(group) = &request.group {
        validate_label("group", group)?;
    }
    if let Some(input) = &request.initial_input {
        if input.len() > MAX_INITIAL_INPUT_BYTES {
            return Err(RelayError::InvalidArgument(format!(
                "initial input exceeds {} bytes",
                MAX_INITIAL_INPUT_BYTES
            )));
        }
    }

    let working_dir = match &request.working_dir {
        Some(dir) if dir.is_relative() => {
            return Err(RelayError::InvalidArgument(format!(
                "working directory must be absolute: {}",
                dir.display()
            )));
        }
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| {
            RelayError::InvalidArgument(format!("no working directory: {}", e))
        })?,
    };
    if !Path::new(&working_dir).is_dir() {
        return Err(RelayError::InvalidArgument(format!(
            "working directory does not exist: {}",
            working_dir.display()
        )));
    }
    Ok((name.to_string(), working_dir))
}

fn catalog_record(meta: &CatalogEntry, now: u64) -> SessionRecord {
    let age = Duration::from_millis(now.saturating_sub(meta.modified_at));
    SessionRecord::from_catalog(meta, Some(heuristic_status(age)))
}

/// Display fields come from the catalog, live fields from the relay
fn merge_display_fields(meta: &CatalogEntry, live: SessionRecord) -> SessionRecord {
    SessionRecord {
        name: meta.display_name().to_string(),
        group: meta.group.clone(),
        pinned: meta.pinned,
        archived: meta.archived,
        message_count: meta.message_count,
        ..live
    }
}

fn sort_records(records: &mut [SessionRecord]) {
    records.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then(b.last_activity.cmp(&a.last_activity))
    });
}
