//! JSON file catalog
//!
//! Keeps every record in one pretty-printed `catalog.json`. Writes are
//! serialized by an in-process lock; the file is rewritten whole.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::{CatalogEntry, CatalogError, CatalogResult, MetaPatch, SessionCatalog};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sessions: Vec<CatalogEntry>,
}

/// Catalog stored as a JSON file
pub struct FileCatalog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> CatalogResult<CatalogFile> {
        if !self.path.exists() {
            return Ok(CatalogFile::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, file: &CatalogFile) -> CatalogResult<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let content = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[async_trait]
impl SessionCatalog for FileCatalog {
    async fn list_catalog_sessions(
        &self,
        include_archived: bool,
    ) -> CatalogResult<Vec<CatalogEntry>> {
        let _guard = self.lock.lock().await;
        let file = self.load()?;
        Ok(file
            .sessions
            .into_iter()
            .filter(|s| include_archived || !s.archived)
            .collect())
    }

    async fn patch_session_meta(
        &self,
        id: &str,
        patch: &MetaPatch,
    ) -> CatalogResult<CatalogEntry> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let entry = file
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        patch.apply(entry);
        let updated = entry.clone();
        self.save(&file)?;
        Ok(updated)
    }

    async fn upsert_session(&self, entry: CatalogEntry) -> CatalogResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        if let Some(existing) = file.sessions.iter_mut().find(|s| s.id == entry.id) {
            *existing = entry;
        } else {
            file.sessions.push(entry);
        }
        self.save(&file)
    }

    async fn touch_sessions(&self, updates: &[(String, u64)]) -> CatalogResult<usize> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let mut advanced = 0;
        for (id, modified_at) in updates {
            if let Some(entry) = file.sessions.iter_mut().find(|s| &s.id == id) {
                if *modified_at > entry.modified_at {
                    entry.modified_at = *modified_at;
                    advanced += 1;
                }
            }
        }
        if advanced > 0 {
            self.save(&file)?;
        }
        Ok(advanced)
    }

    async fn remove_session(&self, id: &str) -> CatalogResult<bool> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let before = file.sessions.len();
        file.sessions.retain(|s| s.id != id);
        let removed = file.sessions.len() != before;
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entry(id: &str, archived: bool) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: format!("session {}", id),
            group: None,
            working_dir: PathBuf::from("/tmp"),
            created_at: 10,
            modified_at: 20,
            message_count: 0,
            pinned: false,
            archived,
            custom_name: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));
        assert!(catalog.list_catalog_sessions(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_creates_parent_dir_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("catalog.json");
        let catalog = FileCatalog::new(&path);

        catalog.upsert_session(entry("a", false)).await.unwrap();
        assert!(path.exists());

        // A fresh instance sees the same data
        let reopened = FileCatalog::new(&path);
        let sessions = reopened.list_catalog_sessions(false).await.unwrap();
        assert_eq!(sessions, vec![entry("a", false)]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));

        catalog.upsert_session(entry("a", false)).await.unwrap();
        let mut changed = entry("a", false);
        changed.name = "renamed".to_string();
        catalog.upsert_session(changed).await.unwrap();

        let sessions = catalog.list_catalog_sessions(true).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_archived_filtered_unless_requested() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));
        catalog.upsert_session(entry("live", false)).await.unwrap();
        catalog.upsert_session(entry("old", true)).await.unwrap();

        assert_eq!(catalog.list_catalog_sessions(false).await.unwrap().len(), 1);
        assert_eq!(catalog.list_catalog_sessions(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_patch_and_touch() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));
        catalog.upsert_session(entry("a", false)).await.unwrap();

        let patch = MetaPatch {
            pinned: Some(true),
            custom_name: Some("Pinned one".to_string()),
            ..MetaPatch::default()
        };
        let updated = catalog.patch_session_meta("a", &patch).await.unwrap();
        assert!(updated.pinned);
        assert_eq!(updated.display_name(), "Pinned one");

        let touched = catalog
            .touch_sessions(&[("a".to_string(), 99), ("missing".to_string(), 99)])
            .await
            .unwrap();
        assert_eq!(touched, 1);
        assert_eq!(catalog.touch_sessions(&[("a".to_string(), 50)]).await.unwrap(), 0);
        let sessions = catalog.list_catalog_sessions(true).await.unwrap();
        assert_eq!(sessions[0].modified_at, 99);

        assert!(matches!(
            catalog.patch_session_meta("missing", &patch).await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));
        catalog.upsert_session(entry("a", false)).await.unwrap();

        assert!(catalog.remove_session("a").await.unwrap());
        assert!(!catalog.remove_session("a").await.unwrap());
        assert!(catalog.list_catalog_sessions(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, "{ not json").unwrap();
        let catalog = FileCatalog::new(&path);

        assert!(matches!(
            catalog.list_catalog_sessions(true).await,
            Err(CatalogError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_batch_persists_every_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = FileCatalog::new(&path);
        for id in ["a", "b", "c"] {
            catalog.upsert_session(entry(id, false)).await.unwrap();
        }

        let updates: Vec<(String, u64)> =
            ["a", "b", "c"].iter().map(|id| (id.to_string(), 500)).collect();
        assert_eq!(catalog.touch_sessions(&updates).await.unwrap(), 3);

        let reopened = FileCatalog::new(&path);
        let sessions = reopened.list_catalog_sessions(true).await.unwrap();
        assert!(sessions.iter().all(|s| s.modified_at == 500));
    }
}
