//! Session catalog
//!
//! Human-facing session metadata (names, groups, pins, archive flags) that
//! outlives the relay process. The registry merges it with live state.

mod file;

pub use file::FileCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog entry not found: {0}")]
    NotFound(String),
    #[error("Failed to access catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// One persisted session record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub working_dir: PathBuf,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub modified_at: u64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

impl CatalogEntry {
    /// Name to show: the custom name when set, otherwise the original one
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }
}

/// Partial metadata update
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl MetaPatch {
    pub fn is_empty(&self) -> bool {
        self.custom_name.is_none()
            && self.project.is_none()
            && self.pinned.is_none()
            && self.archived.is_none()
    }

    /// Apply the set fields to `entry`
    pub fn apply(&self, entry: &mut CatalogEntry) {
        if let Some(name) = &self.custom_name {
            entry.custom_name = if name.is_empty() {
                None
            } else {
                Some(name.clone())
            };
        }
        if let Some(project) = &self.project {
            entry.group = if project.is_empty() {
                None
            } else {
                Some(project.clone())
            };
        }
        if let Some(pinned) = self.pinned {
            entry.pinned = pinned;
        }
        if let Some(archived) = self.archived {
            entry.archived = archived;
        }
    }
}

/// Store of persisted session metadata
#[async_trait]
pub trait SessionCatalog: Send + Sync + 'static {
    /// All known sessions; archived ones only when requested
    async fn list_catalog_sessions(&self, include_archived: bool)
        -> CatalogResult<Vec<CatalogEntry>>;

    /// Update display metadata, returning the updated entry
    async fn patch_session_meta(&self, id: &str, patch: &MetaPatch)
        -> CatalogResult<CatalogEntry>;

    /// Insert or replace a session record
    async fn upsert_session(&self, entry: CatalogEntry) -> CatalogResult<()>;

    /// Advance modification times in one write; unknown ids and older
    /// timestamps are skipped. Returns how many entries moved forward.
    async fn touch_sessions(&self, updates: &[(String, u64)]) -> CatalogResult<usize>;

    /// Remove a session record; returns whether it existed
    async fn remove_session(&self, id: &str) -> CatalogResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            id: "s1".to_string(),
            name: "demo".to_string(),
            group: Some("web".to_string()),
            working_dir: PathBuf::from("/tmp"),
            created_at: 1,
            modified_at: 2,
            message_count: 0,
            pinned: false,
            archived: false,
            custom_name: None,
        }
    }

    #[test]
    fn test_patch_apply() {
        let mut e = entry();
        let patch = MetaPatch {
            custom_name: Some("Renamed".to_string()),
            project: Some(String::new()),
            pinned: Some(true),
            archived: None,
        };
        patch.apply(&mut e);

        assert_eq!(e.display_name(), "Renamed");
        assert_eq!(e.group, None);
        assert!(e.pinned);
        assert!(!e.archived);
    }

    #[test]
    fn test_empty_patch() {
        assert!(MetaPatch::default().is_empty());
        let mut e = entry();
        MetaPatch::default().apply(&mut e);
        assert_eq!(e, entry());
    }

    #[test]
    fn test_entry_uses_camel_case() {
        let json = serde_json::to_string(&entry()).unwrap();
        assert!(json.contains("\"workingDir\":\"/tmp\""));
        assert!(json.contains("\"modifiedAt\":2"));
        assert!(!json.contains("customName"));
    }
}
