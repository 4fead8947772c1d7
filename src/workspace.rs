//! Workspace Module
//!
//! Caches the workspaces owned by the signed-in user and tracks which one
//! is current. An explicit selection is persisted so it survives restarts.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::RequestSpec;
use crate::error::ApiError;
use crate::models::{NewWorkspace, Workspace, WorkspaceId, WorkspacePatch};
use crate::session::SessionManager;
use crate::storage::{PreferenceStore, StorageError};

/// Preference key holding the last explicitly selected workspace
pub const LAST_WORKSPACE_KEY: &str = "last_workspace_id";

/// Workspace directory errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("{0}")]
    Validation(String),

    #[error("Workspace {0} is not in the loaded list")]
    UnknownWorkspace(WorkspaceId),

    #[error("No workspace selected")]
    NoSelection,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Deserialize)]
struct CreatedWorkspace {
    id: Option<WorkspaceId>,
}

#[derive(Default)]
struct Cache {
    workspaces: Vec<Workspace>,
    /// Always the id of an entry in `workspaces`
    current: Option<WorkspaceId>,
}

impl Cache {
    fn current(&self) -> Option<Workspace> {
        let id = self.current?;
        self.workspaces.iter().find(|w| w.id == id).cloned()
    }
}

struct Shared {
    session: SessionManager,
    preferences: Arc<dyn PreferenceStore>,
    cache: Mutex<Cache>,
    current_tx: watch::Sender<Option<Workspace>>,
}

/// Workspaces of the signed-in user plus the current selection
#[derive(Clone)]
pub struct WorkspaceDirectory {
    shared: Arc<Shared>,
}

/// Persisted id if it is in the list, else the first entry
pub fn resolve_selection(
    workspaces: &[Workspace],
    persisted: Option<WorkspaceId>,
) -> Option<WorkspaceId> {
    persisted
        .filter(|id| workspaces.iter().any(|w| w.id == *id))
        .or_else(|| workspaces.first().map(|w| w.id))
}

impl WorkspaceDirectory {
    pub fn new(session: SessionManager, preferences: Arc<dyn PreferenceStore>) -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                session,
                preferences,
                cache: Mutex::new(Cache::default()),
                current_tx,
            }),
        }
    }

    /// Current workspace as it changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Workspace>> {
        self.shared.current_tx.subscribe()
    }

    pub fn current(&self) -> Option<Workspace> {
        self.lock().current()
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.lock().workspaces.clone()
    }

    /// Fetch the workspace list and resolve the current selection.
    ///
    /// An empty list is a valid result and clears the selection.
    pub async fn list(&self) -> Result<Vec<Workspace>, DirectoryError> {
        let workspaces: Vec<Workspace> = self
            .shared
            .session
            .request_with_retry(&RequestSpec::get("/api/workspaces"))
            .await?;

        let persisted = self.persisted_selection();
        let current = resolve_selection(&workspaces, persisted);

        {
            let mut cache = self.lock();
            cache.workspaces = workspaces.clone();
            cache.current = current;
        }
        self.publish();

        info!(
            "Loaded {} workspaces, current: {:?}",
            workspaces.len(),
            current
        );
        Ok(workspaces)
    }

    /// Make `id` current and remember it across restarts
    pub fn select(&self, id: WorkspaceId) -> Result<Workspace, DirectoryError> {
        if !self.lock().workspaces.iter().any(|w| w.id == id) {
            return Err(DirectoryError::UnknownWorkspace(id));
        }

        self.shared
            .preferences
            .set(LAST_WORKSPACE_KEY, &id.to_string())?;

        let selected = {
            let mut cache = self.lock();
            if !cache.workspaces.iter().any(|w| w.id == id) {
                return Err(DirectoryError::UnknownWorkspace(id));
            }
            cache.current = Some(id);
            cache.current()
        };
        self.publish();

        info!("Selected workspace {}", id);
        selected.ok_or(DirectoryError::UnknownWorkspace(id))
    }

    /// Re-fetch the current workspace and replace its cached entry
    pub async fn refresh_current(&self) -> Result<Workspace, DirectoryError> {
        let id = self.lock().current.ok_or(DirectoryError::NoSelection)?;
        let fresh = self.get(id).await?;

        {
            let mut cache = self.lock();
            if cache.current != Some(id) {
                debug!("Selection moved while refreshing workspace {}", id);
                return Err(ApiError::Cancelled.into());
            }
            match cache.workspaces.iter_mut().find(|w| w.id == id) {
                Some(entry) => *entry = fresh.clone(),
                None => return Err(ApiError::Cancelled.into()),
            }
        }
        self.publish();

        debug!("Refreshed workspace {}", id);
        Ok(fresh)
    }

    /// Fetch one workspace without touching the cache
    pub async fn get(&self, id: WorkspaceId) -> Result<Workspace, DirectoryError> {
        let workspace = self
            .shared
            .session
            .request(&RequestSpec::get(format!("/api/workspaces/{}", id)))
            .await?;
        Ok(workspace)
    }

    /// Create a workspace, then reload the list
    pub async fn create(&self, new: NewWorkspace) -> Result<Option<WorkspaceId>, DirectoryError> {
        if new.name.trim().is_empty() {
            return Err(DirectoryError::Validation("Workspace name is required".into()));
        }
        if new.description.trim().is_empty() {
            return Err(DirectoryError::Validation(
                "Workspace description is required".into(),
            ));
        }

        let spec = RequestSpec::post("/api/workspaces").json(&new)?;
        let created: Option<CreatedWorkspace> = self.shared.session.request(&spec).await?;
        let id = created.and_then(|c| c.id);
        info!("Created workspace {:?}", id);

        self.list().await?;
        Ok(id)
    }

    /// Apply a partial update, then reload the list
    pub async fn update(&self, id: WorkspaceId, patch: WorkspacePatch) -> Result<(), DirectoryError> {
        if patch.is_empty() {
            return Err(DirectoryError::Validation("Nothing to update".into()));
        }
        if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(DirectoryError::Validation("Workspace name is required".into()));
        }

        let spec = RequestSpec::put(format!("/api/workspaces/{}", id)).json(&patch)?;
        let _: serde_json::Value = self.shared.session.request(&spec).await?;
        info!("Updated workspace {}", id);

        self.list().await?;
        Ok(())
    }

    /// Delete a workspace, then reload the list
    pub async fn delete(&self, id: WorkspaceId) -> Result<(), DirectoryError> {
        let spec = RequestSpec::delete(format!("/api/workspaces/{}", id));
        let _: serde_json::Value = self.shared.session.request(&spec).await?;
        info!("Deleted workspace {}", id);

        if self.persisted_selection() == Some(id) {
            if let Err(e) = self.shared.preferences.remove(LAST_WORKSPACE_KEY) {
                warn!("Failed to forget deleted workspace: {}", e);
            }
        }

        self.list().await?;
        Ok(())
    }

    /// Drop the cache and selection; the persisted choice is kept
    pub fn reset(&self) {
        *self.lock() = Cache::default();
        self.publish();
        debug!("Workspace cache cleared");
    }

    fn persisted_selection(&self) -> Option<WorkspaceId> {
        match self.shared.preferences.get(LAST_WORKSPACE_KEY) {
            Ok(Some(raw)) => raw.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read workspace preference: {}", e);
                None
            }
        }
    }

    fn publish(&self) {
        let current = self.current();
        self.shared.current_tx.send_if_modified(|published| {
            if *published == current {
                return false;
            }
            *published = current;
            true
        });
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.shared
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
