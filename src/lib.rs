//! SentIO Client Library
//!
//! Session, workspace and telemetry core for the SentIO IoT client.

pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod testing;
pub mod workspace;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;

use client::ApiClient;
use config::Config;
use session::{SessionError, SessionManager, SessionState};
use storage::{PreferenceStore, TokenStore};
use telemetry::{RefreshHandle, TelemetryAggregator};
use workspace::WorkspaceDirectory;

/// Application state shared across commands
pub struct AppState {
    pub config: Config,
    pub session: SessionManager,
    pub directory: WorkspaceDirectory,
    pub telemetry: TelemetryAggregator,
    pub(crate) refresh: Mutex<Option<RefreshHandle>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(
        config: Config,
        token_store: Arc<dyn TokenStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let client = ApiClient::new(&config);
        Self::with_client(config, client, token_store, preferences)
    }

    /// Platform stores under the configured data directory
    pub fn from_config(config: Config) -> Self {
        let token_store = storage::platform_token_store(&config);
        let preferences = storage::platform_preferences(&config);
        Self::new(config, token_store, preferences)
    }

    pub fn with_client(
        config: Config,
        client: ApiClient,
        token_store: Arc<dyn TokenStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let session = SessionManager::new(client, token_store);
        let directory = WorkspaceDirectory::new(session.clone(), preferences);
        let telemetry = TelemetryAggregator::new(session.clone(), &config);

        Self {
            config,
            session,
            directory,
            telemetry,
            refresh: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Restore the stored session and start clearing caches on sign-out
    pub async fn start(&self) -> Result<bool, SessionError> {
        let mut snapshots = self.session.subscribe();
        let directory = self.directory.clone();
        let telemetry = self.telemetry.clone();

        let watcher = tokio::spawn(async move {
            let mut signed_in = snapshots.borrow_and_update().state == SessionState::Authenticated;
            while snapshots.changed().await.is_ok() {
                let now_signed_in =
                    snapshots.borrow_and_update().state == SessionState::Authenticated;
                if signed_in && !now_signed_in {
                    info!("Signed out, clearing workspace and telemetry state");
                    directory.reset();
                    telemetry.reset();
                }
                signed_in = now_signed_in;
            }
        });

        if let Ok(mut slot) = self.watcher.lock() {
            if let Some(previous) = slot.replace(watcher) {
                previous.abort();
            }
        }

        self.session.restore().await
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watcher.lock() {
            if let Some(watcher) = slot.take() {
                watcher.abort();
            }
        }
    }
}
