//! SentIO Client - Headless Host
//!
//! Restores or opens a session, loads the workspaces and keeps the
//! dashboard of the current workspace refreshed until Ctrl-C.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use sentio_client::{
    commands,
    config::Config,
    logging,
    session::SessionState,
    telemetry::SystemStatus,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    logging::init(&config.log_dir());
    info!("SentIO client starting...");
    info!("API: {}", config.api_base_url);

    let state = AppState::from_config(config);

    if let Err(e) = state.start().await {
        warn!("Could not read stored session: {}", e);
    }

    if !state.session.is_signed_in() {
        let (Ok(email), Ok(password)) = (
            std::env::var("SENTIO_EMAIL"),
            std::env::var("SENTIO_PASSWORD"),
        ) else {
            info!("Not signed in; set SENTIO_EMAIL and SENTIO_PASSWORD to sign in");
            return Ok(());
        };

        let result = commands::sign_in(&state, email, password).await;
        if !result.success {
            let reason = result
                .message
                .map(|m| m.text)
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("Sign-in failed: {}", reason);
        }
    }

    let listed = commands::load_workspaces(&state).await;
    if let Some(message) = listed.message {
        warn!("{}", message.text);
    }
    info!(
        "{} workspaces, current: {:?}",
        listed.workspaces.len(),
        listed.current
    );

    let mut views = state.telemetry.subscribe();
    let mut session = state.session.subscribe();
    commands::start_dashboard(&state);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            changed = session.changed() => {
                if changed.is_err() || session.borrow_and_update().state == SessionState::Anonymous {
                    warn!("Session ended");
                    break;
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                let Some(view) = view else { continue };
                info!(
                    "Workspace {}: {} of {} sensors reporting",
                    view.workspace_id,
                    view.samples.len(),
                    view.sensor_count()
                );
                if let SystemStatus::Warning { sensors } = &view.status {
                    warn!("Temperature above ceiling on sensors {:?}", sensors);
                }
            }
        }
    }

    commands::stop_dashboard(&state);
    info!("SentIO client stopped");
    Ok(())
}
