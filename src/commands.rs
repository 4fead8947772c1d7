//! Commands Module
//!
//! UI-facing calls. Every call returns a serializable response; failures
//! are turned into user messages here so screens never see raw errors.

use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::ApiError;
use crate::models::{User, Workspace, WorkspaceId};
use crate::session::{
    Credentials, PasswordReset, PasswordResetRequest, SessionError, SessionState, SignUpOutcome,
    SignUpRequest,
};
use crate::telemetry::{AggregatedView, ViewOutcome};
use crate::workspace::DirectoryError;
use crate::AppState;

// Response types for the presentation layer

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Inline, next to the form or action that caused it
    Form,
    /// Dismissible banner
    Banner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub kind: MessageKind,
    pub text: String,
}

impl UserMessage {
    pub fn form(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Form,
            text: text.into(),
        }
    }

    pub fn banner(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Banner,
            text: text.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub state: SessionState,
    pub signed_in: bool,
    pub user: Option<User>,
    pub message: Option<UserMessage>,
}

#[derive(Debug, Serialize)]
pub struct AuthResult {
    pub success: bool,
    pub pending_validation: bool,
    pub message: Option<UserMessage>,
}

#[derive(Debug, Serialize)]
pub struct WorkspacesResponse {
    pub signed_in: bool,
    pub workspaces: Vec<Workspace>,
    pub current: Option<WorkspaceId>,
    pub message: Option<UserMessage>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub signed_in: bool,
    pub view: Option<AggregatedView>,
    pub outcome: Option<ViewOutcome>,
    pub message: Option<UserMessage>,
}

/// `None` when the error must not reach the user
pub fn api_message(err: &ApiError) -> Option<UserMessage> {
    match err {
        // Handled by the session; the UI reads it as signed out
        ApiError::Unauthenticated | ApiError::Cancelled => None,
        ApiError::Invalid { message, .. } => Some(UserMessage::form(message.clone())),
        ApiError::Unavailable(_) => Some(UserMessage::banner(
            "The server is unreachable. Please try again.",
        )),
    }
}

pub fn session_message(err: &SessionError) -> Option<UserMessage> {
    match err {
        SessionError::Validation(text) | SessionError::Rejected(text) => {
            Some(UserMessage::form(text.clone()))
        }
        SessionError::Busy(state) => Some(UserMessage::form(format!("Session is {}", state))),
        SessionError::Api(e) => api_message(e),
        SessionError::Storage(_) => Some(UserMessage::banner(
            "Could not save your session on this device.",
        )),
    }
}

pub fn directory_message(err: &DirectoryError) -> Option<UserMessage> {
    match err {
        DirectoryError::Validation(text) => Some(UserMessage::form(text.clone())),
        DirectoryError::UnknownWorkspace(_) => {
            Some(UserMessage::form("That workspace is no longer available."))
        }
        DirectoryError::NoSelection => Some(UserMessage::form("Select a workspace first.")),
        DirectoryError::Api(e) => api_message(e),
        DirectoryError::Storage(_) => Some(UserMessage::banner(
            "Could not remember your workspace choice.",
        )),
    }
}

fn session_response(state: &AppState, message: Option<UserMessage>) -> SessionResponse {
    let snapshot = state.session.snapshot();
    SessionResponse {
        signed_in: snapshot.state == SessionState::Authenticated,
        state: snapshot.state,
        user: snapshot.identity,
        message,
    }
}

fn workspaces_response(state: &AppState, message: Option<UserMessage>) -> WorkspacesResponse {
    WorkspacesResponse {
        signed_in: state.session.is_signed_in(),
        workspaces: state.directory.workspaces(),
        current: state.directory.current().map(|w| w.id),
        message,
    }
}

// Commands

/// Restore the stored session, if any
pub async fn get_stored_session(state: &AppState) -> SessionResponse {
    debug!("Getting stored session");

    match state.session.restore().await {
        Ok(_) => session_response(state, None),
        Err(e) => {
            error!("Session restore failed: {}", e);
            session_response(state, session_message(&e))
        }
    }
}

pub async fn sign_in(state: &AppState, email: String, password: String) -> AuthResult {
    match state.session.sign_in(Credentials::new(email, password)).await {
        Ok(()) => AuthResult {
            success: true,
            pending_validation: false,
            message: None,
        },
        Err(e) => {
            info!("Sign-in not completed: {}", e);
            AuthResult {
                success: false,
                pending_validation: false,
                message: session_message(&e),
            }
        }
    }
}

pub async fn sign_up(state: &AppState, request: SignUpRequest) -> AuthResult {
    match state.session.sign_up(request).await {
        Ok(SignUpOutcome::Authenticated) => AuthResult {
            success: true,
            pending_validation: false,
            message: None,
        },
        Ok(SignUpOutcome::PendingValidation { message }) => AuthResult {
            success: true,
            pending_validation: true,
            message: Some(UserMessage::form(message)),
        },
        Err(e) => {
            info!("Sign-up not completed: {}", e);
            AuthResult {
                success: false,
                pending_validation: false,
                message: session_message(&e),
            }
        }
    }
}

/// Sign out and stop the dashboard
pub async fn sign_out(state: &AppState) -> SessionResponse {
    stop_dashboard(state);

    let message = match state.session.sign_out().await {
        Ok(()) => None,
        Err(e) => {
            error!("Sign-out left a stored token behind: {}", e);
            session_message(&e)
        }
    };
    state.directory.reset();
    state.telemetry.reset();

    session_response(state, message)
}

fn account_result(result: Result<Option<String>, SessionError>, action: &str) -> AuthResult {
    match result {
        Ok(message) => AuthResult {
            success: true,
            pending_validation: false,
            message: message.map(UserMessage::form),
        },
        Err(e) => {
            info!("{} not completed: {}", action, e);
            AuthResult {
                success: false,
                pending_validation: false,
                message: session_message(&e),
            }
        }
    }
}

/// Confirm an account from its validation link
pub async fn validate_account(state: &AppState, token: String) -> AuthResult {
    let result = state.session.validate_account(&token).await.map(Some);
    account_result(result, "Account validation")
}

pub async fn forgot_password(state: &AppState, email: String) -> AuthResult {
    let result = state
        .session
        .request_password_reset(PasswordResetRequest::new(email))
        .await
        .map(|()| {
            Some("If an account exists for that email, a reset link is on its way".to_string())
        });
    account_result(result, "Password reset request")
}

pub async fn reset_password(
    state: &AppState,
    token: String,
    password: String,
    confirm_password: String,
) -> AuthResult {
    let reset = PasswordReset {
        token,
        password,
        confirm_password,
    };
    let result = state.session.reset_password(reset).await.map(|()| None);
    account_result(result, "Password reset")
}

pub async fn load_workspaces(state: &AppState) -> WorkspacesResponse {
    let message = match state.directory.list().await {
        Ok(_) => None,
        Err(e) => directory_message(&e),
    };
    workspaces_response(state, message)
}

pub async fn select_workspace(state: &AppState, id: WorkspaceId) -> WorkspacesResponse {
    let message = match state.directory.select(id) {
        Ok(_) => None,
        Err(e) => directory_message(&e),
    };
    workspaces_response(state, message)
}

/// Run one telemetry pass for the current workspace
pub async fn refresh_dashboard(state: &AppState) -> DashboardResponse {
    let current = state.directory.current();
    // Compare by value so a refreshed sensor list reaches the aggregator
    if state.telemetry.current_workspace() != current {
        state.telemetry.switch_to(current);
    }

    let message = match state.telemetry.refresh().await {
        Ok(_) => None,
        Err(e) => api_message(&e),
    };

    let view = state.telemetry.latest();
    DashboardResponse {
        signed_in: state.session.is_signed_in(),
        outcome: view.as_ref().map(AggregatedView::outcome),
        view,
        message,
    }
}

/// Start the periodic telemetry refresh for the current selection
pub fn start_dashboard(state: &AppState) {
    debug!("Starting dashboard refresh");

    let handle = state
        .telemetry
        .spawn_refresh_loop(state.directory.subscribe(), state.session.subscribe());

    if let Ok(mut slot) = state.refresh.lock() {
        // Replacing the handle stops the previous loop
        *slot = Some(handle);
    }
}

pub fn stop_dashboard(state: &AppState) {
    if let Ok(mut slot) = state.refresh.lock() {
        if let Some(handle) = slot.take() {
            handle.stop();
        }
    }
}

/// Ask the running dashboard loop for an immediate pass
pub fn pull_to_refresh(state: &AppState) {
    if let Ok(slot) = state.refresh.lock() {
        if let Some(handle) = slot.as_ref() {
            handle.refresh_now();
        }
    }
}
