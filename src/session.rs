//! Session Module
//!
//! Owns the session token and the signed-in identity, drives the
//! sign-in/sign-up/sign-out state machine, and issues authorized requests
//! on behalf of every other component.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::client::{ApiClient, RequestSpec};
use crate::error::ApiError;
use crate::models::User;
use crate::storage::{StorageError, TokenStore};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Invalidating,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Anonymous => write!(f, "anonymous"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Invalidating => write!(f, "invalidating"),
        }
    }
}

/// What observers see of the session.
///
/// `epoch` changes whenever a token is established or torn down, and tags
/// every authorized request issued under it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub identity: Option<User>,
    pub epoch: u64,
}

/// Email and password for sign-in
#[derive(Clone, Serialize, Validate)]
pub struct Credentials {
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[validate(custom(function = "password_strength"))]
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Account creation form
#[derive(Clone, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    #[validate(custom(function = "not_blank", message = "First name is required"))]
    pub first_name: String,
    #[validate(custom(function = "not_blank", message = "Last name is required"))]
    pub last_name: String,
    #[validate(custom(function = "not_blank", message = "Username is required"))]
    pub username: String,
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[validate(custom(function = "password_strength"))]
    pub password: String,
}

impl std::fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Result of a successful sign-up call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignUpOutcome {
    /// Server issued a token; the session is live
    Authenticated,
    /// Account created but must be validated (e.g. by email) first
    PendingValidation { message: String },
}

/// Forgot-password form
#[derive(Debug, Clone, Serialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
}

impl PasswordResetRequest {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }
}

/// New password chosen from a reset link
#[derive(Clone, Validate)]
pub struct PasswordReset {
    pub token: String,
    #[validate(custom(function = "password_strength"))]
    pub password: String,
    #[validate(must_match(other = "password", message = "Passwords do not match"))]
    pub confirm_password: String,
}

impl std::fmt::Debug for PasswordReset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordReset")
            .field("token", &"***")
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SignUpResponse {
    token: Option<String>,
    message: Option<String>,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("Sign-in rejected: {0}")]
    Rejected(String),

    #[error("Session is {0}")]
    Busy(SessionState),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn password_strength(password: &str) -> Result<(), ValidationError> {
    let problem = if password.chars().count() < 8 {
        Some("Password must be at least 8 characters")
    } else if !password.chars().any(|c| c.is_ascii_uppercase()) {
        Some("Password must contain an uppercase letter")
    } else if !password.chars().any(|c| c.is_ascii_digit()) {
        Some("Password must contain a digit")
    } else {
        None
    };

    match problem {
        Some(message) => {
            let mut err = ValidationError::new("password_strength");
            err.message = Some(message.into());
            Err(err)
        }
        None => Ok(()),
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Flatten validator output into one user-facing line
fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<(String, String)> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            let field = field.to_string();
            errs.iter().map(move |err| {
                let text = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{} is invalid", field));
                (field.clone(), text)
            })
        })
        .collect();
    messages.sort();
    messages
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Authority errors during sign-in/up are bad credentials, not teardown
fn rejection(err: ApiError) -> SessionError {
    match err {
        ApiError::Unauthenticated => SessionError::Rejected("Invalid credentials".into()),
        ApiError::Invalid { message, .. } => SessionError::Rejected(message),
        other => SessionError::Api(other),
    }
}

struct Inner {
    state: SessionState,
    token: Option<String>,
    identity: Option<User>,
    epoch: u64,
    /// Bumped per sign-in/up attempt and when one is abandoned
    attempt: u64,
}

struct Shared {
    client: ApiClient,
    store: Arc<dyn TokenStore>,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<SessionSnapshot>,
}

/// Single owner of the session token.
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(client: ApiClient, store: Arc<dyn TokenStore>) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: SessionState::Anonymous,
            identity: None,
            epoch: 0,
        });

        Self {
            shared: Arc::new(Shared {
                client,
                store,
                inner: Mutex::new(Inner {
                    state: SessionState::Anonymous,
                    token: None,
                    identity: None,
                    epoch: 0,
                    attempt: 0,
                }),
                snapshot,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn identity(&self) -> Option<User> {
        self.lock().identity.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_signed_in(&self) -> bool {
        self.lock().state == SessionState::Authenticated
    }

    /// Silent restore at cold start.
    ///
    /// A stored token is trusted immediately and verified in the
    /// background by loading the identity.
    pub async fn restore(&self) -> Result<bool, SessionError> {
        if self.state() != SessionState::Anonymous {
            return Ok(self.is_signed_in());
        }

        let Some(token) = self.shared.store.get()? else {
            debug!("No stored session found");
            return Ok(false);
        };

        {
            let mut inner = self.lock();
            if inner.state != SessionState::Anonymous {
                return Ok(inner.state == SessionState::Authenticated);
            }
            inner.token = Some(token);
            inner.identity = None;
            inner.epoch += 1;
            inner.state = SessionState::Authenticated;
            self.publish(&inner);
        }

        info!("Session restored from secure storage");
        self.spawn_identity_load(true);
        Ok(true)
    }

    /// Sign in with email and password
    pub async fn sign_in(&self, credentials: Credentials) -> Result<(), SessionError> {
        credentials
            .validate()
            .map_err(|e| SessionError::Validation(describe(&e)))?;

        let attempt = self.begin_authenticating()?;
        info!("Signing in");

        let spec = match RequestSpec::post("/api/auth/signin")
            .public()
            .json(&credentials)
        {
            Ok(spec) => spec,
            Err(e) => {
                self.abort_authenticating(attempt);
                return Err(e.into());
            }
        };

        match self.authenticate::<SignInResponse>(&spec).await {
            Ok(response) => self.complete(response.token, attempt),
            Err(e) => {
                warn!("Sign-in failed: {}", e);
                self.abort_authenticating(attempt);
                Err(rejection(e))
            }
        }
    }

    /// Create an account; signs in when the server hands back a token
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, SessionError> {
        request
            .validate()
            .map_err(|e| SessionError::Validation(describe(&e)))?;

        let attempt = self.begin_authenticating()?;
        info!("Signing up");

        let spec = match RequestSpec::post("/api/auth/signup").public().json(&request) {
            Ok(spec) => spec,
            Err(e) => {
                self.abort_authenticating(attempt);
                return Err(e.into());
            }
        };

        match self.authenticate::<SignUpResponse>(&spec).await {
            Ok(SignUpResponse {
                token: Some(token), ..
            }) => {
                self.complete(token, attempt)?;
                Ok(SignUpOutcome::Authenticated)
            }
            Ok(SignUpResponse { message, .. }) => {
                self.abort_authenticating(attempt);
                let message =
                    message.unwrap_or_else(|| "Account created, check your email".to_string());
                info!("Sign-up pending validation");
                Ok(SignUpOutcome::PendingValidation { message })
            }
            Err(e) => {
                warn!("Sign-up failed: {}", e);
                self.abort_authenticating(attempt);
                Err(rejection(e))
            }
        }
    }

    /// Explicit sign-out.
    ///
    /// A pending sign-in or sign-up is abandoned. A storage fault is
    /// reported after the in-memory session is gone.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        info!("Signing out");
        if self.cancel_authenticating() {
            info!("Pending sign-in abandoned");
            return Ok(());
        }
        self.invalidate(None).map_err(SessionError::from)
    }

    /// Confirm an account with the token from the validation email
    pub async fn validate_account(&self, token: &str) -> Result<String, SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::Validation("Invalid validation link".into()));
        }

        let spec = RequestSpec::get(format!("/api/auth/validate/{}", token)).public();
        let response: Option<MessageResponse> =
            self.shared.client.request(&spec, None).await.map_err(rejection)?;

        info!("Account validated");
        Ok(response
            .and_then(|r| r.message)
            .unwrap_or_else(|| "Account validated, you can now sign in".to_string()))
    }

    /// Ask for a password reset email.
    ///
    /// The server answers the same way whether or not the account exists.
    pub async fn request_password_reset(
        &self,
        request: PasswordResetRequest,
    ) -> Result<(), SessionError> {
        request
            .validate()
            .map_err(|e| SessionError::Validation(describe(&e)))?;

        let spec = RequestSpec::post("/api/auth/forgot-password")
            .public()
            .json(&request)?;
        let _: serde_json::Value = self.shared.client.request(&spec, None).await?;

        info!("Password reset requested");
        Ok(())
    }

    /// Set a new password with the token from the reset email
    pub async fn reset_password(&self, reset: PasswordReset) -> Result<(), SessionError> {
        reset
            .validate()
            .map_err(|e| SessionError::Validation(describe(&e)))?;
        let token = reset.token.trim();
        if token.is_empty() {
            return Err(SessionError::Validation("Invalid reset link".into()));
        }

        let spec = RequestSpec::post(format!("/api/auth/reset-password/{}", token))
            .public()
            .json(&serde_json::json!({ "password": reset.password }))?;
        let _: serde_json::Value = self
            .shared
            .client
            .request(&spec, None)
            .await
            .map_err(rejection)?;

        info!("Password reset");
        Ok(())
    }

    /// Load the identity for the current token, retrying transient faults
    pub async fn refresh_identity(&self) -> Result<User, SessionError> {
        let epoch = self.epoch();
        let user: User = self
            .send(&RequestSpec::get("/api/users/me"), true, true)
            .await?;

        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state != SessionState::Authenticated {
            return Err(ApiError::Cancelled.into());
        }
        inner.identity = Some(user.clone());
        self.publish(&inner);
        debug!("Identity loaded for {}", user.email);
        Ok(user)
    }

    /// Authorized request; an authority rejection ends the session
    pub async fn request<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, ApiError> {
        self.send(spec, false, true).await
    }

    /// Authorized request with the client's retry policy
    pub async fn request_with_retry<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
    ) -> Result<T, ApiError> {
        self.send(spec, true, true).await
    }

    /// Authorized request whose rejection stays local to the caller
    pub async fn request_isolated<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
    ) -> Result<T, ApiError> {
        self.send(spec, false, false).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
        retry: bool,
        teardown: bool,
    ) -> Result<T, ApiError> {
        let (token, epoch) = {
            let inner = self.lock();
            match (&inner.token, inner.state) {
                (Some(token), SessionState::Authenticated) => (Some(token.clone()), inner.epoch),
                _ if !spec.authorized => (None, inner.epoch),
                _ => return Err(ApiError::Unauthenticated),
            }
        };

        let mut snapshots = self.subscribe();
        let client = &self.shared.client;
        let call = async {
            if retry {
                client.request_with_retry::<T>(spec, token.as_deref()).await
            } else {
                client.request::<T>(spec, token.as_deref()).await
            }
        };

        let result = tokio::select! {
            result = call => result,
            _ = snapshots.wait_for(|s| s.epoch != epoch) => {
                debug!("{} {} cancelled by session change", spec.method, spec.path);
                Err(ApiError::Cancelled)
            }
        };

        if self.epoch() != epoch {
            return Err(ApiError::Cancelled);
        }

        if teardown && matches!(result, Err(ApiError::Unauthenticated)) {
            warn!("{} {} rejected the session token", spec.method, spec.path);
            if let Err(e) = self.invalidate(Some(epoch)) {
                error!("Failed to clear rejected token: {}", e);
            }
        }

        result
    }

    fn spawn_identity_load(&self, restoring: bool) {
        let session = self.clone();
        let epoch = self.epoch();

        tokio::spawn(async move {
            match session.refresh_identity().await {
                Ok(_) => {}
                Err(SessionError::Api(ApiError::Unauthenticated)) => {
                    info!("Stored token rejected, session invalidated");
                }
                Err(SessionError::Api(ApiError::Cancelled)) => {
                    debug!("Identity load superseded");
                }
                Err(SessionError::Api(e @ ApiError::Invalid { .. })) if restoring => {
                    warn!("Session verification failed: {}", e);
                    if let Err(e) = session.invalidate(Some(epoch)) {
                        error!("Failed to clear unverifiable token: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Identity load abandoned: {}", e);
                }
            }
        });
    }

    /// Auth endpoint call, dropped as soon as the attempt is abandoned
    async fn authenticate<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, ApiError> {
        let mut snapshots = self.subscribe();
        tokio::select! {
            result = self.shared.client.request::<T>(spec, None) => result,
            _ = snapshots.wait_for(|s| s.state != SessionState::Authenticating) => {
                debug!("{} {} abandoned", spec.method, spec.path);
                Err(ApiError::Cancelled)
            }
        }
    }

    fn begin_authenticating(&self) -> Result<u64, SessionError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Anonymous {
            return Err(SessionError::Busy(inner.state));
        }
        inner.attempt += 1;
        inner.state = SessionState::Authenticating;
        self.publish(&inner);
        Ok(inner.attempt)
    }

    fn abort_authenticating(&self, attempt: u64) {
        let mut inner = self.lock();
        if inner.state == SessionState::Authenticating && inner.attempt == attempt {
            inner.state = SessionState::Anonymous;
            inner.token = None;
            inner.identity = None;
            self.publish(&inner);
        }
    }

    /// Abandon a pending sign-in/up; its response will not be applied
    fn cancel_authenticating(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Authenticating {
            return false;
        }
        inner.attempt += 1;
        inner.state = SessionState::Anonymous;
        inner.token = None;
        inner.identity = None;
        self.publish(&inner);
        true
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Authenticating && inner.attempt == attempt
    }

    /// Persist, verify, then publish
    fn complete(&self, token: String, attempt: u64) -> Result<(), SessionError> {
        if !self.is_current_attempt(attempt) {
            debug!("Discarding token for an abandoned sign-in");
            return Err(ApiError::Cancelled.into());
        }

        if token.is_empty() {
            self.abort_authenticating(attempt);
            return Err(SessionError::Rejected("Server returned an empty token".into()));
        }

        if let Err(e) = self.persist(&token) {
            error!("Failed to persist session token: {}", e);
            if let Err(e) = self.shared.store.clear() {
                warn!("Failed to clear partially written token: {}", e);
            }
            self.abort_authenticating(attempt);
            return Err(e.into());
        }

        {
            let mut inner = self.lock();
            if inner.state == SessionState::Authenticating && inner.attempt == attempt {
                inner.token = Some(token);
                inner.identity = None;
                inner.epoch += 1;
                inner.state = SessionState::Authenticated;
                self.publish(&inner);
            } else {
                drop(inner);
                // Signed out while the token was being written
                self.discard_persisted(&token);
                return Err(ApiError::Cancelled.into());
            }
        }

        info!("Session established");
        self.spawn_identity_load(false);
        Ok(())
    }

    /// Remove `token` from the store unless a newer one replaced it
    fn discard_persisted(&self, token: &str) {
        match self.shared.store.get() {
            Ok(Some(stored)) if stored == token => {
                if let Err(e) = self.shared.store.clear() {
                    warn!("Failed to clear abandoned token: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read back abandoned token: {}", e),
        }
    }

    fn persist(&self, token: &str) -> Result<(), StorageError> {
        self.shared.store.set(token)?;
        match self.shared.store.get()? {
            Some(stored) if stored == token => Ok(()),
            _ => Err(StorageError::Verification),
        }
    }

    /// Authenticated → Invalidating → Anonymous.
    ///
    /// Order: token leaves the store, then identity and token leave memory
    /// and the epoch moves (cancelling in-flight requests), then Anonymous
    /// is published. With `expected_epoch` set, only that session is torn
    /// down.
    fn invalidate(&self, expected_epoch: Option<u64>) -> Result<(), StorageError> {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Authenticated {
                return Ok(());
            }
            if expected_epoch.is_some_and(|epoch| epoch != inner.epoch) {
                debug!("Ignoring rejection from a previous session");
                return Ok(());
            }
            inner.state = SessionState::Invalidating;
            self.publish(&inner);
        }

        let cleared = self.shared.store.clear();

        {
            let mut inner = self.lock();
            inner.token = None;
            inner.identity = None;
            inner.epoch += 1;
            self.publish(&inner);

            inner.state = SessionState::Anonymous;
            self.publish(&inner);
        }

        info!("Session cleared");
        cleared
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.shared.snapshot.send_replace(SessionSnapshot {
            state: inner.state,
            identity: inner.identity.clone(),
            epoch: inner.epoch,
        });
    }
}
