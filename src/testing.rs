//! Test Helpers
//!
//! Scripted transport and fixtures for exercising the client without a
//! server.
//!
//! ```rust,ignore
//! let fake = FakeTransport::new();
//! fake.set(Method::Post, "/api/auth/signin", 200, json!({ "token": "t" }));
//! let api = ApiClient::with_transport(fake.clone(), RetryPolicy::none());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};

use crate::client::{HttpRequest, HttpResponse, Method, Transport};
use crate::error::ApiError;
use crate::models::{Sensor, Workspace};

type Route = (Method, String);

enum Scripted {
    Respond(HttpResponse),
    Fail(String),
    Hold {
        release: oneshot::Receiver<HttpResponse>,
        started: Arc<Notify>,
    },
}

#[derive(Default)]
struct Routes {
    queued: HashMap<Route, VecDeque<Scripted>>,
    sticky: HashMap<Route, HttpResponse>,
    failing: HashMap<Route, String>,
}

/// Transport answering from a script instead of the network.
///
/// Queued answers are consumed first, then the sticky answer for the
/// route; unknown routes get a 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Routes>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every call on the route with `status`/`body`
    pub fn set(&self, method: Method, path: &str, status: u16, body: Value) {
        let mut routes = self.routes.lock().unwrap();
        let route = (method, path.to_string());
        routes.failing.remove(&route);
        routes.sticky.insert(route, HttpResponse::json(status, &body));
    }

    /// Answer the next call on the route once
    pub fn push(&self, method: Method, path: &str, status: u16, body: Value) {
        self.push_raw(method, path, HttpResponse::json(status, &body));
    }

    pub fn push_raw(&self, method: Method, path: &str, response: HttpResponse) {
        self.enqueue(method, path, Scripted::Respond(response));
    }

    /// Fail the next call on the route at transport level
    pub fn push_failure(&self, method: Method, path: &str, message: &str) {
        self.enqueue(method, path, Scripted::Fail(message.to_string()));
    }

    /// Fail every call on the route at transport level
    pub fn fail(&self, method: Method, path: &str, message: &str) {
        let mut routes = self.routes.lock().unwrap();
        routes
            .failing
            .insert((method, path.to_string()), message.to_string());
    }

    /// Park the next call on the route until the returned gate is released
    pub fn hold(&self, method: Method, path: &str) -> Gate {
        let (tx, rx) = oneshot::channel();
        let started = Arc::new(Notify::new());
        self.enqueue(
            method,
            path,
            Scripted::Hold {
                release: rx,
                started: started.clone(),
            },
        );
        Gate {
            release: Some(tx),
            started,
        }
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    fn enqueue(&self, method: Method, path: &str, scripted: Scripted) {
        let mut routes = self.routes.lock().unwrap();
        routes
            .queued
            .entry((method, path.to_string()))
            .or_default()
            .push_back(scripted);
    }

    fn next(&self, route: &Route) -> Scripted {
        let mut routes = self.routes.lock().unwrap();
        if let Some(scripted) = routes.queued.get_mut(route).and_then(VecDeque::pop_front) {
            return scripted;
        }
        if let Some(message) = routes.failing.get(route) {
            return Scripted::Fail(message.clone());
        }
        match routes.sticky.get(route) {
            Some(response) => Scripted::Respond(response.clone()),
            None => Scripted::Respond(HttpResponse::json(404, &json!({ "error": "not found" }))),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let route = (request.method, request.path.clone());
        self.calls.lock().unwrap().push(request);

        match self.next(&route) {
            Scripted::Respond(response) => Ok(response),
            Scripted::Fail(message) => Err(ApiError::unavailable(message)),
            Scripted::Hold { release, started } => {
                started.notify_one();
                release
                    .await
                    .map_err(|_| ApiError::unavailable("gate dropped"))
            }
        }
    }
}

/// Handle on a parked request
pub struct Gate {
    release: Option<oneshot::Sender<HttpResponse>>,
    started: Arc<Notify>,
}

impl Gate {
    /// Resolves once the parked request has been issued
    pub async fn started(&self) {
        self.started.notified().await;
    }

    pub fn release(mut self, status: u16, body: Value) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(HttpResponse::json(status, &body));
        }
    }
}

/// Workspace fixture with sensors `(id, name, source_id)`
pub fn workspace(id: i64, name: &str, sensors: &[(i64, &str, &str)]) -> Workspace {
    Workspace {
        id,
        user_id: Some(1),
        name: name.to_string(),
        description: format!("{} description", name),
        is_active: true,
        created_at: None,
        updated_at: None,
        sensors: sensors
            .iter()
            .map(|(id, name, source)| Sensor {
                id: *id,
                name: name.to_string(),
                source_id: Some(source.to_string()),
            })
            .collect(),
    }
}

/// JSON body of a workspace as the API returns it
pub fn workspace_json(workspace: &Workspace) -> Value {
    serde_json::to_value(workspace).unwrap_or(Value::Null)
}

/// Analytics record as the API returns it
pub fn analytics_json(source_id: &str, temperature: f64, humidity: f64) -> Value {
    json!({
        "time": "2024-05-01T10:00:00",
        "temperature": temperature,
        "humidity": humidity,
        "source_address": source_id,
        "topic": "sensors/env"
    })
}

/// User record as the API returns it
pub fn user_json(id: i64, email: &str) -> Value {
    json!({
        "id": id,
        "username": email.split('@').next().unwrap_or(email),
        "email": email,
        "role": "user",
        "is_validated": true,
        "created_at": "2024-01-01T00:00:00"
    })
}
