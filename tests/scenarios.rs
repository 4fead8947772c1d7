use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use sentio_client::client::{ApiClient, Method, RetryPolicy};
use sentio_client::config::Config;
use sentio_client::error::ApiError;
use sentio_client::session::{Credentials, SessionManager, SessionSnapshot, SessionState};
use sentio_client::storage::{MemoryStore, PreferenceStore, StorageError, TokenStore};
use sentio_client::telemetry::{TelemetryAggregator, ViewOutcome};
use sentio_client::testing::{analytics_json, user_json, workspace, workspace_json, FakeTransport};
use sentio_client::workspace::{WorkspaceDirectory, LAST_WORKSPACE_KEY};

const EMAIL: &str = "user@example.com";
const PASSWORD: &str = "Secret123";
const WAIT: Duration = Duration::from_secs(2);

/// Token store that records what the session looked like at each clear
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    session: OnceLock<watch::Receiver<SessionSnapshot>>,
    identity_at_clear: Mutex<Vec<bool>>,
}

impl TokenStore for RecordingStore {
    fn get(&self) -> Result<Option<String>, StorageError> {
        TokenStore::get(&self.inner)
    }

    fn set(&self, token: &str) -> Result<(), StorageError> {
        TokenStore::set(&self.inner, token)
    }

    fn clear(&self) -> Result<(), StorageError> {
        if let Some(session) = self.session.get() {
            let identity_present = session.borrow().identity.is_some();
            self.identity_at_clear.lock().unwrap().push(identity_present);
        }
        TokenStore::clear(&self.inner)
    }
}

fn fake_api() -> Arc<FakeTransport> {
    let fake = FakeTransport::new();
    fake.set(Method::Get, "/api/users/me", 200, user_json(1, EMAIL));
    fake
}

fn client(fake: &Arc<FakeTransport>) -> ApiClient {
    ApiClient::with_transport(
        fake.clone(),
        RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::ZERO,
        },
    )
}

async fn signed_in(fake: &Arc<FakeTransport>) -> SessionManager {
    fake.set(Method::Post, "/api/auth/signin", 200, json!({ "token": "tok" }));
    let session = SessionManager::new(client(fake), Arc::new(MemoryStore::new()));
    session
        .sign_in(Credentials::new(EMAIL, PASSWORD))
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn token_is_durable_before_authenticated_is_published() {
    let fake = fake_api();
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(client(&fake), store.clone());

    for token in ["a", "tok-123", "eyJhbGciOiJIUzI1NiJ9.e30.sig", "jeton-é"] {
        fake.set(Method::Post, "/api/auth/signin", 200, json!({ "token": token }));

        let mut snapshots = session.subscribe();
        let observed_store = store.clone();
        let observer = tokio::spawn(async move {
            snapshots
                .wait_for(|s| s.state == SessionState::Authenticated)
                .await
                .unwrap();
            TokenStore::get(observed_store.as_ref()).unwrap()
        });

        session
            .sign_in(Credentials::new(EMAIL, PASSWORD))
            .await
            .unwrap();

        assert_eq!(observer.await.unwrap().as_deref(), Some(token));
        assert_eq!(TokenStore::get(store.as_ref()).unwrap().as_deref(), Some(token));

        session.sign_out().await.unwrap();
    }
}

#[tokio::test]
async fn sign_out_clears_store_before_identity() {
    let fake = fake_api();
    fake.set(Method::Post, "/api/auth/signin", 200, json!({ "token": "tok" }));
    let store = Arc::new(RecordingStore::default());
    let session = SessionManager::new(client(&fake), store.clone());
    let _ = store.session.set(session.subscribe());

    session
        .sign_in(Credentials::new(EMAIL, PASSWORD))
        .await
        .unwrap();
    let mut snapshots = session.subscribe();
    tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.identity.is_some()))
        .await
        .unwrap()
        .unwrap();

    session.sign_out().await.unwrap();

    assert_eq!(*store.identity_at_clear.lock().unwrap(), vec![true]);
    assert!(session.identity().is_none());
    assert_eq!(TokenStore::get(store.as_ref()).unwrap(), None);
    assert_eq!(session.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn sign_in_then_identity_matches_email() {
    let fake = fake_api();
    let session = signed_in(&fake).await;

    let user = session.refresh_identity().await.unwrap();
    assert_eq!(user.email, EMAIL);
    assert_eq!(session.identity().unwrap().email, EMAIL);
}

#[tokio::test]
async fn selection_falls_back_to_persisted_or_first() {
    let fake = fake_api();
    let session = signed_in(&fake).await;

    let cases: [(&[i64], Option<i64>, i64); 5] = [
        (&[1, 2], None, 1),
        (&[1, 2, 3], Some(3), 3),
        (&[1, 2, 3], Some(9), 1),
        (&[7], Some(7), 7),
        (&[4, 2], Some(5), 4),
    ];

    for (ids, persisted, expected) in cases {
        let preferences = Arc::new(MemoryStore::new());
        if let Some(id) = persisted {
            PreferenceStore::set(preferences.as_ref(), LAST_WORKSPACE_KEY, &id.to_string()).unwrap();
        }
        let list: Vec<_> = ids
            .iter()
            .map(|id| workspace_json(&workspace(*id, &format!("W{}", id), &[])))
            .collect();
        fake.set(Method::Get, "/api/workspaces", 200, json!(list));

        let directory = WorkspaceDirectory::new(session.clone(), preferences);
        directory.list().await.unwrap();
        assert_eq!(directory.current().map(|w| w.id), Some(expected), "list {:?}", ids);
    }
}

#[tokio::test]
async fn first_workspace_is_current_without_prior_selection() {
    let fake = fake_api();
    let session = signed_in(&fake).await;
    fake.set(
        Method::Get,
        "/api/workspaces",
        200,
        json!([
            workspace_json(&workspace(1, "Home", &[])),
            workspace_json(&workspace(2, "Office", &[]))
        ]),
    );

    let directory = WorkspaceDirectory::new(session, Arc::new(MemoryStore::new()));
    directory.list().await.unwrap();
    assert_eq!(directory.current().unwrap().id, 1);
}

#[tokio::test]
async fn k_failures_of_n_sensors_yield_n_minus_k_samples() {
    let fake = fake_api();
    let session = signed_in(&fake).await;
    let config = Config {
        predictions_enabled: false,
        ..Config::default()
    };
    let aggregator = TelemetryAggregator::new(session, &config);

    for n in 0..=4i64 {
        for k in 0..=n {
            let sensors: Vec<(i64, String, String)> = (0..n)
                .map(|i| (i, format!("S{}", i), format!("n{}k{}s{}", n, k, i)))
                .collect();
            for (i, _, source) in &sensors {
                let path = format!("/api/analytics/sensor/{}", source);
                if *i < k {
                    fake.set(Method::Get, &path, 503, json!({ "error": "down" }));
                } else {
                    fake.set(Method::Get, &path, 200, analytics_json(source, 20.0, 40.0));
                }
            }
            let refs: Vec<(i64, &str, &str)> = sensors
                .iter()
                .map(|(id, name, source)| (*id, name.as_str(), source.as_str()))
                .collect();

            let view = aggregator.aggregate(&workspace(1, "Grid", &refs)).await;

            assert_eq!(view.samples.len() as i64, n - k);
            assert_eq!(view.failures.len() as i64, k);
            if n - k > 0 {
                assert!(!view.samples.is_empty());
            }
            let expected = match (n, k) {
                (0, _) => ViewOutcome::NoSensors,
                (_, 0) => ViewOutcome::Complete,
                (n, k) if n == k => ViewOutcome::AllFailed,
                (_, k) => ViewOutcome::Partial { failed: k as usize },
            };
            assert_eq!(view.outcome(), expected);
        }
    }
}

#[tokio::test]
async fn rejected_sensor_is_marked_failed_and_others_shown() {
    let fake = fake_api();
    let session = signed_in(&fake).await;
    fake.set(Method::Get, "/api/analytics/sensor/A", 200, analytics_json("A", 21.0, 40.0));
    fake.set(Method::Get, "/api/analytics/sensor/B", 404, json!({ "error": "unknown sensor" }));
    fake.set(Method::Get, "/api/analytics/sensor/C", 200, analytics_json("C", 23.0, 44.0));

    let aggregator = TelemetryAggregator::new(session.clone(), &Config::default());
    let view = aggregator
        .aggregate(&workspace(1, "Home", &[(1, "A", "A"), (2, "B", "B"), (3, "C", "C")]))
        .await;

    assert_eq!(view.samples.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(view.failures.len(), 1);
    assert_eq!(view.failures[0].sensor_id, 2);
    assert!(session.is_signed_in());
}

#[tokio::test]
async fn only_final_selection_updates_the_view() {
    let fake = fake_api();
    let session = signed_in(&fake).await;
    let config = Config {
        predictions_enabled: false,
        ..Config::default()
    };
    let aggregator = TelemetryAggregator::new(session, &config);

    let mut passes = Vec::new();
    let mut gates = Vec::new();
    for (id, source) in [(1, "A"), (2, "B"), (3, "C")] {
        let gate = fake.hold(Method::Get, &format!("/api/analytics/sensor/{}", source));
        aggregator.switch_to(Some(workspace(id, source, &[(id, source, source)])));
        let pass = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.refresh().await })
        };
        gate.started().await;
        passes.push(pass);
        gates.push(gate);
    }

    // Resolve the newest first, then the older passes
    for (gate, source) in gates.into_iter().rev().zip(["C", "B", "A"]) {
        gate.release(200, analytics_json(source, 20.0, 40.0));
    }

    let results: Vec<_> = futures::future::join_all(passes)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results[0], Err(ApiError::Cancelled));
    assert_eq!(results[1], Err(ApiError::Cancelled));
    assert_eq!(results[2].as_ref().unwrap().as_ref().unwrap().workspace_id, 3);
    assert_eq!(aggregator.latest().unwrap().workspace_id, 3);
}

#[tokio::test]
async fn sign_out_discards_in_flight_fan_out() {
    let fake = fake_api();
    let session = signed_in(&fake).await;
    let config = Config {
        predictions_enabled: false,
        ..Config::default()
    };
    let aggregator = TelemetryAggregator::new(session.clone(), &config);

    let gate = fake.hold(Method::Get, "/api/analytics/sensor/A");
    aggregator.switch_to(Some(workspace(1, "Home", &[(1, "A", "A")])));
    let pass = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move { aggregator.refresh().await })
    };
    gate.started().await;

    session.sign_out().await.unwrap();
    gate.release(200, analytics_json("A", 20.0, 40.0));

    assert_eq!(pass.await.unwrap(), Err(ApiError::Cancelled));
    assert!(aggregator.latest().is_none());
}
