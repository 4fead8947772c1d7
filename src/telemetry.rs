//! Telemetry Module
//!
//! Fans out one analytics request per sensor of the current workspace,
//! keeps whatever succeeded, and publishes the merged view. Passes issued
//! for a workspace that is no longer current are discarded.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::RequestSpec;
use crate::config::Config;
use crate::error::ApiError;
use crate::models::{parse_timestamp, Sensor, SensorId, Workspace, WorkspaceId};
use crate::session::{SessionManager, SessionSnapshot, SessionState};

/// One sensor's reading for the current pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub sensor_id: SensorId,
    pub sensor_name: String,
    pub source_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub battery: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub prediction: Option<f64>,
}

/// A sensor whose fetch failed in this pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorFailure {
    pub sensor_id: SensorId,
    pub sensor_name: String,
    pub source_id: Option<String>,
    pub error: ApiError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum SystemStatus {
    Nominal,
    /// Sensors whose temperature is above the ceiling
    Warning { sensors: Vec<SensorId> },
}

/// How much of the workspace made it into a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ViewOutcome {
    NoSensors,
    Complete,
    Partial { failed: usize },
    AllFailed,
}

/// Result of one aggregation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedView {
    pub workspace_id: WorkspaceId,
    /// Keyed by sensor id, independent of completion order
    pub samples: BTreeMap<SensorId, TelemetrySample>,
    pub failures: Vec<SensorFailure>,
    pub status: SystemStatus,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedView {
    pub fn sensor_count(&self) -> usize {
        self.samples.len() + self.failures.len()
    }

    pub fn outcome(&self) -> ViewOutcome {
        match (self.samples.len(), self.failures.len()) {
            (0, 0) => ViewOutcome::NoSensors,
            (_, 0) => ViewOutcome::Complete,
            (0, _) => ViewOutcome::AllFailed,
            (_, failed) => ViewOutcome::Partial { failed },
        }
    }
}

/// Warning when any sample runs hotter than `ceiling`
pub fn derive_status(samples: &BTreeMap<SensorId, TelemetrySample>, ceiling: f64) -> SystemStatus {
    let hot: Vec<SensorId> = samples
        .values()
        .filter(|sample| sample.temperature > ceiling)
        .map(|sample| sample.sensor_id)
        .collect();

    if hot.is_empty() {
        SystemStatus::Nominal
    } else {
        SystemStatus::Warning { sensors: hot }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyticsRecord {
    #[serde(default)]
    time: Option<String>,
    temperature: f64,
    humidity: f64,
    #[serde(default)]
    battery: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnalyticsPayload {
    Many(Vec<AnalyticsRecord>),
    One(AnalyticsRecord),
}

impl AnalyticsPayload {
    /// Most recent record by `time`
    fn latest(self) -> Option<AnalyticsRecord> {
        match self {
            AnalyticsPayload::One(record) => Some(record),
            AnalyticsPayload::Many(records) => records
                .into_iter()
                .max_by_key(|r| r.time.as_deref().and_then(parse_timestamp)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictionValue {
    Single(f64),
    Series(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct PredictionPayload {
    prediction: PredictionValue,
}

impl PredictionPayload {
    /// Next-step value
    fn value(self) -> Option<f64> {
        match self.prediction {
            PredictionValue::Single(value) => Some(value),
            PredictionValue::Series(values) => values.first().copied(),
        }
    }
}

#[derive(Default)]
struct Target {
    workspace: Option<Workspace>,
    generation: u64,
}

struct Shared {
    session: SessionManager,
    ceiling: f64,
    predictions: bool,
    refresh_interval: Duration,
    target: Mutex<Target>,
    latest_tx: watch::Sender<Option<AggregatedView>>,
}

/// Telemetry aggregator for the current workspace
#[derive(Clone)]
pub struct TelemetryAggregator {
    shared: Arc<Shared>,
}

impl TelemetryAggregator {
    pub fn new(session: SessionManager, config: &Config) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                session,
                ceiling: config.temperature_ceiling,
                predictions: config.predictions_enabled,
                refresh_interval: config.refresh_interval,
                target: Mutex::new(Target::default()),
                latest_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AggregatedView>> {
        self.shared.latest_tx.subscribe()
    }

    pub fn latest(&self) -> Option<AggregatedView> {
        self.shared.latest_tx.borrow().clone()
    }

    pub fn current_workspace(&self) -> Option<Workspace> {
        self.lock().workspace.clone()
    }

    /// Point the aggregator at a workspace.
    ///
    /// Every pass issued before this call is discarded on completion. The
    /// last view is cleared unless the workspace id is unchanged.
    pub fn switch_to(&self, workspace: Option<Workspace>) {
        let mut target = self.lock();
        let same = target.workspace.as_ref().map(|w| w.id) == workspace.as_ref().map(|w| w.id);

        target.workspace = workspace;
        target.generation += 1;

        if !same {
            self.shared.latest_tx.send_replace(None);
            debug!(
                "Telemetry switched to workspace {:?}",
                target.workspace.as_ref().map(|w| w.id)
            );
        }
    }

    /// Forget the workspace and the last view
    pub fn reset(&self) {
        self.switch_to(None);
    }

    /// Run one pass for the current workspace and commit it if still current
    pub async fn refresh(&self) -> Result<Option<AggregatedView>, ApiError> {
        let (workspace, generation) = {
            let target = self.lock();
            (target.workspace.clone(), target.generation)
        };
        let Some(workspace) = workspace else {
            return Ok(None);
        };
        if !self.shared.session.is_signed_in() {
            return Err(ApiError::Unauthenticated);
        }
        let epoch = self.shared.session.epoch();

        let view = self.aggregate(&workspace).await;

        let target = self.lock();
        if target.generation != generation || self.shared.session.epoch() != epoch {
            debug!("Discarding stale pass for workspace {}", workspace.id);
            return Err(ApiError::Cancelled);
        }
        self.shared.latest_tx.send_replace(Some(view.clone()));
        drop(target);

        Ok(Some(view))
    }

    /// All-settled fan-out over the workspace's sensors; never fails as a whole
    pub async fn aggregate(&self, workspace: &Workspace) -> AggregatedView {
        let outcomes = join_all(
            workspace
                .sensors
                .iter()
                .map(|sensor| async move { (sensor, self.fetch_sample(sensor).await) }),
        )
        .await;

        let mut samples = BTreeMap::new();
        let mut failures = Vec::new();
        for (sensor, outcome) in outcomes {
            match outcome {
                Ok(sample) => {
                    samples.insert(sensor.id, sample);
                }
                Err(error) => {
                    debug!("Sensor {} failed: {}", sensor.id, error);
                    failures.push(SensorFailure {
                        sensor_id: sensor.id,
                        sensor_name: sensor.name.clone(),
                        source_id: sensor.source_id.clone(),
                        error,
                    });
                }
            }
        }

        let status = derive_status(&samples, self.shared.ceiling);
        if failures.is_empty() {
            debug!("Workspace {}: {} samples", workspace.id, samples.len());
        } else {
            warn!(
                "Workspace {}: {} samples, {} sensors failed",
                workspace.id,
                samples.len(),
                failures.len()
            );
        }

        AggregatedView {
            workspace_id: workspace.id,
            samples,
            failures,
            status,
            generated_at: Utc::now(),
        }
    }

    async fn fetch_sample(&self, sensor: &Sensor) -> Result<TelemetrySample, ApiError> {
        let source_id = sensor
            .source_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::invalid(None, "Sensor has no source id"))?;

        let analytics = self.fetch_analytics(source_id);
        let (record, prediction) = if self.shared.predictions {
            let (record, prediction) = tokio::join!(analytics, self.fetch_prediction(source_id));
            (record?, prediction)
        } else {
            (analytics.await?, None)
        };

        Ok(TelemetrySample {
            sensor_id: sensor.id,
            sensor_name: sensor.name.clone(),
            source_id: source_id.to_string(),
            temperature: record.temperature,
            humidity: record.humidity,
            battery: record.battery,
            timestamp: record.time.as_deref().and_then(parse_timestamp),
            prediction,
        })
    }

    async fn fetch_analytics(&self, source_id: &str) -> Result<AnalyticsRecord, ApiError> {
        let spec = RequestSpec::get(format!("/api/analytics/sensor/{}", source_id));
        let payload: AnalyticsPayload = self.shared.session.request_isolated(&spec).await?;
        payload
            .latest()
            .ok_or_else(|| ApiError::invalid(None, "no data"))
    }

    async fn fetch_prediction(&self, source_id: &str) -> Option<f64> {
        let spec = RequestSpec::get(format!("/api/lstm/predict/{}", source_id));
        match self
            .shared
            .session
            .request_isolated::<PredictionPayload>(&spec)
            .await
        {
            Ok(payload) => payload.value(),
            Err(e) => {
                debug!("No prediction for {}: {}", source_id, e);
                None
            }
        }
    }

    /// Keep the view fresh while the session lasts.
    ///
    /// Runs a pass every refresh interval, on [`RefreshHandle::refresh_now`],
    /// and right after the current workspace changes. A workspace change
    /// drops the pass in flight. Sign-out clears the view and ends the loop.
    pub fn spawn_refresh_loop(
        &self,
        mut workspaces: watch::Receiver<Option<Workspace>>,
        mut session: watch::Receiver<SessionSnapshot>,
    ) -> RefreshHandle {
        let aggregator = self.clone();
        let trigger = Arc::new(Notify::new());
        let wake = trigger.clone();
        let period = self.shared.refresh_interval;

        let task = tokio::spawn(async move {
            aggregator.switch_to(workspaces.borrow_and_update().clone());

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut immediate = false;

            info!("Telemetry refresh loop started ({:?})", period);

            loop {
                if session_ended(&mut session) {
                    break;
                }

                if !immediate {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = wake.notified() => {}
                        changed = workspaces.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            aggregator.switch_to(workspaces.borrow_and_update().clone());
                            ticker.reset();
                        }
                        changed = session.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                }
                immediate = false;

                tokio::select! {
                    result = aggregator.refresh() => match result {
                        Ok(Some(view)) => debug!(
                            "Committed view for workspace {} ({:?})",
                            view.workspace_id,
                            view.outcome()
                        ),
                        Ok(None) => debug!("No workspace selected"),
                        Err(e) => debug!("Pass not committed: {}", e),
                    },
                    changed = workspaces.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        aggregator.switch_to(workspaces.borrow_and_update().clone());
                        immediate = true;
                    }
                }
            }

            aggregator.reset();
            info!("Telemetry refresh loop stopped");
        });

        RefreshHandle { trigger, task }
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        self.shared
            .target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn session_ended(session: &mut watch::Receiver<SessionSnapshot>) -> bool {
    session.borrow_and_update().state != SessionState::Authenticated
}

/// Handle on a running refresh loop; dropping it stops the loop
pub struct RefreshHandle {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Run a pass now instead of waiting for the next tick
    pub fn refresh_now(&self) {
        self.trigger.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::{ApiClient, Method, RetryPolicy};
    use crate::storage::{MemoryStore, TokenStore};
    use crate::testing::{analytics_json, user_json, workspace, FakeTransport};

    async fn setup(predictions: bool) -> (Arc<FakeTransport>, SessionManager, TelemetryAggregator) {
        let fake = FakeTransport::new();
        fake.set(Method::Get, "/api/users/me", 200, user_json(1, "user@example.com"));
        let store = Arc::new(MemoryStore::new());
        TokenStore::set(store.as_ref(), "tok").unwrap();

        let session = SessionManager::new(
            ApiClient::with_transport(fake.clone(), RetryPolicy::none()),
            store,
        );
        session.restore().await.unwrap();

        let config = Config {
            temperature_ceiling: 30.0,
            predictions_enabled: predictions,
            refresh_interval: Duration::from_secs(3600),
            ..Config::default()
        };
        let aggregator = TelemetryAggregator::new(session.clone(), &config);
        (fake, session, aggregator)
    }

    fn sample(id: SensorId, temperature: f64) -> TelemetrySample {
        TelemetrySample {
            sensor_id: id,
            sensor_name: format!("S{}", id),
            source_id: format!("src-{}", id),
            temperature,
            humidity: 40.0,
            battery: None,
            timestamp: None,
            prediction: None,
        }
    }

    #[test]
    fn status_flags_only_samples_above_ceiling() {
        let mut samples = BTreeMap::new();
        samples.insert(1, sample(1, 22.0));
        samples.insert(2, sample(2, 30.0));
        assert_eq!(derive_status(&samples, 30.0), SystemStatus::Nominal);

        samples.insert(3, sample(3, 31.5));
        assert_eq!(
            derive_status(&samples, 30.0),
            SystemStatus::Warning { sensors: vec![3] }
        );
        assert_eq!(derive_status(&BTreeMap::new(), 30.0), SystemStatus::Nominal);
    }

    #[tokio::test]
    async fn one_failed_sensor_does_not_blank_the_view() {
        let (fake, _, aggregator) = setup(false).await;
        fake.set(Method::Get, "/api/analytics/sensor/A", 200, analytics_json("A", 21.0, 40.0));
        fake.set(Method::Get, "/api/analytics/sensor/B", 500, json!({ "error": "boom" }));
        fake.set(Method::Get, "/api/analytics/sensor/C", 200, analytics_json("C", 35.0, 38.0));

        let ws = workspace(1, "Home", &[(1, "A", "A"), (2, "B", "B"), (3, "C", "C")]);
        let view = aggregator.aggregate(&ws).await;

        assert_eq!(view.samples.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(view.failures.len(), 1);
        assert_eq!(view.failures[0].sensor_id, 2);
        assert_eq!(view.outcome(), ViewOutcome::Partial { failed: 1 });
        assert_eq!(view.status, SystemStatus::Warning { sensors: vec![3] });
        assert_eq!(view.sensor_count(), 3);
    }

    #[tokio::test]
    async fn telemetry_rejection_is_a_sensor_failure() {
        let (fake, session, aggregator) = setup(false).await;
        fake.set(Method::Get, "/api/analytics/sensor/A", 401, json!({}));

        let view = aggregator
            .aggregate(&workspace(1, "Home", &[(1, "A", "A")]))
            .await;

        assert_eq!(view.outcome(), ViewOutcome::AllFailed);
        assert_eq!(view.failures[0].error, ApiError::Unauthenticated);
        assert!(session.is_signed_in());
    }

    #[tokio::test]
    async fn workspace_without_sensors_is_distinct_from_failure() {
        let (_, _, aggregator) = setup(false).await;
        let view = aggregator.aggregate(&workspace(1, "Empty", &[])).await;
        assert_eq!(view.outcome(), ViewOutcome::NoSensors);
    }

    #[tokio::test]
    async fn picks_latest_record_and_rejects_empty_series() {
        let (fake, _, aggregator) = setup(false).await;
        fake.set(
            Method::Get,
            "/api/analytics/sensor/A",
            200,
            json!([
                { "time": "2024-05-01T10:00:00", "temperature": 20.0, "humidity": 40.0 },
                { "time": "2024-05-01T12:00:00", "temperature": 23.0, "humidity": 41.0, "battery": 87.0 },
                { "time": "2024-05-01T11:00:00", "temperature": 21.0, "humidity": 42.0 }
            ]),
        );
        fake.set(Method::Get, "/api/analytics/sensor/B", 200, json!([]));

        let view = aggregator
            .aggregate(&workspace(1, "Home", &[(1, "A", "A"), (2, "B", "B")]))
            .await;

        let a = &view.samples[&1];
        assert_eq!(a.temperature, 23.0);
        assert_eq!(a.battery, Some(87.0));
        assert!(matches!(
            view.failures[0].error,
            ApiError::Invalid { ref message, .. } if message == "no data"
        ));
    }

    #[tokio::test]
    async fn prediction_enriches_but_never_fails_a_sensor() {
        let (fake, _, aggregator) = setup(true).await;
        fake.set(Method::Get, "/api/analytics/sensor/A", 200, analytics_json("A", 21.0, 40.0));
        fake.set(Method::Get, "/api/analytics/sensor/B", 200, analytics_json("B", 22.0, 41.0));
        fake.set(Method::Get, "/api/lstm/predict/A", 200, json!({ "prediction": [21.7, 22.1] }));
        fake.set(Method::Get, "/api/lstm/predict/B", 503, json!({}));

        let view = aggregator
            .aggregate(&workspace(1, "Home", &[(1, "A", "A"), (2, "B", "B")]))
            .await;

        assert_eq!(view.outcome(), ViewOutcome::Complete);
        assert_eq!(view.samples[&1].prediction, Some(21.7));
        assert_eq!(view.samples[&2].prediction, None);
    }

    #[tokio::test]
    async fn sensor_without_source_fails_without_request() {
        let (fake, _, aggregator) = setup(false).await;
        let mut ws = workspace(1, "Home", &[(1, "A", "A")]);
        ws.sensors[0].source_id = None;

        let view = aggregator.aggregate(&ws).await;
        assert_eq!(view.failures.len(), 1);
        assert!(fake.calls().iter().all(|c| !c.path.starts_with("/api/analytics")));
    }

    #[tokio::test]
    async fn late_pass_for_previous_workspace_is_discarded() {
        let (fake, _, aggregator) = setup(false).await;
        let first = workspace(1, "First", &[(1, "A", "A")]);
        let second = workspace(2, "Second", &[(2, "B", "B")]);
        fake.set(Method::Get, "/api/analytics/sensor/B", 200, analytics_json("B", 19.0, 50.0));

        let gate = fake.hold(Method::Get, "/api/analytics/sensor/A");
        aggregator.switch_to(Some(first));
        let earlier = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.refresh().await })
        };
        gate.started().await;

        aggregator.switch_to(Some(second));
        let later = aggregator.refresh().await.unwrap().unwrap();
        assert_eq!(later.workspace_id, 2);

        gate.release(200, analytics_json("A", 40.0, 10.0));
        assert_eq!(earlier.await.unwrap(), Err(ApiError::Cancelled));
        assert_eq!(aggregator.latest().unwrap().workspace_id, 2);
    }

    #[tokio::test]
    async fn refresh_without_workspace_is_a_no_op() {
        let (fake, _, aggregator) = setup(false).await;
        assert_eq!(aggregator.refresh().await, Ok(None));
        assert!(fake.calls().iter().all(|c| !c.path.starts_with("/api/analytics")));
    }

    #[tokio::test]
    async fn refresh_loop_follows_selection_and_stops_on_sign_out() {
        let (fake, session, aggregator) = setup(false).await;
        fake.set(Method::Get, "/api/analytics/sensor/A", 200, analytics_json("A", 21.0, 40.0));
        fake.set(Method::Get, "/api/analytics/sensor/B", 200, analytics_json("B", 22.0, 40.0));

        let (selection_tx, selection_rx) =
            watch::channel(Some(workspace(1, "First", &[(1, "A", "A")])));
        let handle = aggregator.spawn_refresh_loop(selection_rx, session.subscribe());

        let mut views = aggregator.subscribe();
        let wait = Duration::from_secs(2);
        tokio::time::timeout(wait, views.wait_for(|v| v.as_ref().is_some_and(|v| v.workspace_id == 1)))
            .await
            .unwrap()
            .unwrap();

        selection_tx.send_replace(Some(workspace(2, "Second", &[(2, "B", "B")])));
        tokio::time::timeout(wait, views.wait_for(|v| v.as_ref().is_some_and(|v| v.workspace_id == 2)))
            .await
            .unwrap()
            .unwrap();

        let before = fake.call_count(Method::Get, "/api/analytics/sensor/B");
        handle.refresh_now();
        for _ in 0..100 {
            if fake.call_count(Method::Get, "/api/analytics/sensor/B") > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fake.call_count(Method::Get, "/api/analytics/sensor/B") > before);

        session.sign_out().await.unwrap();
        tokio::time::timeout(wait, views.wait_for(|v| v.is_none()))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_finished());
    }
}
