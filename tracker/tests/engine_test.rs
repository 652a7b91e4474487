//! Integration tests for the engine loop.
//!
//! These tests drive the full engine (ticker, sampler, state machine,
//! reconciler, remote dispatch) against an in-memory Kimai with tokio's clock
//! paused, so hours of polling run instantly and deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kimai_autotrack::client::{RemoteError, StopOutcome, TimerApi};
use kimai_autotrack::config::Config;
use kimai_autotrack::engine::{Engine, EngineHandle};
use kimai_autotrack::sampler::{IdleSampler, SensorError};
use kimai_autotrack::types::{Attribution, Notification, RemoteTimer, TimerId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const DEFAULT: Attribution = Attribution {
    project: 1,
    activity: 1,
};
const OTHER: Attribution = Attribution {
    project: 7,
    activity: 3,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// A remote call as observed by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Active,
    Start(Attribution),
    Stop(TimerId),
    Update(TimerId, Attribution),
}

#[derive(Debug, Default)]
struct MockState {
    timers: Vec<RemoteTimer>,
    next_id: TimerId,
    lose_next_start: bool,
}

/// In-memory Kimai that records every call.
#[derive(Debug, Clone)]
struct MockKimai {
    state: Arc<Mutex<MockState>>,
    calls: mpsc::UnboundedSender<Call>,
    start_delay: Duration,
}

impl MockKimai {
    fn new() -> (Self, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let mock = Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            })),
            calls,
            start_delay: Duration::ZERO,
        };
        (mock, rx)
    }

    fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Seeds a timer that is already running when the engine starts.
    fn seed_running(&self, attribution: Attribution) -> TimerId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.push(RemoteTimer {
            id,
            project: attribution.project,
            activity: attribution.activity,
            begin: Some("2024-03-01T08:00:00+0000".to_string()),
            end: None,
        });
        id
    }

    /// The next start is recorded remotely but reported as a network failure.
    fn lose_next_start(&self) {
        self.state.lock().unwrap().lose_next_start = true;
    }

    fn running(&self) -> Vec<RemoteTimer> {
        self.state
            .lock()
            .unwrap()
            .timers
            .iter()
            .filter(|t| t.is_running())
            .cloned()
            .collect()
    }

    fn record(&self, call: Call) {
        let _ = self.calls.send(call);
    }
}

impl TimerApi for MockKimai {
    async fn active_timer(&self) -> Result<Option<RemoteTimer>, RemoteError> {
        self.record(Call::Active);
        Ok(self.running().into_iter().next())
    }

    async fn start_timer(&self, attribution: Attribution) -> Result<RemoteTimer, RemoteError> {
        self.record(Call::Start(attribution));
        if !self.start_delay.is_zero() {
            sleep(self.start_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let timer = RemoteTimer {
            id,
            project: attribution.project,
            activity: attribution.activity,
            begin: None,
            end: None,
        };
        state.timers.push(timer.clone());

        if std::mem::take(&mut state.lose_next_start) {
            return Err(RemoteError::Transient {
                attempts: 5,
                message: "connection reset".to_string(),
            });
        }
        Ok(timer)
    }

    async fn stop_timer(&self, id: TimerId) -> Result<StopOutcome, RemoteError> {
        self.record(Call::Stop(id));
        let mut state = self.state.lock().unwrap();
        match state.timers.iter_mut().find(|t| t.id == id && t.is_running()) {
            Some(timer) => {
                timer.end = Some("now".to_string());
                Ok(StopOutcome::Stopped)
            }
            None => Ok(StopOutcome::AlreadyStopped),
        }
    }

    async fn update_timer(&self, id: TimerId, attribution: Attribution) -> Result<RemoteTimer, RemoteError> {
        self.record(Call::Update(id, attribution));
        let mut state = self.state.lock().unwrap();
        let timer = state
            .timers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RemoteError::Rejected {
                status: 404,
                message: "not found".to_string(),
            })?;
        timer.project = attribution.project;
        timer.activity = attribution.activity;
        Ok(timer.clone())
    }
}

/// Reports idle time as a function of time since the test started.
struct ScriptedSampler {
    started: Instant,
    script: Box<dyn FnMut(Duration) -> Result<Duration, SensorError> + Send>,
}

impl ScriptedSampler {
    fn new(script: impl FnMut(Duration) -> Result<Duration, SensorError> + Send + 'static) -> Self {
        Self {
            started: Instant::now(),
            script: Box::new(script),
        }
    }

    /// A user who never stops typing.
    fn always_active() -> Self {
        Self::new(|_| Ok(Duration::ZERO))
    }
}

impl IdleSampler for ScriptedSampler {
    async fn sample(&mut self) -> Result<Duration, SensorError> {
        let elapsed = self.started.elapsed();
        (self.script)(elapsed)
    }
}

fn test_config() -> Config {
    Config {
        base_url: "http://kimai.test".to_string(),
        token: "token".to_string(),
        idle_timeout_seconds: 600,
        poll_interval_seconds: 15,
        default_project_id: Some(DEFAULT.project),
        default_activity_id: Some(DEFAULT.activity),
        ..Config::default()
    }
}

struct Harness {
    handle: EngineHandle,
    notifications: broadcast::Receiver<Notification>,
    task: JoinHandle<kimai_autotrack::Result<()>>,
}

fn spawn_engine(config: &Config, sampler: ScriptedSampler, mock: &MockKimai) -> Harness {
    let client = mock.clone();
    let (engine, handle) =
        Engine::new(config, sampler, move |_: &Config| Ok(client.clone())).expect("engine");
    let notifications = handle.subscribe();
    let task = tokio::spawn(engine.run());
    Harness {
        handle,
        notifications,
        task,
    }
}

/// Waits for a notification matching `predicate`, failing after an hour of
/// simulated time.
async fn wait_for<F>(rx: &mut broadcast::Receiver<Notification>, predicate: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    timeout(Duration::from_secs(3600), async {
        loop {
            match rx.recv().await {
                Ok(notification) if predicate(&notification) => return notification,
                Ok(_) => {}
                Err(e) => panic!("notification stream ended: {e}"),
            }
        }
    })
    .await
    .expect("notification did not arrive")
}

/// Waits for the next call matching `predicate`, collecting everything seen.
async fn wait_for_call<F>(calls: &mut mpsc::UnboundedReceiver<Call>, seen: &mut Vec<Call>, predicate: F)
where
    F: Fn(&Call) -> bool,
{
    timeout(Duration::from_secs(3600), async {
        loop {
            let call = calls.recv().await.expect("mock dropped");
            let done = predicate(&call);
            seen.push(call);
            if done {
                return;
            }
        }
    })
    .await
    .expect("call did not arrive");
}

fn drain_calls(calls: &mut mpsc::UnboundedReceiver<Call>, seen: &mut Vec<Call>) {
    while let Ok(call) = calls.try_recv() {
        seen.push(call);
    }
}

// =============================================================================
// Scenarios
// =============================================================================

/// Idle for ten minutes stops the timer once, returning starts it once, and an
/// override that arrives while the start is still pending is applied right
/// after the start confirms.
#[tokio::test(start_paused = true)]
async fn test_idle_resume_and_override_during_pending_start() {
    let (mock, mut calls) = MockKimai::new();
    let mock = mock.with_start_delay(Duration::from_secs(10));
    let adopted = mock.seed_running(DEFAULT);

    // Last input at t=0; the user is back at t=700s.
    let sampler = ScriptedSampler::new(|elapsed| {
        if elapsed < Duration::from_secs(700) {
            Ok(elapsed)
        } else {
            Ok(Duration::ZERO)
        }
    });
    let mut harness = spawn_engine(&test_config(), sampler, &mock);
    harness.handle.start_monitoring().await.unwrap();

    let mut seen = Vec::new();
    wait_for_call(&mut calls, &mut seen, |c| matches!(c, Call::Start(_))).await;
    assert_eq!(seen, [Call::Active, Call::Stop(adopted), Call::Start(DEFAULT)]);

    sleep(Duration::from_secs(5)).await;
    harness.handle.apply_override(OTHER.project, OTHER.activity).await.unwrap();

    wait_for_call(&mut calls, &mut seen, |c| matches!(c, Call::Update(..))).await;
    let resumed = adopted + 1;
    assert_eq!(seen.last(), Some(&Call::Update(resumed, OTHER)));

    // Nothing else happens while the user keeps working.
    sleep(Duration::from_secs(300)).await;
    drain_calls(&mut calls, &mut seen);
    assert_eq!(
        seen,
        [
            Call::Active,
            Call::Stop(adopted),
            Call::Start(DEFAULT),
            Call::Update(resumed, OTHER),
        ]
    );

    let running = mock.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].attribution(), OTHER);

    let snapshot = harness.handle.snapshot();
    let session = snapshot.session.expect("session");
    assert_eq!(session.remote_id, Some(resumed));
    assert_eq!(session.attribution, OTHER);
    assert_eq!(snapshot.defaults, Some(OTHER));

    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionSwitched { to, .. } if *to == OTHER)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_adopts_running_timer_without_starting() {
    let (mock, mut calls) = MockKimai::new();
    let existing = Attribution::new(5, 2);
    let id = mock.seed_running(existing);

    let mut harness = spawn_engine(&test_config(), ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();

    let adopted = wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionAdopted { .. })
    })
    .await;
    assert_eq!(
        adopted,
        Notification::SessionAdopted {
            timer_id: id,
            attribution: existing,
        }
    );

    sleep(Duration::from_secs(120)).await;
    let mut seen = Vec::new();
    drain_calls(&mut calls, &mut seen);
    assert_eq!(seen, [Call::Active]);

    let session = harness.handle.snapshot().session.expect("session");
    assert_eq!(session.remote_id, Some(id));
    assert_eq!(session.attribution, existing);
    assert_eq!(mock.running().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_monitoring_twice_stops_once() {
    let (mock, mut calls) = MockKimai::new();

    let mut harness = spawn_engine(&test_config(), ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();
    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStarted { .. })
    })
    .await;

    harness.handle.stop_monitoring().await.unwrap();
    harness.handle.stop_monitoring().await.unwrap();
    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStopped { .. })
    })
    .await;

    sleep(Duration::from_secs(120)).await;
    let mut seen = Vec::new();
    drain_calls(&mut calls, &mut seen);
    let stops = seen.iter().filter(|c| matches!(c, Call::Stop(_))).count();
    assert_eq!(stops, 1);
    assert!(mock.running().is_empty());
    assert!(!harness.handle.snapshot().monitoring);
}

#[tokio::test(start_paused = true)]
async fn test_lost_start_response_is_adopted_not_duplicated() {
    let (mock, mut calls) = MockKimai::new();
    mock.lose_next_start();

    let mut harness = spawn_engine(&test_config(), ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();

    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionAdopted { .. })
    })
    .await;

    sleep(Duration::from_secs(120)).await;
    let mut seen = Vec::new();
    drain_calls(&mut calls, &mut seen);
    assert_eq!(seen, [Call::Active, Call::Start(DEFAULT), Call::Active]);
    assert_eq!(mock.running().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sensor_outage_keeps_timer_running() {
    let (mock, mut calls) = MockKimai::new();

    // Sensor works briefly, then the session bus goes away.
    let sampler = ScriptedSampler::new(|elapsed| {
        if elapsed < Duration::from_secs(30) {
            Ok(Duration::ZERO)
        } else {
            Err(SensorError::Unavailable("session bus gone".to_string()))
        }
    });
    let mut harness = spawn_engine(&test_config(), sampler, &mock);
    harness.handle.start_monitoring().await.unwrap();

    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStarted { .. })
    })
    .await;

    // Well past the idle timeout with no readings at all.
    sleep(Duration::from_secs(1800)).await;
    let mut seen = Vec::new();
    drain_calls(&mut calls, &mut seen);
    assert!(!seen.iter().any(|c| matches!(c, Call::Stop(_))));
    assert_eq!(mock.running().len(), 1);
    assert!(harness.handle.snapshot().last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reload_applies_new_defaults() {
    let (mock, mut calls) = MockKimai::new();
    let config = Config {
        default_project_id: None,
        default_activity_id: None,
        ..test_config()
    };

    let mut harness = spawn_engine(&config, ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();

    sleep(Duration::from_secs(120)).await;
    let mut seen = Vec::new();
    drain_calls(&mut calls, &mut seen);
    assert_eq!(seen, [Call::Active], "no defaults means no start");

    let reloaded = Config {
        default_project_id: Some(OTHER.project),
        default_activity_id: Some(OTHER.activity),
        poll_interval_seconds: 5,
        ..test_config()
    };
    harness.handle.reload(reloaded).await.unwrap();

    let started = wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStarted { .. })
    })
    .await;
    assert_eq!(started, Notification::SessionStarted { attribution: OTHER });
}

#[tokio::test(start_paused = true)]
async fn test_stored_defaults_apply_after_reload_from_file() {
    let (mock, _calls) = MockKimai::new();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    let config = Config {
        default_project_id: None,
        default_activity_id: None,
        ..test_config()
    };
    config.save(&path).unwrap();

    let mut harness = spawn_engine(&config, ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();
    sleep(Duration::from_secs(60)).await;
    assert!(mock.running().is_empty());

    Config::store_defaults(&path, OTHER).unwrap();
    let reloaded = Config::from_file(&path).unwrap();
    harness.handle.reload(reloaded).await.unwrap();

    let started = wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStarted { .. })
    })
    .await;
    assert_eq!(started, Notification::SessionStarted { attribution: OTHER });
    assert_eq!(harness.handle.snapshot().defaults, Some(OTHER));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_running_timer() {
    let (mock, _calls) = MockKimai::new();

    let mut harness = spawn_engine(&test_config(), ScriptedSampler::always_active(), &mock);
    harness.handle.start_monitoring().await.unwrap();
    wait_for(&mut harness.notifications, |n| {
        matches!(n, Notification::SessionStarted { .. })
    })
    .await;
    assert_eq!(mock.running().len(), 1);

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap().unwrap();

    assert!(mock.running().is_empty());
    assert!(harness.handle.start_monitoring().await.is_err());
}
