//! Engine loop.
//!
//! The engine owns the sampler, the activity state machine and the
//! reconciler, and runs them on a single task. Everything that can change
//! state arrives through one FIFO queue:
//!
//! - poll ticks from a background interval task
//! - user commands from [`EngineHandle`]
//! - completions of remote calls
//!
//! Remote calls run on their own tasks so the loop keeps sampling while a
//! request is outstanding, but their results are queued like any other event.
//! No two reconciler mutations ever overlap and no locks are needed.
//!
//! # Example
//!
//! ```no_run
//! use kimai_autotrack::client::{KimaiClient, RetryPolicy};
//! use kimai_autotrack::config::Config;
//! use kimai_autotrack::engine::Engine;
//! use kimai_autotrack::sampler::CommandSampler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let sampler = CommandSampler::for_backend(config.idle_backend);
//!     let (engine, handle) = Engine::new(&config, sampler, |config: &Config| {
//!         KimaiClient::new(&config.base_url, &config.token, RetryPolicy::default())
//!     })?;
//!
//!     let task = tokio::spawn(engine.run());
//!     handle.start_monitoring().await?;
//!     handle.apply_override(7, 3).await?;
//!     handle.shutdown().await?;
//!     task.await??;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::activity::ActivityStateMachine;
use crate::client::{RemoteError, TimerApi};
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::reconciler::{
    Action, Command, Completion, Dispatch, Input, Reconciler, RemoteRequest, RemoteResult,
};
use crate::sampler::IdleSampler;
use crate::types::{ActivityId, Attribution, ErrorKind, Notification, ProjectId, Severity, Snapshot};

/// Capacity of the inbound event queue.
const EVENT_QUEUE_SIZE: usize = 256;

/// Capacity of the notification broadcast channel.
const NOTIFICATION_BUFFER: usize = 64;

/// How long shutdown waits for the remote timer to be stopped.
const SHUTDOWN_TIMEOUT_SECS: u64 = 20;

/// Builds a remote client from configuration; called at startup and on reload.
pub type Connector<C> = Box<dyn Fn(&Config) -> std::result::Result<C, RemoteError> + Send>;

/// Events processed by the engine loop, in arrival order.
#[derive(Debug)]
enum EngineEvent {
    Tick,
    Command(Command),
    Reload(Box<Config>),
    Completed(Completion),
    Shutdown,
}

/// Cloneable control surface for the GUI and notification layers.
///
/// All commands are safe to send in any state; they are applied in the order
/// they are sent.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    snapshots: watch::Receiver<Snapshot>,
    notifications: broadcast::Sender<Notification>,
}

impl EngineHandle {
    async fn send(&self, event: EngineEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TrackerError::EngineStopped)
    }

    /// Enables activity-driven tracking, adopting a timer that is already
    /// running remotely.
    pub async fn start_monitoring(&self) -> Result<()> {
        self.send(EngineEvent::Command(Command::StartMonitoring)).await
    }

    /// Stops the current timer (if any) and disables activity-driven starts.
    pub async fn stop_monitoring(&self) -> Result<()> {
        self.send(EngineEvent::Command(Command::StopMonitoring)).await
    }

    /// Sets the project/activity used for the next timer.
    pub async fn set_default(&self, project: ProjectId, activity: ActivityId) -> Result<()> {
        self.send(EngineEvent::Command(Command::SetDefault(Attribution::new(
            project, activity,
        ))))
        .await
    }

    /// Moves the running timer to a new project/activity, or sets the default
    /// if nothing is running.
    pub async fn apply_override(&self, project: ProjectId, activity: ActivityId) -> Result<()> {
        self.send(EngineEvent::Command(Command::Override(Attribution::new(
            project, activity,
        ))))
        .await
    }

    /// Applies a saved configuration without restarting.
    pub async fn reload(&self, config: Config) -> Result<()> {
        self.send(EngineEvent::Reload(Box::new(config))).await
    }

    /// Stops tracking and ends the engine loop once nothing is left running.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineEvent::Shutdown).await
    }

    /// The most recently published state.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Subscribes to engine notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

/// The polling and synchronization loop.
pub struct Engine<C, S> {
    client: Arc<C>,
    connect: Connector<C>,
    sampler: S,
    machine: ActivityStateMachine,
    reconciler: Reconciler,
    poll_interval: Duration,
    sensor_error: Option<String>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    snapshot_tx: watch::Sender<Snapshot>,
    notify_tx: broadcast::Sender<Notification>,
    ticker: Option<JoinHandle<()>>,
}

impl<C, S> Engine<C, S>
where
    C: TimerApi,
    S: IdleSampler,
{
    /// Creates an engine and its control handle.
    ///
    /// Monitoring starts disabled; call [`EngineHandle::start_monitoring`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or `connect` fails.
    pub fn new<F>(config: &Config, sampler: S, connect: F) -> Result<(Self, EngineHandle)>
    where
        F: Fn(&Config) -> std::result::Result<C, RemoteError> + Send + 'static,
    {
        config.validate()?;
        let client = connect(config)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let reconciler = Reconciler::new(config.defaults());
        let (snapshot_tx, snapshot_rx) = watch::channel(reconciler.snapshot());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);

        let handle = EngineHandle {
            events: events_tx.clone(),
            snapshots: snapshot_rx,
            notifications: notify_tx.clone(),
        };

        let engine = Self {
            client: Arc::new(client),
            connect: Box::new(connect),
            sampler,
            machine: ActivityStateMachine::new(config.idle_timeout()),
            reconciler,
            poll_interval: config.poll_interval(),
            sensor_error: None,
            events_tx,
            events_rx,
            snapshot_tx,
            notify_tx,
            ticker: None,
        };

        Ok((engine, handle))
    }

    /// Runs until [`EngineHandle::shutdown`] is called.
    pub async fn run(mut self) -> Result<()> {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            idle_timeout_secs = self.machine.idle_timeout().as_secs(),
            "Engine started"
        );
        self.restart_ticker();
        self.publish();

        while let Some(event) = self.events_rx.recv().await {
            match event {
                EngineEvent::Tick => self.on_tick().await,
                EngineEvent::Command(command) => self.apply(Input::Command(command)),
                EngineEvent::Completed(completion) => self.apply(Input::Completed(completion)),
                EngineEvent::Reload(config) => self.reload(*config),
                EngineEvent::Shutdown => {
                    self.drain().await;
                    break;
                }
            }
        }

        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        info!("Engine stopped");
        Ok(())
    }

    /// One poll: sample, evaluate, feed the reconciler.
    async fn on_tick(&mut self) {
        let sample = self.sampler.sample().await;
        self.track_sensor(sample.as_ref().err().map(ToString::to_string));

        if let Some(transition) = self.machine.observe(sample, Utc::now()) {
            self.apply(Input::Activity(transition));
        }
        self.apply(Input::Tick);
    }

    /// Reports a sensor outage once, and its recovery.
    fn track_sensor(&mut self, failure: Option<String>) {
        match (failure, self.sensor_error.is_some()) {
            (Some(message), false) => {
                warn!(error = %message, "Idle sensor unavailable, holding activity state");
                let _ = self.notify_tx.send(Notification::Error {
                    kind: ErrorKind::SensorUnavailable,
                    severity: Severity::Warning,
                    message: message.clone(),
                });
                self.sensor_error = Some(message);
            }
            (None, true) => {
                info!("Idle sensor recovered");
                self.sensor_error = None;
            }
            _ => {}
        }
    }

    fn apply(&mut self, input: Input) {
        for action in self.reconciler.handle(input, Utc::now()) {
            match action {
                Action::Remote(dispatch) => self.dispatch(dispatch),
                Action::Notify(notification) => {
                    debug!(?notification, "Publishing notification");
                    // No subscribers is fine.
                    let _ = self.notify_tx.send(notification);
                }
            }
        }
        self.publish();
    }

    /// Runs a remote request on its own task, queueing the result.
    fn dispatch(&self, dispatch: Dispatch) {
        debug!(op = dispatch.op, request = ?dispatch.request, "Dispatching remote request");
        let client = Arc::clone(&self.client);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let result = match dispatch.request {
                RemoteRequest::FetchActive => RemoteResult::Active(client.active_timer().await),
                RemoteRequest::Start(attribution) => {
                    RemoteResult::Started(client.start_timer(attribution).await)
                }
                RemoteRequest::Stop(timer_id) => RemoteResult::Stopped(client.stop_timer(timer_id).await),
                RemoteRequest::Update {
                    timer_id,
                    attribution,
                } => RemoteResult::Updated(client.update_timer(timer_id, attribution).await),
            };

            let completion = Completion {
                op: dispatch.op,
                result,
            };
            if events.send(EngineEvent::Completed(completion)).await.is_err() {
                warn!(op = dispatch.op, "Engine gone before remote call completed");
            }
        });
    }

    fn publish(&self) {
        let mut snapshot = self.reconciler.snapshot();
        if snapshot.last_error.is_none() {
            snapshot.last_error.clone_from(&self.sensor_error);
        }
        self.snapshot_tx.send_replace(snapshot);
    }

    fn reload(&mut self, config: Config) {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Ignoring invalid configuration");
            let _ = self.notify_tx.send(Notification::Error {
                kind: ErrorKind::Rejected,
                severity: Severity::Error,
                message: e.to_string(),
            });
            return;
        }

        match (self.connect)(&config) {
            Ok(client) => self.client = Arc::new(client),
            Err(e) => {
                warn!(error = %e, "Could not rebuild client, keeping previous credentials");
                let _ = self.notify_tx.send(Notification::Error {
                    kind: ErrorKind::Auth,
                    severity: Severity::Error,
                    message: e.to_string(),
                });
            }
        }

        self.machine.set_idle_timeout(config.idle_timeout());
        self.reconciler.replace_defaults(config.defaults());

        if config.poll_interval() != self.poll_interval {
            self.poll_interval = config.poll_interval();
            self.restart_ticker();
        }

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            idle_timeout_secs = config.idle_timeout_seconds,
            "Configuration reloaded"
        );
        self.publish();
    }

    fn restart_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }

        let events = self.events_tx.clone();
        let period = self.poll_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if events.send(EngineEvent::Tick).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Disables monitoring and waits for the remote timer to be stopped.
    async fn drain(&mut self) {
        info!("Shutting down, stopping any running timer");
        self.apply(Input::Command(Command::StopMonitoring));

        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        while !self.reconciler.is_settled() {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(EngineEvent::Completed(completion))) => {
                    self.apply(Input::Completed(completion));
                }
                Ok(Some(EngineEvent::Tick)) => self.apply(Input::Tick),
                Ok(Some(event)) => debug!(?event, "Ignoring event during shutdown"),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if let Some(session) = self.reconciler.session() {
            error!(
                timer_id = ?session.remote_id,
                attribution = %session.attribution,
                "Timer may still be running after shutdown"
            );
        }
    }
}
