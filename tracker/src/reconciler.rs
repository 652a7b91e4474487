//! Session reconciliation.
//!
//! The reconciler keeps the single remote Kimai timer in line with what the
//! user is doing. It performs no I/O itself: every input (poll tick, activity
//! transition, user command, completion of a remote call) is fed to
//! [`Reconciler::handle`], which returns the remote requests to dispatch and
//! the notifications to publish. The engine executes the requests and feeds
//! their results back as [`Input::Completed`].
//!
//! # Model
//!
//! The reconciler compares *desired* state against *actual* state after every
//! input:
//!
//! - Desired: a timer runs iff monitoring is enabled and the user is active;
//!   it is attributed to the most recent override (or the default).
//! - Actual: the [`Session`], confirmed by the server.
//!
//! At most one remote request is outstanding at a time. While one is in
//! flight, further inputs only update desired state; when the request
//! completes, the next step toward desired state is issued. A stop requested
//! while a start is in flight therefore waits for the start and then
//! compensates immediately, and an override that arrives during a start is
//! applied as soon as the start is confirmed.
//!
//! Any failed request holds further remote work until the next poll tick.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::client::{RemoteError, StopOutcome};
use crate::types::{
    ActivityState, Attribution, ErrorKind, Notification, RemoteTimer, Session, Severity, Snapshot,
    TimerId, Transition,
};

/// Start failures tolerated quietly before the user is told.
pub const MAX_QUIET_START_FAILURES: u32 = 3;

/// Identifier correlating a dispatched request with its completion.
pub type OpId = u64;

/// A remote operation the engine should perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    /// Query the server for an already running timer.
    FetchActive,
    Start(Attribution),
    Stop(TimerId),
    Update {
        timer_id: TimerId,
        attribution: Attribution,
    },
}

/// A request tagged with its operation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub op: OpId,
    pub request: RemoteRequest,
}

/// Result of a remote operation, matching the request variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResult {
    Active(Result<Option<RemoteTimer>, RemoteError>),
    Started(Result<RemoteTimer, RemoteError>),
    Stopped(Result<StopOutcome, RemoteError>),
    Updated(Result<RemoteTimer, RemoteError>),
}

/// Completion of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub op: OpId,
    pub result: RemoteResult,
}

/// User-originated control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartMonitoring,
    StopMonitoring,
    /// Changes the attribution used for the next session only.
    SetDefault(Attribution),
    /// Moves the current session (if any) and becomes the new default.
    Override(Attribution),
}

/// Everything the reconciler reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Tick,
    Activity(Transition),
    Command(Command),
    Completed(Completion),
}

/// Output of a reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Remote(Dispatch),
    Notify(Notification),
}

/// What an in-flight operation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    /// Startup adoption of a timer started elsewhere.
    Adopt,
    /// Check whether a timer whose stop was rejected is still running.
    VerifyStop(TimerId),
    Start,
    Stop,
    /// Move the running timer to the session target.
    Switch,
    /// Re-attribute a timer that was stopped while an override was pending.
    Retag(Attribution),
}

/// A start that may have landed even though its response was lost.
#[derive(Debug, Clone, Copy)]
struct UncertainStart {
    attempted: Attribution,
    /// Where the timer should end up if it is found running.
    target: Attribution,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    op: OpId,
    purpose: Purpose,
}

/// Maps activity and user intent onto remote timer operations.
#[derive(Debug)]
pub struct Reconciler {
    monitoring: bool,
    activity: ActivityState,
    defaults: Option<Attribution>,
    session: Option<Session>,
    in_flight: Option<InFlight>,
    next_op: OpId,

    /// Query the server before the next start.
    needs_adoption: bool,
    uncertain_start: Option<UncertainStart>,
    /// Stop was rejected; confirm remote state before retrying.
    verify_stop: bool,
    /// A stopped timer that still has to be moved to an override target.
    retag: Option<(TimerId, Attribution)>,
    /// Remote work waits for the next poll tick after a failure.
    hold_until_tick: bool,
    /// The server rejected the default attribution; wait for a new one.
    start_blocked: bool,
    start_failures: u32,
    missing_defaults_warned: bool,
    last_error: Option<String>,
}

impl Reconciler {
    /// Creates a reconciler with monitoring disabled and the user active.
    #[must_use]
    pub fn new(defaults: Option<Attribution>) -> Self {
        Self {
            monitoring: false,
            activity: ActivityState::Active,
            defaults,
            session: None,
            in_flight: None,
            next_op: 1,
            needs_adoption: true,
            uncertain_start: None,
            verify_stop: false,
            retag: None,
            hold_until_tick: false,
            start_blocked: false,
            start_failures: 0,
            missing_defaults_warned: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    #[must_use]
    pub fn defaults(&self) -> Option<Attribution> {
        self.defaults
    }

    #[must_use]
    pub fn activity(&self) -> ActivityState {
        self.activity
    }

    /// True while a remote operation is outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True when nothing is running remotely and nothing is pending.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.session.is_none()
            && self.in_flight.is_none()
            && self.retag.is_none()
            && self.uncertain_start.is_none()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            monitoring: self.monitoring,
            activity: self.activity,
            session: self.session.clone(),
            defaults: self.defaults,
            last_error: self.last_error.clone(),
        }
    }

    /// Replaces the defaults from a reloaded configuration.
    ///
    /// The running session keeps its attribution.
    pub fn replace_defaults(&mut self, defaults: Option<Attribution>) {
        if self.defaults != defaults {
            info!(?defaults, "Default attribution replaced");
            self.defaults = defaults;
            self.start_blocked = false;
            self.missing_defaults_warned = false;
        }
    }

    /// Processes one input and returns the resulting actions.
    pub fn handle(&mut self, input: Input, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();

        match input {
            Input::Tick => {
                self.hold_until_tick = false;
            }
            Input::Activity(transition) => {
                info!(from = %transition.from, to = %transition.to, "Activity transition");
                self.activity = transition.to;
                if transition.to == ActivityState::Active {
                    self.missing_defaults_warned = false;
                }
            }
            Input::Command(command) => self.apply_command(command, &mut actions),
            Input::Completed(completion) => self.complete(completion, now, &mut actions),
        }

        self.drive(now, &mut actions);
        actions
    }

    fn apply_command(&mut self, command: Command, actions: &mut Vec<Action>) {
        match command {
            Command::StartMonitoring => {
                if self.monitoring {
                    debug!("Monitoring already enabled");
                    return;
                }
                info!("Monitoring enabled");
                self.monitoring = true;
                self.needs_adoption = true;
                self.start_blocked = false;
                self.start_failures = 0;
                self.hold_until_tick = false;
                actions.push(Action::Notify(Notification::MonitoringChanged { enabled: true }));
            }
            Command::StopMonitoring => {
                if !self.monitoring {
                    debug!("Monitoring already disabled");
                    return;
                }
                info!("Monitoring disabled");
                self.monitoring = false;
                self.hold_until_tick = false;
                actions.push(Action::Notify(Notification::MonitoringChanged { enabled: false }));
            }
            Command::SetDefault(attribution) => {
                info!(%attribution, "Default attribution set");
                self.replace_defaults(Some(attribution));
            }
            Command::Override(attribution) => {
                info!(%attribution, "Override requested");
                self.replace_defaults(Some(attribution));
                if let Some(session) = self.session.as_mut() {
                    session.target = attribution;
                }
                if let Some(uncertain) = self.uncertain_start.as_mut() {
                    uncertain.target = attribution;
                }
            }
        }
    }

    /// Issues the next remote operation needed to reach desired state.
    fn drive(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        if self.in_flight.is_some() || self.hold_until_tick {
            return;
        }

        if let Some((timer_id, attribution)) = self.retag {
            self.dispatch(
                Purpose::Retag(attribution),
                RemoteRequest::Update {
                    timer_id,
                    attribution,
                },
                actions,
            );
            return;
        }

        let want_running = self.monitoring && self.activity == ActivityState::Active;

        if let Some(session) = self.session.as_mut() {
            let Some(timer_id) = session.remote_id else {
                // Only a start in flight leaves a session unconfirmed.
                warn!("Dropping unconfirmed session with nothing in flight");
                self.session = None;
                return;
            };

            if self.verify_stop {
                self.dispatch(Purpose::VerifyStop(timer_id), RemoteRequest::FetchActive, actions);
            } else if !want_running {
                info!(timer_id, "Stopping timer");
                session.pending = true;
                self.dispatch(Purpose::Stop, RemoteRequest::Stop(timer_id), actions);
            } else if session.target != session.attribution {
                info!(timer_id, from = %session.attribution, to = %session.target, "Switching timer");
                let attribution = session.target;
                session.pending = true;
                self.dispatch(
                    Purpose::Switch,
                    RemoteRequest::Update {
                        timer_id,
                        attribution,
                    },
                    actions,
                );
            }
            return;
        }

        if self.needs_adoption && (self.monitoring || self.uncertain_start.is_some()) {
            debug!("Checking for an already running timer");
            self.dispatch(Purpose::Adopt, RemoteRequest::FetchActive, actions);
            return;
        }

        if !want_running || self.start_blocked {
            return;
        }

        let Some(attribution) = self.defaults else {
            if !self.missing_defaults_warned {
                warn!("No default project/activity configured, not starting a timer");
                self.missing_defaults_warned = true;
            }
            return;
        };

        info!(%attribution, "Starting timer");
        self.session = Some(Session {
            remote_id: None,
            attribution,
            target: attribution,
            started_at: now,
            pending: true,
        });
        self.dispatch(Purpose::Start, RemoteRequest::Start(attribution), actions);
    }

    fn dispatch(&mut self, purpose: Purpose, request: RemoteRequest, actions: &mut Vec<Action>) {
        let op = self.next_op;
        self.next_op += 1;
        self.in_flight = Some(InFlight { op, purpose });
        actions.push(Action::Remote(Dispatch { op, request }));
    }

    fn complete(&mut self, completion: Completion, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let Some(in_flight) = self.in_flight else {
            warn!(op = completion.op, "Completion with nothing in flight, ignoring");
            return;
        };
        if in_flight.op != completion.op {
            warn!(
                op = completion.op,
                expected = in_flight.op,
                "Completion for unknown operation, ignoring"
            );
            return;
        }
        self.in_flight = None;

        match (in_flight.purpose, completion.result) {
            (Purpose::Adopt, RemoteResult::Active(result)) => self.on_adopt(result, now, actions),
            (Purpose::VerifyStop(timer_id), RemoteResult::Active(result)) => {
                self.on_verify_stop(timer_id, result, now, actions);
            }
            (Purpose::Start, RemoteResult::Started(result)) => self.on_started(result, actions),
            (Purpose::Stop, RemoteResult::Stopped(result)) => self.on_stopped(result, now, actions),
            (Purpose::Switch, RemoteResult::Updated(result)) => self.on_switched(result, actions),
            (Purpose::Retag(attribution), RemoteResult::Updated(result)) => {
                self.on_retagged(attribution, result);
            }
            (purpose, result) => {
                error!(?purpose, ?result, "Completion does not match operation");
            }
        }
    }

    fn on_adopt(
        &mut self,
        result: Result<Option<RemoteTimer>, RemoteError>,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        match result {
            Ok(Some(timer)) => {
                self.needs_adoption = false;
                self.last_error = None;
                // With monitoring off, only reclaim a timer this engine may have started.
                let ours = self
                    .uncertain_start
                    .take()
                    .filter(|u| u.attempted == timer.attribution());
                if self.session.is_some() || !(self.monitoring || ours.is_some()) {
                    debug!(timer_id = timer.id, "Not adopting, monitoring changed meanwhile");
                    return;
                }
                let target = ours.map_or(timer.attribution(), |u| u.target);
                self.adopt(timer, target, now, actions);
            }
            Ok(None) => {
                self.needs_adoption = false;
                self.uncertain_start = None;
                self.last_error = None;
                debug!("No running timer on the server");
            }
            Err(e) => self.fail(e, "check for running timer", Severity::Warning, actions),
        }
    }

    fn adopt(
        &mut self,
        timer: RemoteTimer,
        target: Attribution,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let attribution = timer.attribution();
        info!(timer_id = timer.id, %attribution, %target, "Adopting running timer");
        self.session = Some(Session {
            remote_id: Some(timer.id),
            attribution,
            target,
            started_at: timer.begin_at().unwrap_or(now),
            pending: false,
        });
        actions.push(Action::Notify(Notification::SessionAdopted {
            timer_id: timer.id,
            attribution,
        }));
    }

    fn on_verify_stop(
        &mut self,
        timer_id: TimerId,
        result: Result<Option<RemoteTimer>, RemoteError>,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let active = match result {
            Ok(active) => active,
            Err(e) => {
                self.fail(e, "verify stopped timer", Severity::Critical, actions);
                return;
            }
        };
        self.verify_stop = false;

        if active.as_ref().map(|t| t.id) == Some(timer_id) {
            warn!(timer_id, "Timer is still running remotely, will retry stop");
            self.hold_until_tick = true;
            return;
        }

        info!(timer_id, "Timer is no longer running remotely");
        self.finish_session(now, actions);
        if let Some(other) = active {
            if self.monitoring {
                let target = other.attribution();
                self.adopt(other, target, now, actions);
            }
        }
    }

    fn on_started(&mut self, result: Result<RemoteTimer, RemoteError>, actions: &mut Vec<Action>) {
        match result {
            Ok(timer) => {
                self.start_failures = 0;
                self.last_error = None;
                let Some(session) = self.session.as_mut() else {
                    error!(timer_id = timer.id, "Start confirmed without a session");
                    return;
                };
                session.remote_id = Some(timer.id);
                session.attribution = timer.attribution();
                session.pending = false;
                info!(timer_id = timer.id, attribution = %session.attribution, "Timer confirmed");
                actions.push(Action::Notify(Notification::SessionStarted {
                    attribution: session.attribution,
                }));
            }
            Err(e) => {
                // Nothing was confirmed remotely, so the session can go.
                let attempted = self.session.take().map(|s| UncertainStart {
                    attempted: s.attribution,
                    target: s.target,
                });
                match e {
                    RemoteError::Rejected { .. } => {
                        self.start_blocked = true;
                        self.fail(e, "start timer", Severity::Error, actions);
                    }
                    e if e.is_transient() => {
                        self.start_failures += 1;
                        // The start may have landed even though the response did not.
                        self.needs_adoption = true;
                        self.uncertain_start = attempted;
                        let severity = if self.start_failures >= MAX_QUIET_START_FAILURES {
                            Some(Severity::Warning)
                        } else {
                            None
                        };
                        match severity {
                            Some(severity) => self.fail(e, "start timer", severity, actions),
                            None => {
                                debug!(failures = self.start_failures, error = %e, "Start failed, retrying next tick");
                                self.last_error = Some(format!("failed to start timer: {e}"));
                                self.hold_until_tick = true;
                            }
                        }
                    }
                    e => self.fail(e, "start timer", Severity::Error, actions),
                }
            }
        }
    }

    fn on_stopped(
        &mut self,
        result: Result<StopOutcome, RemoteError>,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        match result {
            Ok(outcome) => {
                self.last_error = None;
                debug!(?outcome, "Stop confirmed");
                if let Some(session) = self.session.as_ref() {
                    if session.target != session.attribution {
                        if let Some(timer_id) = session.remote_id {
                            self.retag = Some((timer_id, session.target));
                        }
                    }
                }
                self.finish_session(now, actions);
            }
            Err(e) => {
                if let Some(session) = self.session.as_mut() {
                    session.pending = false;
                }
                if matches!(e, RemoteError::Rejected { .. }) {
                    self.verify_stop = true;
                }
                self.fail(e, "stop timer (it may still be running)", Severity::Critical, actions);
            }
        }
    }

    fn on_switched(&mut self, result: Result<RemoteTimer, RemoteError>, actions: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            error!("Switch completed without a session");
            return;
        };
        session.pending = false;

        match result {
            Ok(timer) => {
                let from = session.attribution;
                session.remote_id = Some(timer.id);
                session.attribution = timer.attribution();
                let to = session.attribution;
                self.last_error = None;
                info!(timer_id = timer.id, %from, %to, "Timer switched");
                actions.push(Action::Notify(Notification::SessionSwitched { from, to }));
            }
            Err(RemoteError::Rejected { status, message }) => {
                let rejected = session.target;
                session.target = session.attribution;
                let current = session.attribution;
                if self.defaults == Some(rejected) {
                    self.defaults = Some(current);
                }
                self.fail(
                    RemoteError::Rejected { status, message },
                    "switch project/activity",
                    Severity::Error,
                    actions,
                );
            }
            Err(e) => self.fail(e, "switch project/activity", Severity::Warning, actions),
        }
    }

    fn on_retagged(&mut self, attribution: Attribution, result: Result<RemoteTimer, RemoteError>) {
        let Some((timer_id, _)) = self.retag.take() else {
            return;
        };
        match result {
            Ok(_) => info!(timer_id, %attribution, "Stopped timer re-attributed"),
            Err(e) => warn!(timer_id, %attribution, error = %e, "Could not re-attribute stopped timer"),
        }
    }

    fn finish_session(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        if let Some(session) = self.session.take() {
            let elapsed_secs = session.elapsed(now).num_seconds();
            info!(attribution = %session.attribution, elapsed_secs, "Session ended");
            actions.push(Action::Notify(Notification::SessionStopped {
                attribution: session.attribution,
                elapsed_secs,
            }));
        }
    }

    /// Records a failure, surfaces it and holds remote work until the next tick.
    ///
    /// Authentication failures additionally disable monitoring.
    fn fail(&mut self, e: RemoteError, what: &str, severity: Severity, actions: &mut Vec<Action>) {
        self.hold_until_tick = true;

        let (kind, severity) = match &e {
            RemoteError::Auth => (ErrorKind::Auth, severity.max(Severity::Error)),
            RemoteError::Rejected { .. } => (ErrorKind::Rejected, severity),
            _ => (ErrorKind::Transient, severity),
        };
        let message = format!("failed to {what}: {e}");

        if severity == Severity::Critical {
            error!(error = %e, "Failed to {what}");
        } else {
            warn!(error = %e, "Failed to {what}");
        }

        if kind == ErrorKind::Auth && self.monitoring {
            warn!("Credentials rejected, disabling monitoring");
            self.monitoring = false;
            actions.push(Action::Notify(Notification::MonitoringChanged { enabled: false }));
        }

        self.last_error = Some(message.clone());
        actions.push(Action::Notify(Notification::Error {
            kind,
            severity,
            message,
        }));
    }
}
