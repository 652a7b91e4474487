//! Shared data types for Kimai Autotrack.
//!
//! This module defines the values that flow between the sampler, the activity
//! state machine, the reconciler and the engine, plus the typed views of the
//! Kimai resources the tracker cares about. Remote JSON is decoded into these
//! structures with explicit `Option` fields rather than handled dynamically.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of a Kimai project.
pub type ProjectId = u64;

/// Identifier of a Kimai activity.
pub type ActivityId = u64;

/// Identifier of a Kimai timesheet (the remote timer).
pub type TimerId = u64;

/// A project/activity pair that time is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribution {
    pub project: ProjectId,
    pub activity: ActivityId,
}

impl Attribution {
    #[must_use]
    pub fn new(project: ProjectId, activity: ActivityId) -> Self {
        Self { project, activity }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project={} activity={}", self.project, self.activity)
    }
}

/// Kimai serializes relations either as a bare id or as an expanded object,
/// depending on the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum IdRef {
    Id(u64),
    Object { id: u64 },
}

impl IdRef {
    fn id(self) -> u64 {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

fn deserialize_id_ref<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    IdRef::deserialize(deserializer).map(IdRef::id)
}

fn deserialize_optional_id_ref<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<IdRef>::deserialize(deserializer).map(|id| id.map(IdRef::id))
}

/// A timesheet record as returned by the Kimai API.
///
/// Only the fields the engine needs are decoded; everything else in the
/// response is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTimer {
    /// Timesheet identifier.
    pub id: TimerId,

    #[serde(deserialize_with = "deserialize_id_ref")]
    pub project: ProjectId,

    #[serde(deserialize_with = "deserialize_id_ref")]
    pub activity: ActivityId,

    /// Begin timestamp as sent by the server (ISO 8601, possibly with offset).
    #[serde(default)]
    pub begin: Option<String>,

    /// End timestamp, `None` while the timer is running.
    #[serde(default)]
    pub end: Option<String>,
}

impl RemoteTimer {
    /// Returns the project/activity pair this timer is recorded under.
    #[must_use]
    pub fn attribution(&self) -> Attribution {
        Attribution::new(self.project, self.activity)
    }

    /// Returns true if the server reports the timer as still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.end.is_none()
    }

    /// Parses the begin timestamp.
    ///
    /// Kimai returns either an RFC 3339 timestamp with offset or a naive local
    /// timestamp depending on version and user settings; both are accepted.
    #[must_use]
    pub fn begin_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.begin.as_deref()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc))
    }
}

/// A project from the Kimai catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_optional_id_ref")]
    pub customer: Option<u64>,
}

/// An activity from the Kimai catalog.
///
/// Activities without a project are global and can be combined with any
/// project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_optional_id_ref")]
    pub project: Option<ProjectId>,
}

impl Activity {
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.project.is_none()
    }
}

/// Whether the user is currently considered to be working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Idle,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Idle => f.write_str("idle"),
        }
    }
}

/// A change of [`ActivityState`], emitted only when the state actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ActivityState,
    pub to: ActivityState,
    pub at: DateTime<Utc>,
}

/// The reconciler's record of the timer that should be running remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Remote timesheet id; `None` while the start request is in flight.
    pub remote_id: Option<TimerId>,

    /// Attribution the remote timer is currently recorded under (or being
    /// started with).
    pub attribution: Attribution,

    /// Attribution the user wants; differs from `attribution` while an
    /// override has not been applied remotely yet.
    pub target: Attribution,

    /// Local start of the tracked period, preserved across overrides.
    pub started_at: DateTime<Utc>,

    /// Set while a remote operation against this session is outstanding.
    pub pending: bool,
}

impl Session {
    /// Returns true once the remote service has confirmed the timer.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Elapsed local time since the session started.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> ChronoDuration {
        now.signed_duration_since(self.started_at)
    }
}

/// How loudly an engine error should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Missed tracking at worst.
    Warning,
    /// User action is required (e.g. credentials).
    Error,
    /// A remote timer may be running unattended.
    Critical,
}

/// Classification of an error surfaced to the user-facing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SensorUnavailable,
    Transient,
    Auth,
    Rejected,
}

/// Events published by the engine for the GUI and notification layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A remote timer was started; the quick-select may offer an override.
    SessionStarted { attribution: Attribution },

    /// A timer that was already running remotely was taken over.
    SessionAdopted {
        timer_id: TimerId,
        attribution: Attribution,
    },

    /// The running timer was moved to a new project/activity.
    SessionSwitched {
        from: Attribution,
        to: Attribution,
    },

    /// The remote timer was confirmed stopped.
    SessionStopped {
        attribution: Attribution,
        elapsed_secs: i64,
    },

    /// Monitoring was enabled or disabled.
    MonitoringChanged { enabled: bool },

    /// Something went wrong that the user should know about.
    Error {
        kind: ErrorKind,
        severity: Severity,
        message: String,
    },
}

/// Read-only view of the engine state, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub monitoring: bool,
    pub activity: ActivityState,
    pub session: Option<Session>,
    pub defaults: Option<Attribution>,
    pub last_error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            monitoring: false,
            activity: ActivityState::Active,
            session: None,
            defaults: None,
            last_error: None,
        }
    }
}
