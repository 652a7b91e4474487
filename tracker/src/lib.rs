//! Kimai Autotrack - activity-driven Kimai timer synchronization.
//!
//! This crate keeps a remote Kimai timer in step with whether the user is at
//! the keyboard: the timer is stopped after a configurable idle period and
//! resumed on the default project/activity when input returns.
//!
//! # Overview
//!
//! The engine polls an idle-time sensor on a fixed cadence, turns samples into
//! `Active`/`Idle` transitions, and reconciles those transitions (plus user
//! commands such as overrides) against the remote timer. All state changes are
//! serialized through one event queue, so a manual override arriving while a
//! start is still in flight is applied after the start completes rather than
//! racing it.
//!
//! # Modules
//!
//! - [`types`]: Shared data types (attributions, timers, sessions, notifications)
//! - [`config`]: Configuration file and environment overrides
//! - [`error`]: Error types for tracker operations
//! - [`sampler`]: Idle-time sampling backends
//! - [`activity`]: Idle/active state machine
//! - [`client`]: Kimai HTTP client with retry and backoff
//! - [`reconciler`]: IO-free session reconciliation
//! - [`engine`]: Polling loop and control handle

pub mod activity;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod reconciler;
pub mod sampler;
pub mod types;

pub use activity::ActivityStateMachine;
pub use client::{KimaiClient, RemoteError, RetryPolicy, StopOutcome, TimerApi};
pub use config::{Config, ConfigError, IdleBackend};
pub use engine::{Engine, EngineHandle};
pub use error::{Result, TrackerError};
pub use reconciler::Reconciler;
pub use sampler::{CommandSampler, IdleSampler, SensorError};
pub use types::{
    ActivityState, Attribution, ErrorKind, Notification, RemoteTimer, Session, Severity, Snapshot,
    Transition,
};
