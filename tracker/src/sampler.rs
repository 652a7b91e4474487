//! Idle-time sampling.
//!
//! The engine only needs one number per poll: how long it has been since the
//! last keyboard or mouse input. [`IdleSampler`] abstracts that query so the
//! desktop integration can be swapped without touching the state machine.
//!
//! The bundled backend shells out to a desktop utility per sample:
//!
//! - GNOME: `gdbus call` against `org.gnome.Mutter.IdleMonitor.GetIdletime`,
//!   which works on Wayland where X11 screensaver queries do not
//! - X11: `xprintidle`
//!
//! Each call re-resolves the service, so a session bus that appears after
//! startup is picked up on the next sample.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

use crate::config::IdleBackend;

/// Upper bound for a single idle query.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur while reading idle time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// The idle-time source could not be reached or returned garbage.
    #[error("idle sensor unavailable: {0}")]
    Unavailable(String),
}

/// Source of "time since last user input".
///
/// Implementations have no side effects and may be called at any cadence;
/// the engine owns timing.
pub trait IdleSampler: Send {
    /// Returns the current idle duration.
    fn sample(&mut self) -> impl Future<Output = Result<Duration, SensorError>> + Send;
}

/// Parses output of `GetIdletime` as printed by `gdbus`, e.g. `(uint64 5123,)`.
fn parse_gdbus_idletime(output: &str) -> Option<u64> {
    output
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim_end_matches(',')
        .trim()
        .strip_prefix("uint64")?
        .trim()
        .parse()
        .ok()
}

/// Parses `xprintidle` output, a bare millisecond count.
fn parse_plain_millis(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}

/// Samples idle time by running an external command and parsing its stdout
/// as milliseconds.
#[derive(Debug, Clone)]
pub struct CommandSampler {
    program: String,
    args: Vec<String>,
    parse: fn(&str) -> Option<u64>,
}

impl CommandSampler {
    /// Sampler for the GNOME Mutter idle monitor.
    #[must_use]
    pub fn gnome() -> Self {
        Self {
            program: "gdbus".to_string(),
            args: [
                "call",
                "--session",
                "--dest",
                "org.gnome.Mutter.IdleMonitor",
                "--object-path",
                "/org/gnome/Mutter/IdleMonitor/Core",
                "--method",
                "org.gnome.Mutter.IdleMonitor.GetIdletime",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            parse: parse_gdbus_idletime,
        }
    }

    /// Sampler backed by `xprintidle`.
    #[must_use]
    pub fn xprintidle() -> Self {
        Self {
            program: "xprintidle".to_string(),
            args: Vec::new(),
            parse: parse_plain_millis,
        }
    }

    /// Sampler for the configured backend.
    #[must_use]
    pub fn for_backend(backend: IdleBackend) -> Self {
        match backend {
            IdleBackend::Gnome => Self::gnome(),
            IdleBackend::Xprintidle => Self::xprintidle(),
        }
    }
}

impl IdleSampler for CommandSampler {
    async fn sample(&mut self) -> Result<Duration, SensorError> {
        let output = timeout(
            SAMPLE_TIMEOUT,
            Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SensorError::Unavailable(format!("{} timed out", self.program)))?
        .map_err(|e| SensorError::Unavailable(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SensorError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let millis = (self.parse)(&stdout).ok_or_else(|| {
            SensorError::Unavailable(format!(
                "unexpected {} output: {}",
                self.program,
                stdout.trim()
            ))
        })?;

        trace!(idle_ms = millis, "Idle time sampled");
        Ok(Duration::from_millis(millis))
    }
}
