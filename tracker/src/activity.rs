//! Activity state machine.
//!
//! Turns idle samples into `Active`/`Idle` transitions. The state is `Idle`
//! exactly when the most recent successful sample reached the idle timeout.
//! A failed sample holds the previous state so that a sensor outage never
//! starts or stops tracked time on its own.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::sampler::SensorError;
use crate::types::{ActivityState, Transition};

/// Decides whether the user is active based on sampled idle time.
#[derive(Debug, Clone)]
pub struct ActivityStateMachine {
    state: ActivityState,
    idle_timeout: Duration,
}

impl ActivityStateMachine {
    /// Creates a state machine in the `Active` state.
    ///
    /// Starting optimistic avoids a spurious stop before the first real
    /// reading.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: ActivityState::Active,
            idle_timeout,
        }
    }

    #[must_use]
    pub fn state(&self) -> ActivityState {
        self.state
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Changes the threshold; takes effect on the next sample.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Evaluates one sample, returning a transition only if the state changed.
    pub fn observe(
        &mut self,
        sample: Result<Duration, SensorError>,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        let idle = match sample {
            Ok(idle) => idle,
            Err(e) => {
                warn!(error = %e, state = %self.state, "Idle sample failed, holding state");
                return None;
            }
        };

        let next = if idle >= self.idle_timeout {
            ActivityState::Idle
        } else {
            ActivityState::Active
        };

        if next == self.state {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
            at,
        };
        debug!(
            from = %transition.from,
            to = %transition.to,
            idle_secs = idle.as_secs(),
            "Activity state changed"
        );
        self.state = next;
        Some(transition)
    }
}
