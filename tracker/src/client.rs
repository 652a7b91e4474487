//! Kimai API client.
//!
//! This module talks to the Kimai 2 REST API with:
//!
//! - Bearer-token authentication on every request
//! - A per-attempt request timeout
//! - Capped exponential backoff with ±25% jitter on network errors, 429 and 5xx
//! - No retries for authentication (401/403) or validation (4xx) failures
//!
//! The tracking-critical calls are exposed through the [`TimerApi`] trait so
//! the engine can be driven by a mock in tests. Catalog queries
//! (`projects`, `activities`) are inherent methods; they are not on the
//! tracking path and their failures never affect timer state.
//!
//! # Example
//!
//! ```no_run
//! use kimai_autotrack::client::{KimaiClient, RetryPolicy, TimerApi};
//! use kimai_autotrack::types::Attribution;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = KimaiClient::new("https://kimai.example.com", "token", RetryPolicy::default())?;
//!
//!     if client.active_timer().await?.is_none() {
//!         let timer = client.start_timer(Attribution::new(7, 3)).await?;
//!         println!("Started timesheet {}", timer.id);
//!     }
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use chrono::Local;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::types::{Activity, Attribution, ProjectId, RemoteTimer, TimerId, Project};

/// HTTP request timeout per attempt.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Format Kimai expects for `begin` (local time, no offset).
const KIMAI_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Errors that can occur while talking to Kimai.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The token was rejected (401/403). Never retried.
    #[error("authentication failed: token rejected by server")]
    Auth,

    /// The server refused the request, e.g. an activity that is not linked to
    /// the project. Never retried.
    #[error("request rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Network failure or server error that persisted through all retries.
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The client could not be constructed (bad URL or token characters).
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl RemoteError {
    /// True if retrying later could succeed without user intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Decode(_))
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server stopped the timer.
    Stopped,
    /// The server had no such running timer; nothing is left running.
    AlreadyStopped,
}

/// Backoff parameters for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied per further attempt.
    pub factor: u32,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays and no jitter, for tests against a mock server.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
            jitter: 0.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = self.factor.saturating_pow(exponent);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Adds jitter to a delay, never exceeding `max_delay`.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let secs = (delay.as_secs_f64() + jitter).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Tracking-critical remote operations.
///
/// Implemented by [`KimaiClient`]; tests substitute an in-memory service.
pub trait TimerApi: Send + Sync + 'static {
    /// Returns the currently running timer, if any.
    fn active_timer(&self) -> impl Future<Output = Result<Option<RemoteTimer>, RemoteError>> + Send;

    /// Starts a timer for the given project/activity.
    fn start_timer(
        &self,
        attribution: Attribution,
    ) -> impl Future<Output = Result<RemoteTimer, RemoteError>> + Send;

    /// Stops a timer. A timer that is not running counts as stopped.
    fn stop_timer(&self, id: TimerId) -> impl Future<Output = Result<StopOutcome, RemoteError>> + Send;

    /// Moves a running timer to a different project/activity in place.
    fn update_timer(
        &self,
        id: TimerId,
        attribution: Attribution,
    ) -> impl Future<Output = Result<RemoteTimer, RemoteError>> + Send;
}

#[derive(Serialize)]
struct StartRequest {
    begin: String,
    project: u64,
    activity: u64,
}

#[derive(Serialize)]
struct UpdateRequest {
    project: u64,
    activity: u64,
}

/// Why a single attempt failed.
enum AttemptError {
    Retry { message: String, wait: Option<Duration> },
    Fatal(RemoteError),
}

/// Authenticated HTTP client for the Kimai API.
#[derive(Debug, Clone)]
pub struct KimaiClient {
    client: Client,
    api_base: String,
    retry: RetryPolicy,
}

impl KimaiClient {
    /// Creates a client for the Kimai instance at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Setup` if the token contains characters that are
    /// not valid in a header, or the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str, retry: RetryPolicy) -> Result<Self, RemoteError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| RemoteError::Setup(format!("invalid token: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .map_err(|e| RemoteError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            api_base: format!("{}/api", base_url.trim().trim_end_matches('/')),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Checks connectivity and credentials via `GET /api/ping`.
    pub async fn ping(&self) -> Result<(), RemoteError> {
        let url = self.url("ping");
        let response = self.execute("ping", || self.client.get(&url)).await?;
        expect_success(response).await.map(|_| ())
    }

    /// Lists visible projects.
    pub async fn projects(&self) -> Result<Vec<Project>, RemoteError> {
        let url = self.url("projects");
        let response = self
            .execute("list_projects", || {
                self.client.get(&url).query(&[("visible", "1")])
            })
            .await?;
        decode(expect_success(response).await?).await
    }

    /// Lists visible activities, optionally restricted to one project.
    ///
    /// With a project, Kimai returns the project's own activities as well as
    /// global ones.
    pub async fn activities(&self, project: Option<ProjectId>) -> Result<Vec<Activity>, RemoteError> {
        let url = self.url("activities");
        let mut query = vec![("visible", "1".to_string())];
        if let Some(project) = project {
            query.push(("project", project.to_string()));
        }

        let response = self
            .execute("list_activities", || self.client.get(&url).query(&query))
            .await?;
        decode(expect_success(response).await?).await
    }

    /// Activities offered for a project in the quick-select: the project's own
    /// activities first, then global activities not already listed.
    pub async fn selectable_activities(&self, project: ProjectId) -> Result<Vec<Activity>, RemoteError> {
        let scoped = self.activities(Some(project)).await?;
        let global = self.activities(None).await?;
        Ok(merge_activities(scoped, global))
    }

    /// Sends a request built by `build`, retrying transient failures.
    ///
    /// Returns the response for any status that is not retried and not an
    /// authentication failure; callers interpret 4xx codes.
    async fn execute<F>(&self, op: &'static str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(op, attempt = attempts, "Sending Kimai request");

            let failure = match build().send().await {
                Ok(response) => match classify(response) {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                },
                Err(e) if e.is_builder() => {
                    return Err(RemoteError::Setup(e.to_string()));
                }
                Err(e) => AttemptError::Retry {
                    message: e.to_string(),
                    wait: None,
                },
            };

            match failure {
                AttemptError::Fatal(err) => {
                    warn!(op, error = %err, "Kimai request failed");
                    return Err(err);
                }
                AttemptError::Retry { message, wait } => {
                    if attempts >= self.retry.max_attempts {
                        warn!(op, attempts, error = %message, "Kimai request failed, retries exhausted");
                        return Err(RemoteError::Transient { attempts, message });
                    }

                    let delay = wait
                        .map(|w| w.min(self.retry.max_delay))
                        .unwrap_or_else(|| self.retry.jittered(self.retry.delay_for(attempts)));
                    warn!(
                        op,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient Kimai failure, will retry"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

impl TimerApi for KimaiClient {
    async fn active_timer(&self) -> Result<Option<RemoteTimer>, RemoteError> {
        let url = self.url("timesheets/active");
        let response = self.execute("active_timer", || self.client.get(&url)).await?;
        let timers: Vec<RemoteTimer> = decode(expect_success(response).await?).await?;

        let mut running = timers.into_iter().filter(RemoteTimer::is_running);
        let first = running.next();
        let extra = running.count();
        if extra > 0 {
            warn!(extra, "More than one active timesheet on the server, adopting the first");
        }
        Ok(first)
    }

    async fn start_timer(&self, attribution: Attribution) -> Result<RemoteTimer, RemoteError> {
        let url = self.url("timesheets");
        let body = StartRequest {
            begin: Local::now().format(KIMAI_DATETIME_FORMAT).to_string(),
            project: attribution.project,
            activity: attribution.activity,
        };

        let response = self
            .execute("start_timer", || self.client.post(&url).json(&body))
            .await?;
        let timer: RemoteTimer = decode(expect_success(response).await?).await?;

        info!(timer_id = timer.id, %attribution, "Timesheet started");
        Ok(timer)
    }

    async fn stop_timer(&self, id: TimerId) -> Result<StopOutcome, RemoteError> {
        let url = self.url(&format!("timesheets/{id}/stop"));
        let response = self.execute("stop_timer", || self.client.patch(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            info!(timer_id = id, "Timesheet not found, treating as already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }

        expect_success(response).await?;
        info!(timer_id = id, "Timesheet stopped");
        Ok(StopOutcome::Stopped)
    }

    async fn update_timer(&self, id: TimerId, attribution: Attribution) -> Result<RemoteTimer, RemoteError> {
        let url = self.url(&format!("timesheets/{id}"));
        let body = UpdateRequest {
            project: attribution.project,
            activity: attribution.activity,
        };

        let response = self
            .execute("update_timer", || self.client.patch(&url).json(&body))
            .await?;
        let timer: RemoteTimer = decode(expect_success(response).await?).await?;

        info!(timer_id = timer.id, %attribution, "Timesheet moved");
        Ok(timer)
    }
}

/// Sorts a response into success, retryable or fatal.
fn classify(response: Response) -> Result<Response, AttemptError> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AttemptError::Fatal(RemoteError::Auth));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(AttemptError::Retry {
            message: "rate limited".to_string(),
            wait,
        });
    }

    if status.is_server_error() {
        return Err(AttemptError::Retry {
            message: format!("server error {}", status.as_u16()),
            wait: None,
        });
    }

    Ok(response)
}

/// Turns a non-2xx response into `RemoteError::Rejected`.
async fn expect_success(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Project activities first, then global ones not already present.
fn merge_activities(scoped: Vec<Activity>, global: Vec<Activity>) -> Vec<Activity> {
    let mut merged = scoped;
    for activity in global {
        if !merged.iter().any(|a| a.id == activity.id) {
            merged.push(activity);
        }
    }
    merged
}
