//! Kimai Autotrack - keeps a Kimai timer in step with keyboard activity.
//!
//! # Commands
//!
//! - `kimai-autotrack run`: Start tracking in the foreground
//! - `kimai-autotrack ping`: Check the Kimai URL and token
//! - `kimai-autotrack projects`: List visible projects
//! - `kimai-autotrack activities`: List visible activities
//! - `kimai-autotrack set-default`: Store the default project/activity
//! - `kimai-autotrack config-path`: Print the config file location
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.
//!
//! # Signals
//!
//! While `run` is active, `SIGHUP` reloads the configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kimai_autotrack::client::{KimaiClient, RetryPolicy};
use kimai_autotrack::config::{self, Config};
use kimai_autotrack::engine::Engine;
use kimai_autotrack::sampler::CommandSampler;
#[cfg(unix)]
use kimai_autotrack::engine::EngineHandle;
use kimai_autotrack::types::{Attribution, Notification, Severity};

/// Kimai Autotrack - activity-driven Kimai timer.
///
/// Stops the running Kimai timer when you walk away and resumes it on
/// your default project/activity when you come back.
#[derive(Parser, Debug)]
#[command(name = "kimai-autotrack")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    KIMAI_TRACKER_URL                Kimai base URL
    KIMAI_TRACKER_TOKEN              API token
    KIMAI_TRACKER_IDLE_TIMEOUT_SECS  Idle threshold (default: 600)
    KIMAI_TRACKER_POLL_INTERVAL_SECS Sampling cadence (default: 15)
    KIMAI_TRACKER_PROJECT            Default project id
    KIMAI_TRACKER_ACTIVITY           Default activity id
    KIMAI_TRACKER_CONFIG             Alternate config file path

EXAMPLES:
    # Verify credentials
    kimai-autotrack ping

    # Find the ids to use as defaults
    kimai-autotrack projects
    kimai-autotrack activities --project 7

    # Start tracking
    KIMAI_TRACKER_PROJECT=7 KIMAI_TRACKER_ACTIVITY=3 kimai-autotrack run

    # Change the default while running
    kimai-autotrack set-default 7 3 && pkill -HUP kimai-autotrack
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start tracking in the foreground.
    ///
    /// Adopts a timer that is already running, stops it when idle and
    /// resumes on the default project/activity. Ctrl+C stops the timer
    /// before exiting.
    Run,

    /// Check connectivity and credentials.
    Ping,

    /// List visible projects.
    Projects,

    /// List visible activities.
    Activities {
        /// Show activities selectable for this project (own and global).
        #[arg(short, long)]
        project: Option<u64>,
    },

    /// Store the default project/activity in the config file.
    ///
    /// A running tracker applies it after receiving SIGHUP.
    SetDefault {
        /// Project id.
        project: u64,
        /// Activity id.
        activity: u64,
    },

    /// Print the config file location.
    ConfigPath,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::ConfigPath => {
            let path = config::default_path().context("Failed to determine config path")?;
            println!("{}", path.display());
            return Ok(());
        }
        Command::SetDefault { project, activity } => {
            let path = config::default_path().context("Failed to determine config path")?;
            Config::store_defaults(&path, Attribution::new(project, activity))
                .with_context(|| format!("Failed to update {}", path.display()))?;
            println!("Default set to project {project}, activity {activity}");
            return Ok(());
        }
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Run => run_tracker().await,
            Command::Ping => run_ping().await,
            Command::Projects => run_projects().await,
            Command::Activities { project } => run_activities(project).await,
            Command::SetDefault { .. } | Command::ConfigPath => Ok(()),
        }
    })
}

fn load_config() -> Result<Config> {
    Config::load().context(
        "Failed to load configuration. Set KIMAI_TRACKER_URL and KIMAI_TRACKER_TOKEN \
         or run 'kimai-autotrack config-path' to find the config file",
    )
}

fn connect(config: &Config) -> Result<KimaiClient> {
    KimaiClient::new(&config.base_url, &config.token, RetryPolicy::default())
        .context("Failed to create Kimai client")
}

async fn run_ping() -> Result<()> {
    let config = load_config()?;
    connect(&config)?
        .ping()
        .await
        .with_context(|| format!("Kimai at {} did not answer", config.base_url))?;
    println!("OK: {}", config.base_url);
    Ok(())
}

async fn run_projects() -> Result<()> {
    let config = load_config()?;
    let projects = connect(&config)?
        .projects()
        .await
        .context("Failed to list projects")?;

    for project in projects {
        println!("{}\t{}", project.id, project.name);
    }
    Ok(())
}

async fn run_activities(project: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let client = connect(&config)?;
    let activities = match project {
        Some(project) => client.selectable_activities(project).await,
        None => client.activities(None).await,
    }
    .context("Failed to list activities")?;

    for activity in activities {
        let scope = match activity.project {
            Some(project) => format!("project {project}"),
            None => "global".to_string(),
        };
        println!("{}\t{}\t({scope})", activity.id, activity.name);
    }
    Ok(())
}

/// Runs the tracker until a shutdown signal arrives.
async fn run_tracker() -> Result<()> {
    info!("Starting Kimai Autotrack");

    let config = load_config()?;
    info!(
        base_url = %config.base_url,
        idle_timeout_secs = config.idle_timeout_seconds,
        poll_interval_secs = config.poll_interval_seconds,
        backend = ?config.idle_backend,
        "Configuration loaded"
    );
    if config.defaults().is_none() {
        warn!("No default project/activity configured; timers will only be adopted and stopped");
    }

    let sampler = CommandSampler::for_backend(config.idle_backend);
    let (engine, handle) = Engine::new(&config, sampler, |config: &Config| {
        KimaiClient::new(&config.base_url, &config.token, RetryPolicy::default())
    })
    .context("Failed to initialize engine")?;

    let mut notifications = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => log_notification(&notification),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let engine_task = tokio::spawn(engine.run());
    handle
        .start_monitoring()
        .await
        .context("Engine exited before monitoring started")?;

    #[cfg(unix)]
    let reloader = tokio::spawn(reload_on_hangup(handle.clone()));

    info!("Tracker running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;
    info!("Shutdown signal received");

    #[cfg(unix)]
    reloader.abort();

    handle.shutdown().await.context("Engine exited early")?;
    engine_task
        .await
        .context("Engine task panicked")?
        .context("Engine failed")?;

    info!("Tracker stopped");
    Ok(())
}

/// Re-reads the configuration on every SIGHUP and hands it to the engine.
#[cfg(unix)]
async fn reload_on_hangup(handle: EngineHandle) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading configuration");
        match Config::load() {
            Ok(config) => {
                if handle.reload(config).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Keeping current configuration"),
        }
    }
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::SessionStarted { attribution } => info!(%attribution, "Timer started"),
        Notification::SessionAdopted {
            timer_id,
            attribution,
        } => info!(timer_id, %attribution, "Timer adopted"),
        Notification::SessionSwitched { from, to } => info!(%from, %to, "Timer switched"),
        Notification::SessionStopped {
            attribution,
            elapsed_secs,
        } => info!(%attribution, elapsed_secs, "Timer stopped"),
        Notification::MonitoringChanged { enabled } => info!(enabled, "Monitoring changed"),
        Notification::Error {
            kind,
            severity,
            message,
        } => match severity {
            Severity::Warning => warn!(?kind, %message, "Tracker warning"),
            Severity::Error | Severity::Critical => error!(?kind, ?severity, %message, "Tracker error"),
        },
    }
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Listings go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
