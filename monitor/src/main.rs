//! PageLens Monitor - command line client for the PageLens backend.
//!
//! Submits jobs and follows them live until they finish.
//!
//! # Commands
//!
//! - `pagelens analyze <IMAGE>`: Upload a screenshot and follow the analysis
//! - `pagelens run-script <SCRIPT_ID>`: Run a stored script and follow it
//! - `pagelens test-cases <DESCRIPTION>`: Generate test cases and follow the run
//! - `pagelens watch <SESSION_ID>`: Follow an already running session
//! - `pagelens stop <SESSION_ID>`: Ask the backend to stop a session
//!
//! # Environment Variables
//!
//! See the [`config`](pagelens_monitor::config) module for available options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pagelens_monitor::api::{
    AnalysisUpload, HttpJobApi, JobKind, ScriptExecutionRequest, TestCaseRequest,
};
use pagelens_monitor::config::{Config, MonitorTimings};
use pagelens_monitor::monitor::SessionMonitor;
use pagelens_monitor::transport::HttpPushTransport;
use pagelens_monitor::types::{EventType, JobStatus};
use pagelens_monitor::JobApi;

/// PageLens Monitor - follow AI page analysis, script and test case jobs live.
#[derive(Parser, Debug)]
#[command(name = "pagelens")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    PAGELENS_API_URL                 Backend base URL (required)
    PAGELENS_REQUEST_TIMEOUT_SECS    REST request timeout (default: 30)
    PAGELENS_CONNECT_TIMEOUT_SECS    Push connection timeout (default: 30)
    PAGELENS_WATCHDOG_SECS           Overall job timeout (default: 300)
    PAGELENS_POLL_INTERVAL_MS        Fallback status poll interval (default: 2000)
    PAGELENS_LIST_REFRESH_MS         Job list refresh interval (default: 1500)
    PAGELENS_POLL_CEILING_SECS       Stop polling after this long (default: 60)
    PAGELENS_GRACE_DELAY_MS          Teardown delay after completion (default: 1000)
    PAGELENS_FAILURE_GRACE_DELAY_MS  Teardown delay after failure (default: 3000)

EXAMPLES:
    export PAGELENS_API_URL=http://localhost:8000

    # Analyze a screenshot
    pagelens analyze login.png --name \"Login page\"

    # Run a stored script
    pagelens run-script 42

    # Generate test cases from a description and a screenshot
    pagelens test-cases \"Log in with a wrong password\" --image login.png

    # Follow a session started elsewhere
    pagelens watch 3f2c... --kind script
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a page screenshot and follow the analysis.
    Analyze {
        /// Image file to upload.
        image: PathBuf,

        /// Page name stored with the result.
        #[arg(short, long)]
        name: Option<String>,

        /// Free-text page description.
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Execute a stored script by id and follow the run.
    RunScript {
        /// Script identifier.
        script_id: String,
    },

    /// Generate test cases from a description and follow the run.
    TestCases {
        /// What the tests should cover.
        description: String,

        /// Optional screenshot of the page under test.
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Comma separated output formats.
        #[arg(short, long, default_value = "yaml")]
        formats: String,

        /// Name for the generated script.
        #[arg(long)]
        script_name: Option<String>,

        /// Do not store the generated scripts.
        #[arg(long)]
        no_save: bool,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Follow a running session.
    ///
    /// Ctrl+C cancels the job on the backend before exiting.
    Watch {
        session_id: String,

        /// Job family: `page-analysis`, `script` or `test-case`.
        #[arg(short, long, default_value = "page-analysis")]
        kind: JobKind,
    },

    /// Ask the backend to stop a session.
    Stop {
        session_id: String,

        /// Job family: `page-analysis` or `script`.
        #[arg(short, long, default_value = "script")]
        kind: JobKind,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    debug!(api_url = %config.api_url, timings = ?config.timings, "Configuration loaded");

    match cli.command {
        Command::Analyze {
            image,
            name,
            description,
        } => {
            let api = HttpJobApi::new(&config.api_url, JobKind::PageAnalysis, config.request_timeout)
                .context("Failed to create API client")?;

            let mut upload = AnalysisUpload::new(&image);
            if let Some(name) = name {
                upload = upload.with_page_name(name);
            }
            if let Some(description) = description {
                upload = upload.with_description(description);
            }

            let handle = api
                .submit_page_analysis(&upload)
                .await
                .with_context(|| format!("Failed to submit {}", image.display()))?;
            println!("Analysis started: {}", handle.session_id);

            let transport =
                HttpPushTransport::from_handle(&config.api_url, &handle, config.timings.connect_timeout)
                    .context("Failed to create push transport")?;
            follow(config.timings, handle.session_id, transport, api).await
        }
        Command::RunScript { script_id } => {
            let api = HttpJobApi::new(&config.api_url, JobKind::ScriptExecution, config.request_timeout)
                .context("Failed to create API client")?;

            let handle = api
                .execute_script(&ScriptExecutionRequest::new(&script_id))
                .await
                .with_context(|| format!("Failed to execute script {script_id}"))?;
            println!("Script run started: {}", handle.session_id);

            let transport =
                HttpPushTransport::from_handle(&config.api_url, &handle, config.timings.connect_timeout)
                    .context("Failed to create push transport")?;
            follow(config.timings, handle.session_id, transport, api).await
        }
        Command::TestCases {
            description,
            image,
            formats,
            script_name,
            no_save,
            timeout_secs,
        } => {
            let api = HttpJobApi::new(&config.api_url, JobKind::TestCaseCreation, config.request_timeout)
                .context("Failed to create API client")?;

            let mut request = TestCaseRequest::new(description).with_formats(formats);
            if let Some(image) = image {
                request = request.with_image(image);
            }
            if let Some(script_name) = script_name {
                request = request.with_script_name(script_name);
            }
            request.save_to_database = !no_save;

            let handle = api
                .submit_test_cases(&request)
                .await
                .context("Failed to start test case generation")?;
            println!("Test case generation started: {}", handle.session_id);

            let transport =
                HttpPushTransport::from_handle(&config.api_url, &handle, config.timings.connect_timeout)
                    .context("Failed to create push transport")?;
            let timings = MonitorTimings {
                watchdog: Duration::from_secs(timeout_secs.max(1)),
                ..config.timings
            };
            follow(timings, handle.session_id, transport, api).await
        }
        Command::Watch { session_id, kind } => {
            let api = HttpJobApi::new(&config.api_url, kind, config.request_timeout)
                .context("Failed to create API client")?;
            let transport = HttpPushTransport::new(
                &config.api_url,
                api.routes().stream.clone(),
                config.timings.connect_timeout,
            )
            .context("Failed to create push transport")?;
            follow(config.timings, session_id, transport, api).await
        }
        Command::Stop { session_id, kind } => {
            let api = HttpJobApi::new(&config.api_url, kind, config.request_timeout)
                .context("Failed to create API client")?;
            api.cancel(&session_id)
                .await
                .with_context(|| format!("Failed to stop session {session_id}"))?;
            println!("Stop requested for {session_id}");
            Ok(())
        }
    }
}

/// Follows a session until it closes or the user interrupts.
async fn follow(
    timings: MonitorTimings,
    session_id: String,
    transport: HttpPushTransport,
    api: HttpJobApi,
) -> Result<()> {
    let mut monitor = SessionMonitor::new(session_id, Arc::new(transport), Arc::new(api))
        .with_timings(timings)
        .on_message(|message| match message.event_type {
            EventType::FinalResult => {
                let result = message.payload.get("result").unwrap_or(&message.payload);
                match serde_json::to_string_pretty(result) {
                    Ok(pretty) => println!("[{:>3}%] result:\n{pretty}", message.progress),
                    Err(_) => println!("[{:>3}%] result: {result}", message.progress),
                }
            }
            _ => {
                if let Some(content) = &message.content {
                    println!("[{:>3}%] {content}", message.progress);
                }
            }
        })
        .on_status_change(|status| info!(status = %status, "Job status"))
        .on_error(|e| eprintln!("Error: {e}"))
        .on_complete(|| println!("Done."))
        .on_list_refresh(|records| debug!(count = records.len(), "Job list refreshed"));

    monitor.start();

    let interrupted = tokio::select! {
        () = monitor.closed() => false,
        () = wait_for_shutdown() => true,
    };

    if interrupted {
        warn!(session_id = %monitor.session_id(), "Shutdown signal received, cancelling job");
        if let Err(e) = monitor.stop_execution().await {
            warn!(error = %e, "Backend was not notified; stopped locally");
        }
        bail!("interrupted");
    }

    let snapshot = monitor.snapshot();
    if snapshot.job_status == JobStatus::Failed {
        bail!(
            "job {} failed: {}",
            snapshot.session_id,
            snapshot.error_reason.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Initializes the tracing subscriber with environment-based filtering.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
