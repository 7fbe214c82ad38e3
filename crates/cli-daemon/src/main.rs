//! CLI entry point for reelforge
//!
//! Loads configuration, installs logging and either runs the daemon or
//! renders a single job document and exits.

use clap::Parser;
use reelforge::{init_logging, job_from_document, Config, Daemon, DaemonError, IntakeEvent};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

/// reelforge - render orchestration for generated videos
#[derive(Parser, Debug)]
#[command(name = "reelforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Ignore the configuration file and use defaults plus environment overrides
    #[arg(long, default_value = "false")]
    no_config: bool,

    /// Skip startup checks (ffprobe, renderer, output directory). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Read newline-delimited change-feed events from stdin
    #[arg(long, default_value = "false")]
    stdin_feed: bool,

    /// Render a single job document and exit
    #[arg(long, value_name = "FILE")]
    job: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    if args.no_config {
        return Ok(Config::from_env());
    }
    Ok(Config::load(&args.config)?)
}

async fn run_single(daemon: &Daemon, path: &Path) -> ExitCode {
    let document = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read job document");
            return ExitCode::FAILURE;
        }
    };
    let value = match serde_json::from_str(&document) {
        Ok(value) => value,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Job document is not valid JSON");
            return ExitCode::FAILURE;
        }
    };

    let job = match job_from_document(value, &daemon.config.status.table) {
        Ok(IntakeEvent::Job(job)) => job,
        Ok(IntakeEvent::Ignored { reason }) => {
            warn!(reason = %reason, "Job document ignored");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!(error = %e, "Job document rejected");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run_job(job).await {
        Ok(job) => {
            info!(
                job_id = %job.id,
                output_url = job.output_url.as_deref().unwrap_or(""),
                "Render completed"
            );
            if let Some(url) = job.output_url {
                println!("{}", url);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Render failed");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);
    info!(
        config = %args.config.display(),
        concurrency = config.queue.concurrency,
        bind = %config.server.bind,
        "reelforge starting"
    );

    let daemon = match Daemon::new(config, args.skip_checks).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &args.job {
        return run_single(&daemon, path).await;
    }

    match daemon.run(args.stdin_feed).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "reelforge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Daemon error");
            ExitCode::FAILURE
        }
    }
}
