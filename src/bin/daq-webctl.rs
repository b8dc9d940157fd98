//! Web controller entry point.
//!
//! Connects to the shared registry, starts the state-poll and expiry tasks
//! and serves the browser UI over HTTP/WebSocket until interrupted. Exits
//! non-zero when the registry is unreachable at startup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use nestdaq::config::ControllerConfig;
use nestdaq::config::LogOptions;
use nestdaq::controller::ControllerHub;
use nestdaq::logging;
use nestdaq::registry;
use tracing::error;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "daq-webctl", about = "web controller for the DAQ service registry", version)]
struct Args {
    /// HTTP server URI (scheme://address:port)
    #[arg(long, default_value = "http://0.0.0.0:8080")]
    http_uri: String,

    /// Number of worker threads for the server runtime
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Document root served to browsers
    #[arg(long, default_value = "./webctl")]
    doc_root: PathBuf,

    /// Registry URI (tcp://host:port/db or mem://)
    #[arg(long, default_value = "tcp://127.0.0.1:6379")]
    redis_uri: String,

    /// Key-space separator
    #[arg(long, default_value = ":")]
    separator: String,

    /// State polling interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_interval: u64,

    /// Command executed before publishing RUN
    #[arg(long, default_value = "echo \"pre-run command\"")]
    pre_run: String,

    /// Command executed after publishing RUN
    #[arg(long, default_value = "echo \"post-run command\"")]
    post_run: String,

    /// Command executed before publishing STOP
    #[arg(long, default_value = "echo \"pre-stop command\"")]
    pre_stop: String,

    /// Command executed after publishing STOP
    #[arg(long, default_value = "echo \"post-stop command\"")]
    post_stop: String,

    /// Log severity (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    severity: String,

    /// Log verbosity (low, medium, high, veryhigh)
    #[arg(long, default_value = "medium")]
    verbosity: String,

    /// Append log output to this file
    #[arg(long, default_value = "")]
    log_to_file: String,

    /// ANSI colors on the console
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    color: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log = LogOptions {
        severity: args.severity.clone(),
        verbosity: args.verbosity.clone(),
        log_to_file: args.log_to_file.clone(),
        color: args.color,
    };
    if let Err(e) = logging::init(&log) {
        eprintln!("logging setup failed: {e:#}");
        return ExitCode::FAILURE;
    }

    let config = ControllerConfig {
        http_uri: args.http_uri,
        threads: args.threads.max(1),
        doc_root: args.doc_root,
        registry_uri: args.redis_uri,
        separator: args.separator,
        poll_interval: Duration::from_millis(args.poll_interval),
        pre_run: args.pre_run,
        post_run: args.post_run,
        pre_stop: args.pre_stop,
        post_stop: args.post_stop,
        log,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "controller failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let registry = registry::connect(&config.registry_uri).await?;
    info!(uri = %config.registry_uri, "connected to the registry");

    let hub = ControllerHub::new(config, registry).await?;
    hub.start_background_tasks();

    let server = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.serve_http().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    hub.shutdown();
    server.await??;
    Ok(())
}
