//! Instance-agent entry point.
//!
//! Registers one worker in the shared registry, walks to the requested
//! startup state and serves state-change commands until a terminal command
//! or an interrupt, then unwinds to `Exiting` and unregisters.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use nestdaq::agent::InstanceAgent;
use nestdaq::config::AgentConfig;
use nestdaq::config::LogOptions;
use nestdaq::device::DeviceRegistry;
use nestdaq::fsm::StartupState;
use nestdaq::logging;
use nestdaq::registry;
use tracing::error;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "daq-device", about = "DAQ worker instance agent", version)]
struct Args {
    /// Name of this service
    #[arg(long)]
    service_name: String,

    /// Preconfigured uuid (generated when omitted)
    #[arg(long)]
    uuid: Option<Uuid>,

    /// IP address announced to peers
    #[arg(long)]
    host_ip: Option<String>,

    /// Hostname announced in the health hash
    #[arg(long)]
    hostname: Option<String>,

    /// Registry URI (tcp://host:port/db or mem://)
    #[arg(long, default_value = "tcp://127.0.0.1:6379/0")]
    registry_uri: String,

    /// Key-space separator
    #[arg(long, default_value = ":")]
    separator: String,

    /// Max TTL in seconds for the keys this instance owns
    #[arg(long, default_value_t = 5)]
    max_ttl: u64,

    /// TTL refresh interval in seconds
    #[arg(long, default_value_t = 3)]
    ttl_update_interval: u64,

    /// State to reach on startup (idle, initializing-device, initialized,
    /// bound, device-ready, ready, running)
    #[arg(long, default_value = "idle")]
    startup_state: String,

    /// Use unix domain sockets when all peers share this host
    #[arg(long, default_value_t = false)]
    enable_uds: bool,

    /// Explicit connect configuration (JSON object keyed by channel)
    #[arg(long)]
    connect_config: Option<String>,

    /// Device kind to run (null, sampler, sink)
    #[arg(long, default_value = "null")]
    device: String,

    /// Transport announced on channels
    #[arg(long, default_value = "zeromq")]
    transport: String,

    /// Session name recorded in the option hash
    #[arg(long, default_value = "default")]
    session: String,

    /// Retry budget for resolving one peer address (1 s per attempt)
    #[arg(long, default_value_t = 10)]
    max_retry_to_resolve_address: u32,

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

    let Some(startup_state) = StartupState::parse(&args.startup_state) else {
        error!(value = %args.startup_state, "unknown startup state");
        return ExitCode::FAILURE;
    };

    let config = AgentConfig {
        service_name: args.service_name,
        uuid: args.uuid,
        registry_uri: args.registry_uri,
        separator: args.separator,
        hostname: args.hostname,
        host_ip: args.host_ip,
        max_ttl: Duration::from_secs(args.max_ttl.max(1)),
        ttl_update_interval: Duration::from_secs(args.ttl_update_interval.max(1)),
        startup_state,
        enable_uds: args.enable_uds,
        connect_config: args.connect_config,
        device: args.device,
        transport: args.transport,
        session: args.session,
        max_retry_to_resolve_address: args.max_retry_to_resolve_address,
        log,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "device agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let registry = registry::connect(&config.registry_uri).await?;
    info!(uri = %config.registry_uri, "connected to the registry");

    let devices = DeviceRegistry::with_stock_devices();
    let device = devices.create(&config.device)?;

    let agent = InstanceAgent::register(config, registry, device).await?;
    info!(id = agent.instance_id(), "agent registered");

    let interrupt = {
        let agent = agent.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                agent.request_shutdown();
            }
        })
    };

    agent.run().await?;
    interrupt.abort();
    Ok(())
}
