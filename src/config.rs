//! Plain configuration structs consumed by the library.
//!
//! The binaries build these from their clap surfaces; tests build them
//! directly. Defaults mirror the documented CLI defaults.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::constants::DEFAULT_SEPARATOR;
use crate::fsm::StartupState;

/// Log-sink options recorded in the per-instance option hash.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub severity: String,
    pub verbosity: String,
    pub log_to_file: String,
    pub color: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            severity: "info".to_string(),
            verbosity: "medium".to_string(),
            log_to_file: String::new(),
            color: true,
        }
    }
}

/// Configuration of one instance agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_name: String,
    /// Preconfigured uuid; generated at startup when absent.
    pub uuid: Option<Uuid>,
    pub registry_uri: String,
    pub separator: String,
    pub hostname: Option<String>,
    pub host_ip: Option<String>,
    pub max_ttl: Duration,
    pub ttl_update_interval: Duration,
    pub startup_state: StartupState,
    pub enable_uds: bool,
    /// Explicit connect configuration (JSON object keyed by channel name).
    pub connect_config: Option<String>,
    /// Device kind to instantiate from the device registry.
    pub device: String,
    pub transport: String,
    pub session: String,
    /// Retry budget for resolving one peer address (1 s per attempt).
    pub max_retry_to_resolve_address: u32,
    pub log: LogOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            uuid: None,
            registry_uri: "tcp://127.0.0.1:6379/0".to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
            hostname: None,
            host_ip: None,
            max_ttl: Duration::from_secs(5),
            ttl_update_interval: Duration::from_secs(3),
            startup_state: StartupState::Idle,
            enable_uds: false,
            connect_config: None,
            device: "null".to_string(),
            transport: "zeromq".to_string(),
            session: "default".to_string(),
            max_retry_to_resolve_address: 10,
            log: LogOptions::default(),
        }
    }
}

/// Configuration of the controller hub.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub http_uri: String,
    pub threads: usize,
    pub doc_root: PathBuf,
    pub registry_uri: String,
    pub separator: String,
    pub poll_interval: Duration,
    pub pre_run: String,
    pub post_run: String,
    pub pre_stop: String,
    pub post_stop: String,
    pub log: LogOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_uri: "http://0.0.0.0:8080".to_string(),
            threads: 1,
            doc_root: PathBuf::from("./webctl"),
            registry_uri: "tcp://127.0.0.1:6379".to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
            poll_interval: Duration::from_millis(500),
            pre_run: r#"echo "pre-run command""#.to_string(),
            post_run: r#"echo "post-run command""#.to_string(),
            pre_stop: r#"echo "pre-stop command""#.to_string(),
            post_stop: r#"echo "post-stop command""#.to_string(),
            log: LogOptions::default(),
        }
    }
}

/// Split `scheme://address:port` into `(address, port)`.
pub fn parse_http_uri(uri: &str) -> Option<(String, u16)> {
    let rest = uri.splitn(2, "://").nth(1)?;
    let authority = rest.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
