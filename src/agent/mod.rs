//! The in-worker instance agent.
//!
//! One agent runs inside every worker process. It acquires a unique
//! `(service, index)` identity, keeps the instance's liveness keys refreshed,
//! drives the local device state machine from broadcast commands, and invokes
//! the topology resolver on the transitions that need it.
//!
//! Three cooperating tasks: the state-control task (startup walk, command
//! subscription and shutdown walk, all inside [`InstanceAgent::run`]), the
//! liveness timer spawned at registration, and the caller's own task holding
//! the handle.

mod command;
mod identity;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub use command::CommandMessage;
pub use identity::AcquiredIdentity;
pub use identity::acquire_index;

use crate::cancel::CancelFlag;
use crate::config::AgentConfig;
use crate::constants::COMMAND_CHANNEL;
use crate::constants::FAIRMQ_STATE_PREFIX;
use crate::constants::HEALTH_PREFIX;
use crate::constants::PROG_OPTION_PREFIX;
use crate::constants::STATE_CHANNEL;
use crate::constants::TOP_PREFIX;
use crate::constants::UPDATE_TIME_PREFIX;
use crate::device::Device;
use crate::device::DeviceChannels;
use crate::fsm::Command;
use crate::fsm::DeviceState;
use crate::fsm::Transition;
use crate::fsm::expand;
use crate::fsm::shutdown_step;
use crate::keyspace::join;
use crate::registry::Consumed;
use crate::registry::PipelineCommand;
use crate::registry::Registry;
use crate::topology::TopologyResolver;

/// Wall-clock and monotonic identity of this process.
struct Health {
    host_name: String,
    host_ip: String,
    created_wall: DateTime<Utc>,
    created_mono: Instant,
}

impl Health {
    /// Current uptime in nanoseconds and the derived update timestamp.
    fn update(&self) -> (u128, DateTime<Utc>) {
        let uptime = self.created_mono.elapsed();
        let updated = self.created_wall + chrono::Duration::from_std(uptime).unwrap_or_default();
        (uptime.as_nanos(), updated)
    }
}

fn to_date(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The per-instance keys this agent owns.
struct AgentKeys {
    presence: String,
    health: String,
    state: String,
    update_time: String,
    option: String,
}

struct AgentInner {
    registry: Arc<dyn Registry>,
    config: AgentConfig,
    uuid: Uuid,
    service: String,
    id: String,
    index: usize,
    health: Health,
    keys: AgentKeys,
    index_hash_slot: (String, String),
    state_tx: watch::Sender<DeviceState>,
    /// Keys deleted wholesale on unregister.
    registered_keys: Mutex<BTreeSet<String>>,
    /// Topology-owned keys; TTL-extended by the liveness task, deleted on
    /// topology reset and on unregister.
    topology_keys: Arc<Mutex<BTreeSet<String>>>,
    flags: CancelFlag,
    /// Stops background tasks when the agent winds down.
    task_cancel: CancellationToken,
    device: tokio::sync::Mutex<Box<dyn Device>>,
    channels: tokio::sync::Mutex<DeviceChannels>,
    topology: TopologyResolver,
    run_number: Mutex<Option<String>>,
}

/// Handle to a registered instance agent. Cloneable; all clones share state.
#[derive(Clone)]
pub struct InstanceAgent {
    inner: Arc<AgentInner>,
}

impl InstanceAgent {
    /// Register this worker in the shared registry and start its liveness
    /// timer. The returned agent is in `Idle`; call [`InstanceAgent::run`]
    /// to serve commands.
    pub async fn register(
        config: AgentConfig,
        registry: Arc<dyn Registry>,
        device: Box<dyn Device>,
    ) -> Result<Self> {
        let uuid = config.uuid.unwrap_or_else(Uuid::new_v4);
        // like a device id, the service name falls back to the executable name
        let service = if config.service_name.is_empty() {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "daq-device".to_string())
        } else {
            config.service_name.clone()
        };
        let host_name = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());
        let host_ip = config.host_ip.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        let sep = config.separator.clone();

        let identity = identity::acquire_index(&registry, &service, uuid, &sep, config.max_ttl)
            .await
            .context("instance index acquisition")?;
        info!(service = %service, id = %identity.instance_id, %uuid, "registered");

        let keys = AgentKeys {
            presence: identity.presence_key.clone(),
            health: join(&[TOP_PREFIX, &service, &identity.instance_id, HEALTH_PREFIX], &sep),
            state: join(&[TOP_PREFIX, &service, &identity.instance_id, FAIRMQ_STATE_PREFIX], &sep),
            update_time: join(&[TOP_PREFIX, &service, &identity.instance_id, UPDATE_TIME_PREFIX], &sep),
            option: join(&[TOP_PREFIX, &service, &identity.instance_id, PROG_OPTION_PREFIX], &sep),
        };

        let health = Health {
            host_name,
            host_ip: host_ip.clone(),
            created_wall: Utc::now(),
            created_mono: Instant::now(),
        };

        let connect_config = match &config.connect_config {
            Some(raw) => Some(
                serde_json::from_str(raw).with_context(|| format!("connect-config is not valid JSON: {raw}"))?,
            ),
            None => None,
        };

        let flags = CancelFlag::new();
        let topology_keys = Arc::new(Mutex::new(BTreeSet::new()));
        let topology = TopologyResolver::new(
            registry.clone(),
            sep.clone(),
            service.clone(),
            identity.instance_id.clone(),
            host_ip,
            config.max_ttl,
            config.enable_uds,
            connect_config,
            config.max_retry_to_resolve_address,
            flags.clone(),
            topology_keys.clone(),
        );

        let mut registered_keys = BTreeSet::new();
        registered_keys.insert(keys.presence.clone());
        registered_keys.insert(keys.health.clone());
        registered_keys.insert(keys.state.clone());
        registered_keys.insert(keys.update_time.clone());
        registered_keys.insert(keys.option.clone());

        let (state_tx, _) = watch::channel(DeviceState::Idle);
        let inner = Arc::new(AgentInner {
            registry,
            config,
            uuid,
            service,
            id: identity.instance_id.clone(),
            index: identity.index,
            health,
            keys,
            index_hash_slot: identity.index_hash_slot,
            state_tx,
            registered_keys: Mutex::new(registered_keys),
            topology_keys,
            flags,
            task_cancel: CancellationToken::new(),
            device: tokio::sync::Mutex::new(device),
            channels: tokio::sync::Mutex::new(DeviceChannels::new()),
            topology,
            run_number: Mutex::new(None),
        });

        let agent = Self { inner };
        agent.write_health().await?;
        agent.write_prog_options().await;
        agent.publish_state(DeviceState::Idle).await;
        agent.spawn_liveness_task();
        Ok(agent)
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.id
    }

    pub fn instance_index(&self) -> usize {
        self.inner.index
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Watch channel following every published state.
    pub fn state_watch(&self) -> watch::Receiver<DeviceState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> DeviceState {
        *self.inner.state_tx.borrow()
    }

    /// Ask the state-control loop to wind down after the current command.
    pub fn request_shutdown(&self) {
        self.inner.flags.request_shutdown();
    }

    /// Drive the agent: walk to the startup state, serve commands until a
    /// terminal command (or [`InstanceAgent::request_shutdown`]), then walk
    /// down to `Exiting` and unregister.
    pub async fn run(&self) -> Result<()> {
        self.run_startup_sequence().await;
        self.subscribe_to_commands().await;
        self.run_shutdown_sequence().await;
        self.unregister().await;
        self.inner.task_cancel.cancel();
        Ok(())
    }

    // ------------------------------------------------------------------
    // state machine
    // ------------------------------------------------------------------

    async fn run_startup_sequence(&self) {
        let target = self.inner.config.startup_state;
        for &transition in target.startup_transitions() {
            if self.inner.flags.shutdown_requested() {
                return;
            }
            if let Err(e) = self.execute(transition).await {
                error!(id = %self.inner.id, ?transition, error = %e, "startup transition failed");
                return;
            }
        }
    }

    async fn run_shutdown_sequence(&self) {
        debug!(id = %self.inner.id, "shutdown sequence");
        while let Some(step) = shutdown_step(self.current_state()) {
            if let Err(e) = self.execute(step).await {
                error!(id = %self.inner.id, ?step, error = %e, "shutdown transition failed");
                break;
            }
        }
        // a device stuck in a transient state still reports Exiting
        let state = self.current_state();
        if state != DeviceState::Error && state != DeviceState::Exiting {
            self.enter_state(DeviceState::Exiting).await;
        }
    }

    /// Apply every single-step transition a command expands to.
    pub async fn apply_command(&self, command: Command) -> Result<()> {
        let steps = expand(self.current_state(), command);
        for transition in steps {
            if self.inner.flags.shutdown_requested() {
                break;
            }
            self.execute(transition).await?;
        }
        Ok(())
    }

    /// Execute one legal transition; a transition without an edge from the
    /// current state is a silent no-op.
    pub async fn execute(&self, transition: Transition) -> Result<()> {
        let current = self.current_state();
        if !transition.accepts_from(current) {
            // `Connecting` only reacts to a reset request
            if current == DeviceState::Connecting && transition == Transition::ResetDevice {
                self.inner.flags.request_reset();
            }
            return Ok(());
        }

        let device_result = match transition {
            Transition::InitDevice => {
                self.enter_state(DeviceState::InitializingDevice).await;
                let mut result = self.inner.topology.initialize().await;
                if result.is_ok() {
                    result = self.inner.device.lock().await.init();
                }
                result
            }
            Transition::CompleteInit => {
                self.enter_state(DeviceState::Initialized).await;
                Ok(())
            }
            Transition::Bind => {
                self.enter_state(DeviceState::Binding).await;
                let mut result = self.bind_channels().await;
                if result.is_ok() {
                    self.enter_state(DeviceState::Bound).await;
                    result = self.inner.topology.on_bound(&*self.inner.channels.lock().await).await;
                }
                result
            }
            Transition::Connect => {
                self.enter_state(DeviceState::Connecting).await;
                let mut result = self.connect_channels().await;
                if result.is_ok() {
                    if self.inner.flags.is_cancelled() {
                        result = Err(anyhow::anyhow!("connect aborted by reset request"));
                    } else {
                        self.enter_state(DeviceState::DeviceReady).await;
                    }
                }
                result
            }
            Transition::InitTask => {
                self.enter_state(DeviceState::InitializingTask).await;
                let result = self.inner.device.lock().await.init_task();
                if result.is_ok() {
                    self.enter_state(DeviceState::Ready).await;
                }
                result
            }
            Transition::Run => {
                let result = self.inner.device.lock().await.run();
                if result.is_ok() {
                    self.enter_state(DeviceState::Running).await;
                    self.write_run_boundary("startTime", "startTimeNs").await;
                }
                result
            }
            Transition::Stop => {
                let result = self.inner.device.lock().await.stop();
                if result.is_ok() {
                    self.enter_state(DeviceState::Ready).await;
                    self.write_run_boundary("stopTime", "stopTimeNs").await;
                }
                result
            }
            Transition::ResetTask => {
                self.enter_state(DeviceState::ResettingTask).await;
                let result = self.inner.device.lock().await.reset_task();
                if result.is_ok() {
                    self.enter_state(DeviceState::DeviceReady).await;
                }
                result
            }
            Transition::ResetDevice => {
                self.inner.flags.request_reset();
                self.enter_state(DeviceState::ResettingDevice).await;
                if let Err(e) = self.inner.topology.reset().await {
                    warn!(id = %self.inner.id, error = %e, "topology reset failed");
                }
                self.inner.channels.lock().await.clear();
                let result = self.inner.device.lock().await.reset_device();
                if result.is_ok() {
                    self.enter_state(DeviceState::Idle).await;
                }
                result
            }
            Transition::End => {
                let result = self.inner.device.lock().await.end();
                if result.is_ok() {
                    self.enter_state(DeviceState::Exiting).await;
                }
                result
            }
        };

        if let Err(e) = device_result {
            error!(id = %self.inner.id, ?transition, error = %e, "device transition failed");
            self.enter_state(DeviceState::Error).await;
        }
        Ok(())
    }

    /// Materialize the bind channels' sub-sockets.
    async fn bind_channels(&self) -> Result<()> {
        let mut channels = self.inner.channels.lock().await;
        for sp in self.inner.topology.bind_channel_list() {
            debug!(id = %self.inner.id, config = %sp.to_channel_config(), "binding channel");
            channels.bind_channel(&sp, &self.inner.health.host_ip, self.inner.index)?;
        }
        drop(channels);
        self.inner.device.lock().await.bind()
    }

    /// Hand the resolved connect addresses to the device side.
    async fn connect_channels(&self) -> Result<()> {
        let mut channels = self.inner.channels.lock().await;
        for sp in self.inner.topology.connect_channel_list() {
            debug!(id = %self.inner.id, config = %sp.to_channel_config(), "connecting channel");
            let addresses: Vec<String> = sp
                .address
                .split(',')
                .filter(|a| !a.is_empty() && *a != "unspecified")
                .map(str::to_string)
                .collect();
            channels.set_connect_addresses(&sp.name, &addresses);
        }
        drop(channels);
        self.inner.device.lock().await.connect()
    }

    /// Publish a new state and run its entry hooks.
    async fn enter_state(&self, state: DeviceState) {
        info!(id = %self.inner.id, state = %state, "state");
        self.inner.state_tx.send_replace(state);
        self.publish_state(state).await;
        self.write_prog_options().await;
        self.read_run_number().await;
        match state {
            DeviceState::Idle => self.inner.flags.clear_reset(),
            DeviceState::Error => self.inner.flags.request_shutdown(),
            _ => {}
        }
    }

    async fn publish_state(&self, state: DeviceState) {
        let inner = &self.inner;
        let result = inner
            .registry
            .pipeline(vec![
                PipelineCommand::SetEx {
                    key: inner.keys.state.clone(),
                    value: state.name().to_string(),
                    ttl: inner.config.max_ttl,
                },
                PipelineCommand::HSet {
                    key: inner.keys.health.clone(),
                    fields: vec![("fair:mq:state".into(), state.name().to_string())],
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(id = %inner.id, error = %e, "state publication failed");
        }
        // best-effort broadcast for anyone following transitions live
        let announcement = serde_json::json!({
            "command": "state_change",
            "value": state.name(),
            "service": inner.service,
            "instance": inner.id,
        })
        .to_string();
        if let Err(e) = inner.registry.publish(STATE_CHANNEL, &announcement).await {
            debug!(id = %inner.id, error = %e, "state broadcast failed");
        }
    }

    /// Record run start/stop instants in the health hash.
    async fn write_run_boundary(&self, time_field: &str, ns_field: &str) {
        let (uptime_ns, updated) = self.inner.health.update();
        let result = self
            .inner
            .registry
            .hset(
                &self.inner.keys.health,
                &[
                    (time_field.to_string(), to_date(updated)),
                    (ns_field.to_string(), uptime_ns.to_string()),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(id = %self.inner.id, field = time_field, error = %e, "run boundary write failed");
        }
    }

    async fn read_run_number(&self) {
        let keys = crate::runinfo::RunInfoKeys::new(self.inner.config.separator.clone());
        match self.inner.registry.get(&keys.run_number()).await {
            Ok(Some(value)) => {
                let mut cached = self.inner.run_number.lock();
                if cached.as_deref() != Some(value.as_str()) {
                    warn!(id = %self.inner.id, run_number = %value, previous = ?cached, "run number updated");
                    *cached = Some(value);
                }
            }
            Ok(None) => error!(id = %self.inner.id, "run_number key not found in the registry"),
            Err(e) => warn!(id = %self.inner.id, error = %e, "run number read failed"),
        }
    }

    /// The run number last observed on a state change.
    pub fn run_number(&self) -> Option<String> {
        self.inner.run_number.lock().clone()
    }

    // ------------------------------------------------------------------
    // registration upkeep
    // ------------------------------------------------------------------

    async fn write_health(&self) -> Result<()> {
        let inner = &self.inner;
        let (uptime_ns, updated) = inner.health.update();
        inner
            .registry
            .pipeline(vec![
                PipelineCommand::HSet {
                    key: inner.keys.health.clone(),
                    fields: vec![
                        ("instanceID".into(), inner.id.clone()),
                        ("uuid".into(), inner.uuid.to_string()),
                        ("hostName".into(), inner.health.host_name.clone()),
                        ("hostIp".into(), inner.health.host_ip.clone()),
                        ("serviceName".into(), inner.service.clone()),
                        ("createdTime".into(), to_date(inner.health.created_wall)),
                        ("updatedTime".into(), to_date(updated)),
                        ("uptime".into(), (uptime_ns / 1_000_000).to_string()),
                    ],
                },
                PipelineCommand::Expire {
                    key: inner.keys.health.clone(),
                    ttl: inner.config.max_ttl,
                },
            ])
            .await
            .context("health registration")
    }

    async fn write_prog_options(&self) {
        let inner = &self.inner;
        let fields = vec![
            ("severity".into(), inner.config.log.severity.clone()),
            ("verbosity".into(), inner.config.log.verbosity.clone()),
            ("color".into(), (inner.config.log.color as u8).to_string()),
            ("log-to-file".into(), inner.config.log.log_to_file.clone()),
            ("id".into(), inner.id.clone()),
            ("transport".into(), inner.config.transport.clone()),
            ("session".into(), inner.config.session.clone()),
        ];
        let result = inner
            .registry
            .pipeline(vec![
                PipelineCommand::HSet {
                    key: inner.keys.option.clone(),
                    fields,
                },
                PipelineCommand::Expire {
                    key: inner.keys.option.clone(),
                    ttl: inner.config.max_ttl,
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(id = %inner.id, error = %e, "option write failed");
        }
    }

    fn spawn_liveness_task(&self) {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(agent.inner.config.ttl_update_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it, registration just ran
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = agent.inner.task_cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                agent.refresh_ttl().await;
            }
            debug!(id = %agent.inner.id, "liveness task stopped");
        });
    }

    /// One liveness refresh: a single pipeline extending every key we own.
    /// Failures are logged and retried on the next tick.
    async fn refresh_ttl(&self) {
        let inner = &self.inner;
        let (uptime_ns, updated) = inner.health.update();
        let date = to_date(updated);
        let ttl = inner.config.max_ttl;
        let mut commands = vec![
            PipelineCommand::HSet {
                key: inner.keys.health.clone(),
                fields: vec![
                    ("updatedTime".into(), date.clone()),
                    ("uptime".into(), (uptime_ns / 1_000_000).to_string()),
                ],
            },
            PipelineCommand::SetEx {
                key: inner.keys.presence.clone(),
                value: inner.uuid.to_string(),
                ttl,
            },
            PipelineCommand::SetEx {
                key: inner.keys.state.clone(),
                value: self.current_state().name().to_string(),
                ttl,
            },
            PipelineCommand::SetEx {
                key: inner.keys.update_time.clone(),
                value: date,
                ttl,
            },
            PipelineCommand::Expire {
                key: inner.keys.health.clone(),
                ttl,
            },
            PipelineCommand::Expire {
                key: inner.keys.option.clone(),
                ttl,
            },
        ];
        for key in inner.topology_keys.lock().iter() {
            commands.push(PipelineCommand::Expire { key: key.clone(), ttl });
        }
        if let Err(e) = inner.registry.pipeline(commands).await {
            warn!(id = %inner.id, error = %e, "liveness refresh failed");
        }
    }

    // ------------------------------------------------------------------
    // command subscription
    // ------------------------------------------------------------------

    async fn subscribe_to_commands(&self) {
        let mut subscription = match self.inner.registry.subscribe(&[COMMAND_CHANNEL.to_string()]).await {
            Ok(s) => s,
            Err(e) => {
                error!(id = %self.inner.id, error = %e, "command subscription failed");
                return;
            }
        };
        debug!(id = %self.inner.id, channel = COMMAND_CHANNEL, "subscribed to commands");

        while !self.inner.flags.shutdown_requested() {
            match subscription.consume().await {
                Ok(Consumed::Timeout) => continue,
                Ok(Consumed::Message { channel, payload }) => {
                    if channel != COMMAND_CHANNEL {
                        continue;
                    }
                    self.handle_command_payload(&payload).await;
                }
                Err(e) => {
                    error!(id = %self.inner.id, error = %e, "command consume failed");
                    break;
                }
            }
        }
        debug!(id = %self.inner.id, "command subscription loop exited");
    }

    async fn handle_command_payload(&self, payload: &str) {
        let message: CommandMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                error!(id = %self.inner.id, error = %e, payload, "malformed command message");
                return;
            }
        };
        if message.command != CommandMessage::CHANGE_STATE {
            error!(id = %self.inner.id, command = %message.command, "unknown command kind");
            return;
        }
        if message.services.is_empty() || message.instances.is_empty() {
            error!(id = %self.inner.id, "command message without services or instances");
            return;
        }
        if !message.applies_to(&self.inner.service, &self.inner.id, &self.inner.config.separator) {
            return;
        }
        let Some(command) = Command::parse(&message.value) else {
            error!(id = %self.inner.id, value = %message.value, "unknown state-change command");
            return;
        };
        debug!(id = %self.inner.id, command = %message.value, "command accepted");
        if let Err(e) = self.apply_command(command).await {
            error!(id = %self.inner.id, error = %e, "command dispatch failed");
        }
        if command.is_terminal() {
            self.inner.flags.request_shutdown();
        }
    }

    // ------------------------------------------------------------------
    // unregistration
    // ------------------------------------------------------------------

    async fn unregister(&self) {
        let inner = &self.inner;
        let mut keys: Vec<String> = inner.registered_keys.lock().iter().cloned().collect();
        keys.extend(inner.topology_keys.lock().iter().cloned());
        match inner.registry.del(&keys).await {
            Ok(n) => debug!(id = %inner.id, n, "registered keys deleted"),
            Err(e) => error!(id = %inner.id, error = %e, "unregister failed"),
        }
        let (hash_key, field) = &inner.index_hash_slot;
        if let Err(e) = inner.registry.hdel(hash_key, &[field.clone()]).await {
            error!(id = %inner.id, error = %e, "instance index release failed");
        }
        info!(id = %inner.id, "unregistered");
    }
}
