//! Client command handling and publish-with-barrier sequencing.
//!
//! Browser clients submit small JSON commands over their WebSocket session;
//! a single function table maps command names to handlers. State-changing
//! commands are fanned out on the `daqctl` channel, with barrier waits
//! inserted for the semantically ordered ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::hub::SessionHub;
use crate::agent::CommandMessage;
use crate::constants::COMMAND_CHANNEL;
use crate::constants::FAIRMQ_STATE_PREFIX;
use crate::constants::KNOWN_COMMANDS;
use crate::constants::TOP_PREFIX;
use crate::constants::fairmq_command;
use crate::constants::run_info;
use crate::keyspace::join;
use crate::registry::Registry;
use crate::runinfo::RunInfoKeys;
use crate::runinfo::SETTABLE_RUN_INFO;

/// Barrier poll cadence.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// States accepted by the `wait-device-ready` barrier.
const DEVICE_READY_TARGETS: [&str; 3] = ["DeviceReady", "Ready", "Running"];
/// States accepted by the `wait-ready` barrier.
const READY_TARGETS: [&str; 2] = ["Ready", "Running"];

/// A command as submitted by a browser client.
#[derive(Debug, Deserialize)]
pub struct ClientRequest {
    pub command: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub instances: Vec<String>,
}

/// Shell hooks around RUN/STOP publication.
#[derive(Debug, Clone, Default)]
pub struct RunHooks {
    pub pre_run: String,
    pub post_run: String,
    pub pre_stop: String,
    pub post_stop: String,
}

/// Handler state shared by every client session.
pub struct CommandHandler {
    registry: Arc<dyn Registry>,
    separator: String,
    run_info: RunInfoKeys,
    sessions: Arc<SessionHub>,
    hooks: RunHooks,
    cancel: CancellationToken,
}

impl CommandHandler {
    pub fn new(
        registry: Arc<dyn Registry>,
        separator: impl Into<String>,
        sessions: Arc<SessionHub>,
        hooks: RunHooks,
        cancel: CancellationToken,
    ) -> Self {
        let separator = separator.into();
        Self {
            registry,
            run_info: RunInfoKeys::new(separator.clone()),
            separator,
            sessions,
            hooks,
            cancel,
        }
    }

    /// Dispatch one raw client message. Bad input is logged and dropped.
    pub async fn process(&self, conn_id: u64, raw: &str) {
        debug!(conn_id, raw, "client message");
        let request: ClientRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                error!(conn_id, error = %e, "malformed client message");
                return;
            }
        };
        match request.command.as_str() {
            "redis-publish" => self.publish_daq_command(conn_id, &request).await,
            "redis-get" => self.redis_get(conn_id, &request).await,
            "redis-set" => self.redis_set(conn_id, &request).await,
            "redis-incr" => self.redis_incr(conn_id, &request).await,
            other => error!(conn_id, command = other, "unknown client command"),
        }
    }

    async fn reply(&self, conn_id: u64, kind: &str, value: &str) {
        let message = json!({ "type": kind, "value": value }).to_string();
        self.sessions.send(conn_id, &message).await;
    }

    async fn reply_error(&self, conn_id: u64, message: &str) {
        self.reply(conn_id, "error", message).await;
    }

    // ------------------------------------------------------------------
    // run_info plumbing
    // ------------------------------------------------------------------

    async fn redis_get(&self, conn_id: u64, request: &ClientRequest) {
        if request.value.as_deref() != Some(run_info::RUN_NUMBER) {
            return;
        }
        match self.registry.get(&self.run_info.run_number()).await {
            Ok(Some(value)) => self.reply(conn_id, "set run_number", &value).await,
            _ => {
                self.reply_error(conn_id, "could not get run number from the registry").await;
            }
        }
        match self.registry.get(&self.run_info.latest_run_number()).await {
            Ok(Some(value)) => self.reply(conn_id, "set latest_run_number", &value).await,
            _ => {
                self.reply_error(conn_id, "could not get latest run number from the registry").await;
            }
        }
    }

    async fn redis_set(&self, conn_id: u64, request: &ClientRequest) {
        let Some(name) = request.name.as_deref() else {
            error!(conn_id, "redis-set without a name");
            return;
        };
        if !SETTABLE_RUN_INFO.contains(&name) {
            warn!(conn_id, name, "redis-set outside the whitelist");
            return;
        }
        let Some(value) = request.value.as_deref() else {
            error!(conn_id, name, "redis-set without a value");
            return;
        };
        if let Err(e) = self.registry.set(&self.run_info.key(name), value).await {
            warn!(conn_id, name, error = %e, "redis-set failed");
        }
    }

    async fn redis_incr(&self, conn_id: u64, request: &ClientRequest) {
        if request.value.as_deref() != Some(run_info::RUN_NUMBER) {
            return;
        }
        match self.registry.incr(&self.run_info.run_number()).await {
            Ok(value) => self.reply(conn_id, "set run_number", &value.to_string()).await,
            Err(e) => {
                warn!(conn_id, error = %e, "run number increment failed");
                self.reply_error(conn_id, "could not increment run number").await;
            }
        }
    }

    /// Copy `run_number` into `latest_run_number` and echo it back.
    async fn copy_latest_run_number(&self, conn_id: u64) {
        let value = match self.registry.get(&self.run_info.run_number()).await {
            Ok(Some(value)) => value,
            _ => {
                self.reply_error(conn_id, "could not get run number from the registry").await;
                return;
            }
        };
        if let Err(e) = self.registry.set(&self.run_info.latest_run_number(), &value).await {
            warn!(conn_id, error = %e, "latest run number write failed");
            return;
        }
        self.reply(conn_id, "set latest_run_number", &value).await;
    }

    /// Stamp a run boundary under `run_info`.
    async fn stamp_run_info(&self, time_name: &str, ns_name: &str) {
        let now = chrono::Utc::now();
        let date = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let ns = now.timestamp_nanos_opt().unwrap_or_default().to_string();
        for (name, value) in [(time_name, date), (ns_name, ns)] {
            if let Err(e) = self.registry.set(&self.run_info.key(name), &value).await {
                warn!(name, error = %e, "run boundary write failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // publish with barrier
    // ------------------------------------------------------------------

    async fn publish_daq_command(&self, conn_id: u64, request: &ClientRequest) {
        let Some(value) = request.value.as_deref() else {
            error!(conn_id, "redis-publish without a value");
            return;
        };
        if value.eq_ignore_ascii_case(fairmq_command::RUN) {
            self.copy_latest_run_number(conn_id).await;
        }
        if !KNOWN_COMMANDS.contains(&value) {
            warn!(conn_id, value, "not a known command, dropping");
            return;
        }

        let wait_device_ready = self
            .run_info
            .wait_flag(&self.registry, run_info::WAIT_DEVICE_READY)
            .await
            .unwrap_or(false);
        let wait_ready = self
            .run_info
            .wait_flag(&self.registry, run_info::WAIT_READY)
            .await
            .unwrap_or(false);
        let services: HashSet<String> = request.services.iter().cloned().collect();
        let instances: HashSet<String> = request.instances.iter().cloned().collect();

        if value.eq_ignore_ascii_case(fairmq_command::CONNECT) {
            self.publish(fairmq_command::CONNECT, request).await;
            if wait_device_ready {
                self.wait(&services, &instances, &DEVICE_READY_TARGETS).await;
            }
        } else if value.eq_ignore_ascii_case(fairmq_command::INIT_TASK) {
            if wait_device_ready {
                self.publish(fairmq_command::CONNECT, request).await;
                self.wait(&services, &instances, &DEVICE_READY_TARGETS).await;
            }
            self.publish(fairmq_command::INIT_TASK, request).await;
            if wait_ready {
                self.wait(&services, &instances, &READY_TARGETS).await;
            }
        } else if value.eq_ignore_ascii_case(fairmq_command::RUN) {
            if wait_device_ready {
                self.publish(fairmq_command::CONNECT, request).await;
                self.wait(&services, &instances, &DEVICE_READY_TARGETS).await;
            }
            if wait_ready {
                self.publish(fairmq_command::INIT_TASK, request).await;
                self.wait(&services, &instances, &READY_TARGETS).await;
            }
            self.run_hook("pre-run", &self.hooks.pre_run).await;
            self.stamp_run_info(run_info::START_TIME, run_info::START_TIME_NS).await;
            self.publish(fairmq_command::RUN, request).await;
            self.run_hook("post-run", &self.hooks.post_run).await;
        } else if value.eq_ignore_ascii_case(fairmq_command::STOP) {
            self.run_hook("pre-stop", &self.hooks.pre_stop).await;
            self.publish(fairmq_command::STOP, request).await;
            self.stamp_run_info(run_info::STOP_TIME, run_info::STOP_TIME_NS).await;
            self.run_hook("post-stop", &self.hooks.post_stop).await;
        } else {
            self.publish(value, request).await;
        }
    }

    async fn publish(&self, value: &str, request: &ClientRequest) {
        let message = CommandMessage::change_state(value, request.services.clone(), request.instances.clone());
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "command serialization failed");
                return;
            }
        };
        match self.registry.publish(COMMAND_CHANNEL, &payload).await {
            Ok(receivers) => debug!(value, receivers, "command published"),
            Err(e) => warn!(value, error = %e, "command publication failed"),
        }
    }

    /// Run a shell hook; the exit status is logged and ignored.
    async fn run_hook(&self, label: &str, command: &str) {
        if command.is_empty() {
            return;
        }
        debug!(label, command, "running hook");
        match tokio::process::Command::new("sh").arg("-c").arg(command).status().await {
            Ok(status) => debug!(label, %status, "hook finished"),
            Err(e) => warn!(label, error = %e, "hook failed to start"),
        }
    }

    // ------------------------------------------------------------------
    // barrier wait
    // ------------------------------------------------------------------

    /// Poll until every targeted instance's state equals one single state
    /// from `targets`. Returns immediately when the target scan is empty.
    pub async fn wait(&self, services: &HashSet<String>, instances: &HashSet<String>, targets: &[&str]) {
        let patterns: Vec<String> = if services.contains("all") {
            vec![join(&["*", "*"], &self.separator)]
        } else if instances.contains("all") {
            services
                .iter()
                .map(|service| join(&[service, "*"], &self.separator))
                .collect()
        } else {
            instances.iter().cloned().collect()
        };

        loop {
            let mut state_keys = Vec::new();
            for pattern in &patterns {
                let full = join(&[TOP_PREFIX, pattern, FAIRMQ_STATE_PREFIX], &self.separator);
                match self.registry.scan(&full).await {
                    Ok(keys) => state_keys.extend(keys),
                    Err(e) => {
                        warn!(pattern = %full, error = %e, "barrier scan failed");
                        return;
                    }
                }
            }
            if state_keys.is_empty() {
                return;
            }
            state_keys.sort();
            state_keys.dedup();

            let states: Vec<String> = match self.registry.mget(&state_keys).await {
                Ok(values) => values.into_iter().flatten().collect(),
                Err(e) => {
                    warn!(error = %e, "barrier mget failed");
                    return;
                }
            };
            for target in targets {
                if states.iter().all(|s| s == target) {
                    debug!(target, "barrier satisfied");
                    return;
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn handler(registry: Arc<dyn Registry>) -> (CommandHandler, Arc<SessionHub>) {
        let sessions = Arc::new(SessionHub::new());
        let handler = CommandHandler::new(
            registry,
            ":",
            sessions.clone(),
            RunHooks::default(),
            CancellationToken::new(),
        );
        (handler, sessions)
    }

    #[tokio::test]
    async fn incr_then_get_roundtrip() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        registry.set("run_info:run_number", "41").await.unwrap();
        let (handler, sessions) = handler(registry);
        let (conn, mut rx) = sessions.register();

        handler
            .process(conn, r#"{"command":"redis-incr","value":"run_number"}"#)
            .await;
        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "set run_number");
        assert_eq!(reply["value"], "42");

        handler.process(conn, r#"{"command":"redis-get","value":"run_number"}"#).await;
        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "set run_number");
        assert_eq!(reply["value"], "42");
        // latest_run_number has never been set
        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn set_respects_whitelist() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        let (handler, sessions) = handler(registry.clone());
        let (conn, _rx) = sessions.register();

        handler
            .process(conn, r#"{"command":"redis-set","name":"wait-ready","value":"1"}"#)
            .await;
        assert_eq!(registry.get("run_info:wait-ready").await.unwrap().as_deref(), Some("1"));

        handler
            .process(conn, r#"{"command":"redis-set","name":"latest_run_number","value":"9"}"#)
            .await;
        assert_eq!(registry.get("run_info:latest_run_number").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_fans_out_change_state() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        let mut sub = registry
            .subscribe(&[COMMAND_CHANNEL.to_string()])
            .await
            .unwrap();
        let (handler, sessions) = handler(registry);
        let (conn, _rx) = sessions.register();

        handler
            .process(
                conn,
                r#"{"command":"redis-publish","value":"INIT DEVICE","services":["Sampler"],"instances":["all"]}"#,
            )
            .await;
        loop {
            match sub.consume().await.unwrap() {
                crate::registry::Consumed::Message { payload, .. } => {
                    let message: CommandMessage = serde_json::from_str(&payload).unwrap();
                    assert_eq!(message.command, "change_state");
                    assert_eq!(message.value, "INIT DEVICE");
                    assert_eq!(message.services, vec!["Sampler"]);
                    break;
                }
                crate::registry::Consumed::Timeout => continue,
            }
        }
    }

    #[tokio::test]
    async fn unknown_publish_value_is_dropped() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        let mut sub = registry.subscribe(&[COMMAND_CHANNEL.to_string()]).await.unwrap();
        let (handler, sessions) = handler(registry);
        let (conn, _rx) = sessions.register();
        handler
            .process(conn, r#"{"command":"redis-publish","value":"DESTROY","services":["all"],"instances":["all"]}"#)
            .await;
        assert!(matches!(
            sub.consume().await.unwrap(),
            crate::registry::Consumed::Timeout
        ));
    }

    #[tokio::test]
    async fn wait_returns_when_all_targets_reach_state() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        registry
            .set("daq_service:Foo:Foo-0:fair:mq:state", "Bound")
            .await
            .unwrap();
        let (handler, _sessions) = handler(registry.clone());

        let flip = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                registry
                    .set("daq_service:Foo:Foo-0:fair:mq:state", "DeviceReady")
                    .await
                    .unwrap();
            })
        };

        let services: HashSet<String> = ["Foo".to_string()].into();
        let instances: HashSet<String> = ["all".to_string()].into();
        let start = std::time::Instant::now();
        handler.wait(&services, &instances, &DEVICE_READY_TARGETS).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        flip.await.unwrap();
    }

    #[tokio::test]
    async fn wait_with_no_matching_instances_returns_immediately() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        let (handler, _sessions) = handler(registry);
        let services: HashSet<String> = ["Ghost".to_string()].into();
        let instances: HashSet<String> = ["all".to_string()].into();
        handler.wait(&services, &instances, &READY_TARGETS).await;
    }
}
