//! Shared fixtures for the scenario tests.
//!
//! Everything runs against the in-memory registry backend with shortened
//! TTLs so liveness expiry can be exercised in test time.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use nestdaq::agent::InstanceAgent;
use nestdaq::config::AgentConfig;
use nestdaq::device::NullDevice;
use nestdaq::fsm::DeviceState;
use nestdaq::fsm::StartupState;
use nestdaq::keyspace::join;
use nestdaq::registry::MemoryRegistry;
use nestdaq::registry::Registry;
use tokio::sync::watch;

pub fn registry() -> Arc<dyn Registry> {
    MemoryRegistry::new()
}

/// Agent configuration with test-friendly timings.
pub fn agent_config(service: &str) -> AgentConfig {
    AgentConfig {
        service_name: service.to_string(),
        max_ttl: Duration::from_secs(2),
        ttl_update_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Register an agent driving a null device, without starting its
/// state-control loop yet.
pub async fn register_agent(registry: &Arc<dyn Registry>, config: AgentConfig) -> InstanceAgent {
    InstanceAgent::register(config, registry.clone(), Box::new(NullDevice))
        .await
        .expect("agent registration")
}

/// Start serving commands (startup walk included) in a background task.
pub fn start_agent(agent: &InstanceAgent) {
    let agent = agent.clone();
    tokio::spawn(async move {
        let _ = agent.run().await;
    });
}

/// Register an agent and start serving commands.
pub async fn spawn_agent(registry: &Arc<dyn Registry>, config: AgentConfig) -> InstanceAgent {
    let agent = register_agent(registry, config).await;
    start_agent(&agent);
    agent
}

pub async fn register_agent_with_startup(
    registry: &Arc<dyn Registry>,
    service: &str,
    startup_state: StartupState,
) -> InstanceAgent {
    let config = AgentConfig {
        startup_state,
        ..agent_config(service)
    };
    register_agent(registry, config).await
}

/// Block until the agent publishes `target`, failing after `timeout`.
pub async fn wait_for_state(rx: &mut watch::Receiver<DeviceState>, target: DeviceState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if *rx.borrow() == target {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            !remaining.is_zero(),
            "state {target} not reached within {timeout:?} (currently {})",
            *rx.borrow()
        );
        tokio::select! {
            changed = rx.changed() => changed.expect("state channel closed"),
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

/// Poll an async predicate until it holds, failing after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        assert!(Instant::now() < deadline, "{what} did not happen within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Write a provisioned endpoint entry for `service`'s `channel`.
pub async fn provision_endpoint(
    registry: &Arc<dyn Registry>,
    service: &str,
    channel: &str,
    fields: &[(&str, &str)],
) {
    let key = join(&["daq_service", "topology", "endpoint", service, channel], ":");
    let fields: Vec<(String, String)> = fields
        .iter()
        .map(|(f, v)| (f.to_string(), v.to_string()))
        .collect();
    registry.hset(&key, &fields).await.expect("endpoint provisioning");
}

/// Declare a link between two service channels.
pub async fn provision_link(
    registry: &Arc<dyn Registry>,
    service_a: &str,
    channel_a: &str,
    service_b: &str,
    channel_b: &str,
) {
    let key = format!("daq_service:topology:link:{service_a}:{channel_a},{service_b}:{channel_b}");
    registry.set(&key, "").await.expect("link provisioning");
}

/// Publish a state-change command on the command channel.
pub async fn publish_command(registry: &Arc<dyn Registry>, value: &str, services: &[&str], instances: &[&str]) {
    let message = serde_json::json!({
        "command": "change_state",
        "value": value,
        "services": services,
        "instances": instances,
    });
    registry
        .publish("daqctl", &message.to_string())
        .await
        .expect("command publication");
}
