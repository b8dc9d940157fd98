//! Controller scenarios: barrier waits, RUN sequencing, summary broadcast.

mod common;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use nestdaq::ControllerHub;
use nestdaq::config::ControllerConfig;
use nestdaq::registry::Consumed;
use nestdaq::registry::Registry;

use common::registry;
use common::wait_until;

async fn hub_with(r: &Arc<dyn Registry>, config: ControllerConfig) -> Arc<ControllerHub> {
    ControllerHub::new(config, r.clone()).await.unwrap()
}

/// A stand-in instance that flips its state key when it sees a command.
fn fake_instance(r: Arc<dyn Registry>, service: &str, instance: &str, on_command: &str, new_state: &str) {
    let state_key = format!("daq_service:{service}:{instance}:fair:mq:state");
    let on_command = on_command.to_string();
    let new_state = new_state.to_string();
    tokio::spawn(async move {
        let mut sub = r.subscribe(&["daqctl".to_string()]).await.unwrap();
        loop {
            match sub.consume().await {
                Ok(Consumed::Message { payload, .. }) => {
                    let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
                    if v["value"] == on_command.as_str() {
                        // a real device takes a moment to transition
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        r.set(&state_key, &new_state).await.unwrap();
                        break;
                    }
                }
                Ok(Consumed::Timeout) => continue,
                Err(_) => break,
            }
        }
    });
}

#[tokio::test]
async fn connect_with_barrier_returns_after_device_ready() {
    let r = registry();
    r.set("run_info:wait-device-ready", "true").await.unwrap();
    r.set("daq_service:Foo:Foo-0:fair:mq:state", "Bound").await.unwrap();
    fake_instance(r.clone(), "Foo", "Foo-0", "CONNECT", "DeviceReady");
    // let the stand-in establish its subscription before publishing
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hub = hub_with(&r, ControllerConfig::default()).await;
    let (conn, _rx) = hub.sessions().register();

    let start = Instant::now();
    hub.process_client_message(
        conn,
        r#"{"command":"redis-publish","value":"CONNECT","services":["Foo"],"instances":["all"]}"#,
    )
    .await;
    // the handler blocked until the fake device reached DeviceReady
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert_eq!(
        r.get("daq_service:Foo:Foo-0:fair:mq:state").await.unwrap().as_deref(),
        Some("DeviceReady")
    );
}

#[tokio::test]
async fn run_sequencing_increments_copies_and_hooks() {
    let r = registry();
    r.set("run_info:run_number", "41").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let hook_log = dir.path().join("hooks.log");
    let config = ControllerConfig {
        pre_run: format!("echo pre >> {}", hook_log.display()),
        post_run: format!("echo post >> {}", hook_log.display()),
        ..Default::default()
    };
    let hub = hub_with(&r, config).await;
    let (conn, mut rx) = hub.sessions().register();

    let mut sub = r.subscribe(&["daqctl".to_string()]).await.unwrap();

    // the client bumps the run number first, then requests RUN
    hub.process_client_message(conn, r#"{"command":"redis-incr","value":"run_number"}"#)
        .await;
    let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply["type"], "set run_number");
    assert_eq!(reply["value"], "42");

    hub.process_client_message(
        conn,
        r#"{"command":"redis-publish","value":"RUN","services":["all"],"instances":["all"]}"#,
    )
    .await;

    // the new run number was copied and echoed before RUN went out
    let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply["type"], "set latest_run_number");
    assert_eq!(reply["value"], "42");
    assert_eq!(r.get("run_info:latest_run_number").await.unwrap().as_deref(), Some("42"));

    // RUN reached the command channel
    let payload = loop {
        match sub.consume().await.unwrap() {
            Consumed::Message { payload, .. } => break payload,
            Consumed::Timeout => continue,
        }
    };
    let message: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(message["value"], "RUN");

    // hooks ran around the publication, in order
    let log = std::fs::read_to_string(&hook_log).unwrap();
    assert_eq!(log, "pre\npost\n");

    // the controller stamped the run start
    assert!(r.get("run_info:start_time").await.unwrap().is_some());
    assert!(r.get("run_info:start_time_ns").await.unwrap().is_some());
}

#[tokio::test]
async fn stop_runs_hooks_and_stamps_stop_time() {
    let r = registry();
    let dir = tempfile::tempdir().unwrap();
    let hook_log = dir.path().join("hooks.log");
    let config = ControllerConfig {
        pre_stop: format!("echo pre-stop >> {}", hook_log.display()),
        post_stop: format!("echo post-stop >> {}", hook_log.display()),
        ..Default::default()
    };
    let hub = hub_with(&r, config).await;
    let (conn, _rx) = hub.sessions().register();

    hub.process_client_message(
        conn,
        r#"{"command":"redis-publish","value":"STOP","services":["all"],"instances":["all"]}"#,
    )
    .await;

    let log = std::fs::read_to_string(&hook_log).unwrap();
    assert_eq!(log, "pre-stop\npost-stop\n");
    assert!(r.get("run_info:stop_time").await.unwrap().is_some());
}

#[tokio::test]
async fn summary_table_is_broadcast_to_sessions() {
    let r = registry();
    r.set("daq_service:Foo:Foo-0:fair:mq:state", "Running").await.unwrap();
    r.set("daq_service:Foo:Foo-0:update-time", "2026-08-02T10:00:00.000Z")
        .await
        .unwrap();

    let config = ControllerConfig {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let hub = hub_with(&r, config).await;
    hub.start_background_tasks();
    let (_conn, mut rx) = hub.sessions().register();

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no summary broadcast")
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
    assert_eq!(parsed["type"], "state-summary-table");
    let services = parsed["services"].as_array().unwrap();
    assert_eq!(services[0]["service"], "Foo");
    assert_eq!(services[0]["instances"][0]["state"], "Running");

    hub.shutdown();
}

#[tokio::test]
async fn expiry_reaction_is_wired_into_the_hub() {
    let r = registry();
    r.hsetnx("daq_service:service-instance-index:Foo", "0", "u1").await.unwrap();
    let hub = hub_with(&r, ControllerConfig::default()).await;
    hub.start_background_tasks();
    // let the expiry listener establish its subscription first
    tokio::time::sleep(Duration::from_millis(100)).await;

    // presence vanishes without cleanup; the hub must release the slot
    r.set_ex("daq_service:Foo:Foo-0:presence", "u1", Duration::from_millis(100))
        .await
        .unwrap();

    let r2 = r.clone();
    wait_until(Duration::from_secs(5), "slot release", move || {
        let r = r2.clone();
        async move {
            r.hgetall("daq_service:service-instance-index:Foo")
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    hub.shutdown();
}
