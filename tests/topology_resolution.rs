//! Topology scenarios: fan-out matchmaking and bind-before-connect.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use nestdaq::fsm::DeviceState;
use nestdaq::fsm::StartupState;

use common::provision_endpoint;
use common::provision_link;
use common::registry;
use common::register_agent_with_startup;
use common::start_agent;
use common::wait_for_state;

#[tokio::test]
async fn one_to_n_fanout_assigns_distinct_subsockets() {
    let r = registry();
    r.set("run_info:run_number", "1").await.unwrap();
    provision_endpoint(
        &r,
        "A",
        "out",
        &[
            ("type", "push"),
            ("method", "bind"),
            ("numSockets", "0"),
            ("autoSubChannel", "true"),
        ],
    )
    .await;
    provision_endpoint(&r, "B", "in", &[("type", "pull"), ("method", "connect")]).await;
    provision_link(&r, "A", "out", "B", "in").await;

    // register everyone first so each side sees the other's presence
    let a0 = register_agent_with_startup(&r, "A", StartupState::DeviceReady).await;
    let b0 = register_agent_with_startup(&r, "B", StartupState::DeviceReady).await;
    let b1 = register_agent_with_startup(&r, "B", StartupState::DeviceReady).await;
    let b2 = register_agent_with_startup(&r, "B", StartupState::DeviceReady).await;
    for agent in [&a0, &b0, &b1, &b2] {
        start_agent(agent);
    }

    for agent in [&a0, &b0, &b1, &b2] {
        let mut rx = agent.state_watch();
        wait_for_state(&mut rx, DeviceState::DeviceReady, Duration::from_secs(20)).await;
    }

    // the bind side fanned out into one sub-socket per consumer
    let sub_sockets = r.scan("daq_service:A:A-0:socket:chans.out.*").await.unwrap();
    assert_eq!(sub_sockets.len(), 3);
    let mut bind_addresses = Vec::new();
    for key in &sub_sockets {
        bind_addresses.push(r.hget(key, "address").await.unwrap().unwrap());
    }
    assert_eq!(
        bind_addresses.iter().collect::<HashSet<_>>().len(),
        3,
        "bind addresses must be distinct: {bind_addresses:?}"
    );

    // the channel hash announces the fan-out and its completion
    let channel = r.hgetall("daq_service:A:A-0:channel:out").await.unwrap();
    assert_eq!(channel["numSockets"], "3");
    assert_eq!(channel["bound"], "1");

    // each consumer picked the sub-socket at its position in the peer list
    let peer_list = r.lrange("daq_service:A:A-0:channel:out:peer").await.unwrap();
    assert_eq!(peer_list.len(), 3);
    let mut seen = HashSet::new();
    for b in [&b0, &b1, &b2] {
        let my_channel_key = format!("daq_service:B:{}:channel:in", b.instance_id());
        let position = peer_list
            .iter()
            .position(|p| p == &my_channel_key)
            .expect("consumer missing from the peer list");

        let socket_key = format!("daq_service:B:{}:socket:chans.in.0", b.instance_id());
        let address = r.hget(&socket_key, "address").await.unwrap().unwrap();
        assert_eq!(address, bind_addresses[position], "wrong sub-socket for {}", b.instance_id());
        assert!(seen.insert(address), "two consumers share a sub-socket");
    }
}

#[tokio::test]
async fn single_pair_resolves_one_to_one() {
    let r = registry();
    r.set("run_info:run_number", "1").await.unwrap();
    provision_endpoint(
        &r,
        "Src",
        "data",
        &[("type", "push"), ("method", "bind"), ("numSockets", "1")],
    )
    .await;
    provision_endpoint(&r, "Dst", "data", &[("type", "pull"), ("method", "connect")]).await;
    provision_link(&r, "Src", "data", "Dst", "data").await;

    let src = register_agent_with_startup(&r, "Src", StartupState::DeviceReady).await;
    let dst = register_agent_with_startup(&r, "Dst", StartupState::DeviceReady).await;
    start_agent(&src);
    start_agent(&dst);
    for agent in [&src, &dst] {
        let mut rx = agent.state_watch();
        wait_for_state(&mut rx, DeviceState::DeviceReady, Duration::from_secs(20)).await;
    }

    let bind_address = r
        .hget("daq_service:Src:Src-0:socket:chans.data.0", "address")
        .await
        .unwrap()
        .unwrap();
    let connect_address = r
        .hget("daq_service:Dst:Dst-0:socket:chans.data.0", "address")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bind_address, connect_address);
    assert!(connect_address.starts_with("tcp://"));
}

#[tokio::test]
async fn reset_device_clears_topology_keys() {
    let r = registry();
    r.set("run_info:run_number", "1").await.unwrap();
    provision_endpoint(
        &r,
        "Solo",
        "out",
        &[("type", "push"), ("method", "bind"), ("numSockets", "1")],
    )
    .await;
    provision_endpoint(&r, "Peer", "in", &[("type", "pull"), ("method", "connect")]).await;
    provision_link(&r, "Solo", "out", "Peer", "in").await;

    let solo = register_agent_with_startup(&r, "Solo", StartupState::DeviceReady).await;
    let peer = register_agent_with_startup(&r, "Peer", StartupState::DeviceReady).await;
    start_agent(&solo);
    start_agent(&peer);
    for agent in [&solo, &peer] {
        let mut rx = agent.state_watch();
        wait_for_state(&mut rx, DeviceState::DeviceReady, Duration::from_secs(20)).await;
    }
    assert!(!r.scan("daq_service:Solo:Solo-0:socket:*").await.unwrap().is_empty());

    common::publish_command(&r, "RESET DEVICE", &["Solo"], &["all"]).await;
    let mut rx = solo.state_watch();
    wait_for_state(&mut rx, DeviceState::Idle, Duration::from_secs(10)).await;

    assert!(r.scan("daq_service:Solo:Solo-0:socket:*").await.unwrap().is_empty());
    assert!(r.scan("daq_service:Solo:Solo-0:channel:*").await.unwrap().is_empty());
}
