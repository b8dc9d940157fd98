//! The worker-device seam.
//!
//! Concrete services implement [`Device`] and register a constructor under a
//! kind name; the agent drives the callbacks from its state machine. Every
//! callback defaults to a no-op so a service implements only what it needs.
//! Payload handling itself is the device's business and stays out of the
//! control plane.

use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::Result;
use anyhow::bail;
use tracing::debug;

use crate::topology::SocketProperty;

/// Worker-device lifecycle callbacks, invoked on the matching transitions.
pub trait Device: Send {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }
    fn bind(&mut self) -> Result<()> {
        Ok(())
    }
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }
    fn init_task(&mut self) -> Result<()> {
        Ok(())
    }
    fn run(&mut self) -> Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn reset_task(&mut self) -> Result<()> {
        Ok(())
    }
    fn reset_device(&mut self) -> Result<()> {
        Ok(())
    }
    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

type Constructor = fn() -> Box<dyn Device>;

/// Registry of device constructors keyed by kind name, populated at process
/// init.
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock devices.
    pub fn with_stock_devices() -> Self {
        let mut registry = Self::new();
        registry.register("null", || Box::new(NullDevice));
        registry.register("sampler", || Box::new(Sampler::default()));
        registry.register("sink", || Box::new(Sink::default()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn create(&self, kind: &str) -> Result<Box<dyn Device>> {
        match self.constructors.get(kind) {
            Some(constructor) => Ok(constructor()),
            None => bail!("unknown device kind: {kind}"),
        }
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

/// A device that takes part in every transition and does nothing.
pub struct NullDevice;

impl Device for NullDevice {}

/// Stock source device stub.
#[derive(Default)]
pub struct Sampler {
    runs: u64,
}

impl Device for Sampler {
    fn run(&mut self) -> Result<()> {
        self.runs += 1;
        debug!(runs = self.runs, "sampler started");
        Ok(())
    }
}

/// Stock sink device stub.
#[derive(Default)]
pub struct Sink {
    runs: u64,
}

impl Device for Sink {
    fn run(&mut self) -> Result<()> {
        self.runs += 1;
        debug!(runs = self.runs, "sink started");
        Ok(())
    }
}

/// One live sub-socket of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSocket {
    pub index: usize,
    pub address: String,
    pub bound: bool,
}

/// The transport-facing side of an instance's channels.
///
/// Bind channels materialize their sub-sockets here when the device binds;
/// connect channels receive their resolved peer addresses. Ports for
/// unspecified tcp addresses are allocated deterministically from the channel's
/// port range and the instance index, so instances of one service on one host
/// do not collide.
#[derive(Default)]
pub struct DeviceChannels {
    channels: BTreeMap<String, Vec<SubSocket>>,
}

/// Ports reserved per instance inside a channel's port range.
const PORTS_PER_INSTANCE: usize = 16;

impl DeviceChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the sub-sockets of a bind channel and mark them bound.
    /// Pre-set addresses (UDS or explicit) are consumed in order; remaining
    /// slots get tcp addresses from the port range.
    pub fn bind_channel(
        &mut self,
        sp: &SocketProperty,
        host_ip: &str,
        instance_index: usize,
    ) -> Result<&[SubSocket]> {
        let n = sp.num_sockets.max(1);
        let preset: Vec<&str> = sp
            .address
            .split(',')
            .filter(|a| !a.is_empty() && *a != "unspecified")
            .collect();
        let mut sockets = Vec::with_capacity(n);
        for i in 0..n {
            let address = match preset.get(i) {
                Some(a) => (*a).to_string(),
                None => {
                    let port = sp.port_range_min as usize + instance_index * PORTS_PER_INSTANCE + i;
                    if port > sp.port_range_max as usize {
                        bail!(
                            "channel {}: port range {}..{} exhausted at sub-socket {i}",
                            sp.name,
                            sp.port_range_min,
                            sp.port_range_max
                        );
                    }
                    format!("tcp://{host_ip}:{port}")
                }
            };
            sockets.push(SubSocket {
                index: i,
                address,
                bound: true,
            });
        }
        debug!(channel = %sp.name, n, "bound channel");
        self.channels.insert(sp.name.clone(), sockets);
        Ok(self.channels[&sp.name].as_slice())
    }

    /// Record the resolved peer addresses of a connect channel.
    pub fn set_connect_addresses(&mut self, name: &str, addresses: &[String]) {
        let sockets = addresses
            .iter()
            .enumerate()
            .map(|(index, address)| SubSocket {
                index,
                address: address.clone(),
                bound: false,
            })
            .collect();
        self.channels.insert(name.to_string(), sockets);
    }

    pub fn get(&self, name: &str) -> Option<&[SubSocket]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
