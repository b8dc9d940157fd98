//! Control plane for a distributed data-acquisition framework.
//!
//! A fleet of worker *instances* registers in a shared key/value registry,
//! keeps TTL'd liveness keys refreshed, and drives a per-device state
//! machine from commands broadcast on a pub/sub channel. A central
//! *controller* aggregates instance state for browser clients and turns
//! their commands into ordered broadcasts with barrier waits. A *topology
//! resolver* inside every instance turns provisioned symbolic links between
//! services into concrete transport addresses.
//!
//! The registry itself is an external service; [`registry::Registry`] is the
//! seam, with an in-memory deterministic backend for tests and single-process
//! setups and a RESP/TCP backend for real deployments.

/// Identity acquisition, liveness and the device state-control loop.
pub mod agent;
/// Resettable cancellation flags shared between agent tasks.
pub mod cancel;
/// Configuration structs for the agent and the controller.
pub mod config;
/// Key-space names and the command vocabulary.
pub mod constants;
/// The controller hub: aggregation, client commands, expiry reaction.
pub mod controller;
/// Distributed coordination primitives.
pub mod coordination;
/// The worker-device seam and channel bookkeeping.
pub mod device;
/// Device lifecycle states and transitions.
pub mod fsm;
/// Key construction, parsing and glob matching.
pub mod keyspace;
/// Tracing bootstrap shared by the binaries.
pub mod logging;
/// The shared registry abstraction and its backends.
pub mod registry;
/// Helpers for the `run_info` namespace.
pub mod runinfo;
/// Channel/link data model and the topology resolver.
pub mod topology;

pub use agent::InstanceAgent;
pub use config::AgentConfig;
pub use config::ControllerConfig;
pub use controller::ControllerHub;
pub use fsm::DeviceState;
pub use registry::MemoryRegistry;
pub use registry::Registry;
pub use registry::RespRegistry;
pub use topology::TopologyResolver;
