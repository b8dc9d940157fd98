//! Fixed names of the shared key space and the command vocabulary.
//!
//! Everything here is part of the external contract: provisioners write
//! endpoint/link entries under these prefixes, browser clients and devices
//! exchange commands spelled exactly as below, and operators point monitoring
//! at the same key layout. Renaming anything in this module is a wire break.

/// Top-level prefix namespacing every DAQ key.
pub const TOP_PREFIX: &str = "daq_service";

/// Default key-space separator.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Per-instance presence key suffix; its expiry is the liveness failure signal.
pub const PRESENCE_PREFIX: &str = "presence";
/// Per-instance health hash suffix.
pub const HEALTH_PREFIX: &str = "health";
/// Per-instance program-option hash suffix.
pub const PROG_OPTION_PREFIX: &str = "option";
/// Per-instance device state key suffix.
pub const FAIRMQ_STATE_PREFIX: &str = "fair:mq:state";
/// Per-instance last-update timestamp key suffix.
pub const UPDATE_TIME_PREFIX: &str = "update-time";
/// Hash mapping instance index to uuid, one per service.
pub const SERVICE_INSTANCE_INDEX_PREFIX: &str = "service-instance-index";

/// Name of the distributed lock guarding instance-index acquisition.
pub const RESOURCE_LOCK_KEY: &str = "resource";

/// Command pub/sub channel (controller to devices).
pub const COMMAND_CHANNEL: &str = "daqctl";
/// State broadcast channel (devices to controller, optional).
pub const STATE_CHANNEL: &str = "daqstate";

pub mod run_info {
    //! Keys under the controller-owned `run_info` namespace.

    pub const PREFIX: &str = "run_info";
    pub const RUN_NUMBER: &str = "run_number";
    pub const LATEST_RUN_NUMBER: &str = "latest_run_number";
    pub const START_TIME: &str = "start_time";
    pub const START_TIME_NS: &str = "start_time_ns";
    pub const STOP_TIME: &str = "stop_time";
    pub const STOP_TIME_NS: &str = "stop_time_ns";
    pub const WAIT_DEVICE_READY: &str = "wait-device-ready";
    pub const WAIT_READY: &str = "wait-ready";
}

pub mod topology {
    //! Key suffixes used by the topology resolver.

    pub const PREFIX: &str = "topology";
    pub const ENDPOINT_PREFIX: &str = "endpoint";
    pub const LINK_PREFIX: &str = "link";
    pub const CHANNEL_PREFIX: &str = "channel";
    pub const PEER_PREFIX: &str = "peer";
    pub const SOCKET_PREFIX: &str = "socket";
}

pub mod fairmq_command {
    //! Device state-transition commands as they appear on the wire.

    pub const BIND: &str = "BIND";
    pub const COMPLETE_INIT: &str = "COMPLETE INIT";
    pub const CONNECT: &str = "CONNECT";
    pub const END: &str = "END";
    pub const INIT_DEVICE: &str = "INIT DEVICE";
    pub const INIT_TASK: &str = "INIT TASK";
    pub const RESET_DEVICE: &str = "RESET DEVICE";
    pub const RESET_TASK: &str = "RESET TASK";
    pub const RUN: &str = "RUN";
    pub const STOP: &str = "STOP";
}

pub mod daq_command {
    //! DAQ-level commands accepted alongside the device transitions.

    pub const EXIT: &str = "exit";
    pub const QUIT: &str = "quit";
    pub const RESET: &str = "reset";
    pub const START: &str = "start";
}

/// Every command accepted on the command channel.
pub const KNOWN_COMMANDS: &[&str] = &[
    fairmq_command::BIND,
    fairmq_command::COMPLETE_INIT,
    fairmq_command::CONNECT,
    fairmq_command::END,
    fairmq_command::INIT_DEVICE,
    fairmq_command::INIT_TASK,
    fairmq_command::RESET_DEVICE,
    fairmq_command::RESET_TASK,
    fairmq_command::RUN,
    fairmq_command::STOP,
    daq_command::EXIT,
    daq_command::QUIT,
    daq_command::RESET,
    daq_command::START,
];
