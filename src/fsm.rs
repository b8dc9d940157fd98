//! The per-device lifecycle state machine.
//!
//! States and transitions follow the device control graph: every command
//! either triggers exactly one legal transition (single-step) or expands into
//! the ordered sequence of single-step transitions that reaches the requested
//! target from the current state (multi-step). A command with no edge from
//! the current state is a silent no-op.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::daq_command;
use crate::constants::fairmq_command;

/// Number of device states; also the length of per-service state histograms.
pub const NSTATES: usize = 16;

/// Device lifecycle states.
///
/// The discriminant order is the canonical state id used in summary
/// histograms; `Exiting` is the last regular state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum DeviceState {
    Undefined = 0,
    Ok = 1,
    Error = 2,
    Idle = 3,
    InitializingDevice = 4,
    Initialized = 5,
    Binding = 6,
    Bound = 7,
    Connecting = 8,
    DeviceReady = 9,
    InitializingTask = 10,
    Ready = 11,
    Running = 12,
    ResettingTask = 13,
    ResettingDevice = 14,
    Exiting = 15,
}

impl DeviceState {
    /// Canonical wire name, as written to the state key.
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Ok => "Ok",
            Self::Error => "Error",
            Self::Idle => "Idle",
            Self::InitializingDevice => "InitializingDevice",
            Self::Initialized => "Initialized",
            Self::Binding => "Binding",
            Self::Bound => "Bound",
            Self::Connecting => "Connecting",
            Self::DeviceReady => "DeviceReady",
            Self::InitializingTask => "InitializingTask",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ResettingTask => "ResettingTask",
            Self::ResettingDevice => "ResettingDevice",
            Self::Exiting => "Exiting",
        }
    }

    /// Parse a canonical wire name.
    pub fn parse(name: &str) -> Option<Self> {
        ALL_STATES.iter().copied().find(|s| s.name() == name)
    }

    /// Histogram slot for this state.
    pub fn state_id(self) -> usize {
        self as usize
    }

    /// State with the given histogram slot.
    pub fn from_state_id(id: usize) -> Option<Self> {
        ALL_STATES.get(id).copied()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All states in state-id order.
pub const ALL_STATES: [DeviceState; NSTATES] = [
    DeviceState::Undefined,
    DeviceState::Ok,
    DeviceState::Error,
    DeviceState::Idle,
    DeviceState::InitializingDevice,
    DeviceState::Initialized,
    DeviceState::Binding,
    DeviceState::Bound,
    DeviceState::Connecting,
    DeviceState::DeviceReady,
    DeviceState::InitializingTask,
    DeviceState::Ready,
    DeviceState::Running,
    DeviceState::ResettingTask,
    DeviceState::ResettingDevice,
    DeviceState::Exiting,
];

/// A single-step state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
}

impl Transition {
    /// The state this transition starts from. `ResetDevice` additionally
    /// accepts `Bound` and `DeviceReady` (see [`Transition::accepts_from`]).
    pub fn from_state(self) -> DeviceState {
        match self {
            Self::InitDevice => DeviceState::Idle,
            Self::CompleteInit => DeviceState::InitializingDevice,
            Self::Bind => DeviceState::Initialized,
            Self::Connect => DeviceState::Bound,
            Self::InitTask => DeviceState::DeviceReady,
            Self::Run => DeviceState::Ready,
            Self::Stop => DeviceState::Running,
            Self::ResetTask => DeviceState::Ready,
            Self::ResetDevice => DeviceState::Initialized,
            Self::End => DeviceState::Idle,
        }
    }

    /// Whether this transition is legal from `state`.
    pub fn accepts_from(self, state: DeviceState) -> bool {
        match self {
            Self::ResetDevice => matches!(
                state,
                DeviceState::Initialized | DeviceState::Bound | DeviceState::DeviceReady
            ),
            other => other.from_state() == state,
        }
    }

    /// The transient state entered while the transition runs, if any.
    pub fn transient_state(self) -> Option<DeviceState> {
        match self {
            Self::Bind => Some(DeviceState::Binding),
            Self::Connect => Some(DeviceState::Connecting),
            Self::InitTask => Some(DeviceState::InitializingTask),
            Self::ResetTask => Some(DeviceState::ResettingTask),
            Self::ResetDevice => Some(DeviceState::ResettingDevice),
            _ => None,
        }
    }

    /// The state this transition settles in.
    pub fn target_state(self) -> DeviceState {
        match self {
            Self::InitDevice => DeviceState::InitializingDevice,
            Self::CompleteInit => DeviceState::Initialized,
            Self::Bind => DeviceState::Bound,
            Self::Connect => DeviceState::DeviceReady,
            Self::InitTask => DeviceState::Ready,
            Self::Run => DeviceState::Running,
            Self::Stop => DeviceState::Ready,
            Self::ResetTask => DeviceState::DeviceReady,
            Self::ResetDevice => DeviceState::Idle,
            Self::End => DeviceState::Exiting,
        }
    }
}

/// A command accepted on the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Bind,
    CompleteInit,
    Connect,
    End,
    InitDevice,
    InitTask,
    ResetDevice,
    ResetTask,
    Run,
    Stop,
    Exit,
    Quit,
    Reset,
    Start,
}

impl Command {
    /// Parse an exact wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            fairmq_command::BIND => Some(Self::Bind),
            fairmq_command::COMPLETE_INIT => Some(Self::CompleteInit),
            fairmq_command::CONNECT => Some(Self::Connect),
            fairmq_command::END => Some(Self::End),
            fairmq_command::INIT_DEVICE => Some(Self::InitDevice),
            fairmq_command::INIT_TASK => Some(Self::InitTask),
            fairmq_command::RESET_DEVICE => Some(Self::ResetDevice),
            fairmq_command::RESET_TASK => Some(Self::ResetTask),
            fairmq_command::RUN => Some(Self::Run),
            fairmq_command::STOP => Some(Self::Stop),
            daq_command::EXIT => Some(Self::Exit),
            daq_command::QUIT => Some(Self::Quit),
            daq_command::RESET => Some(Self::Reset),
            daq_command::START => Some(Self::Start),
            _ => None,
        }
    }

    /// Terminal commands set the shutdown flag after dispatch.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exit | Self::Quit | Self::End)
    }
}

/// Expand a command into the ordered single-step transitions that reach its
/// target from `state`. Empty when the command is not applicable.
pub fn expand(state: DeviceState, command: Command) -> Vec<Transition> {
    use Command as C;
    use DeviceState as S;
    use Transition as T;

    // full forward walk from Idle, truncated below per current state
    const FORWARD: [T; 6] = [T::InitDevice, T::CompleteInit, T::Bind, T::Connect, T::InitTask, T::Run];

    // how many forward steps a command asks for
    let forward_depth = |c: C| -> Option<usize> {
        match c {
            C::InitDevice | C::CompleteInit => Some(2),
            C::Bind => Some(3),
            C::Connect => Some(4),
            C::InitTask => Some(5),
            C::Run | C::Start => Some(6),
            _ => None,
        }
    };
    // how many forward steps are already behind us
    let done = match state {
        S::Idle => 0,
        S::InitializingDevice => 1,
        S::Initialized => 2,
        S::Bound => 3,
        S::DeviceReady => 4,
        S::Ready => 5,
        S::Running => 6,
        _ => return Vec::new(),
    };

    if let Some(depth) = forward_depth(command) {
        // INIT DEVICE only has an edge out of Idle
        if command == C::InitDevice && state != S::Idle {
            return Vec::new();
        }
        if depth > done {
            return FORWARD[done..depth].to_vec();
        }
        return Vec::new();
    }

    match (state, command) {
        (S::Initialized | S::Bound | S::DeviceReady, C::ResetDevice | C::Reset) => vec![T::ResetDevice],
        (S::Ready, C::ResetTask) => vec![T::ResetTask],
        (S::Ready, C::ResetDevice | C::Reset) => vec![T::ResetTask, T::ResetDevice],
        (S::Running, C::Stop) => vec![T::Stop],
        (S::Running, C::ResetTask) => vec![T::Stop, T::ResetTask],
        (S::Running, C::ResetDevice | C::Reset) => vec![T::Stop, T::ResetTask, T::ResetDevice],
        _ => Vec::new(),
    }
}

/// The next transition of the shutdown walk toward `Exiting`, if any.
pub fn shutdown_step(state: DeviceState) -> Option<Transition> {
    match state {
        DeviceState::Idle => Some(Transition::End),
        DeviceState::InitializingDevice => Some(Transition::CompleteInit),
        DeviceState::Initialized | DeviceState::Bound | DeviceState::DeviceReady => Some(Transition::ResetDevice),
        DeviceState::Ready => Some(Transition::ResetTask),
        DeviceState::Running => Some(Transition::Stop),
        _ => None,
    }
}

/// The startup state requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupState {
    #[default]
    Idle,
    InitializingDevice,
    Initialized,
    Bound,
    DeviceReady,
    Ready,
    Running,
}

impl StartupState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "initializing-device" | "initializingdevice" => Some(Self::InitializingDevice),
            "initialized" => Some(Self::Initialized),
            "bound" => Some(Self::Bound),
            "device-ready" | "deviceready" => Some(Self::DeviceReady),
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            _ => None,
        }
    }

    /// The transitions walking from `Idle` to this state.
    pub fn startup_transitions(self) -> &'static [Transition] {
        use Transition as T;
        const WALK: [Transition; 6] = [T::InitDevice, T::CompleteInit, T::Bind, T::Connect, T::InitTask, T::Run];
        let depth = match self {
            Self::Idle => 0,
            Self::InitializingDevice => 1,
            Self::Initialized => 2,
            Self::Bound => 3,
            Self::DeviceReady => 4,
            Self::Ready => 5,
            Self::Running => 6,
        };
        &WALK[..depth]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_roundtrip() {
        for state in ALL_STATES {
            assert_eq!(DeviceState::parse(state.name()), Some(state));
            assert_eq!(DeviceState::from_state_id(state.state_id()), Some(state));
        }
        assert_eq!(DeviceState::Exiting.state_id(), NSTATES - 1);
        assert!(DeviceState::parse("NoSuchState").is_none());
    }

    #[test]
    fn run_from_idle_expands_to_full_walk() {
        let steps = expand(DeviceState::Idle, Command::Run);
        assert_eq!(
            steps,
            vec![
                Transition::InitDevice,
                Transition::CompleteInit,
                Transition::Bind,
                Transition::Connect,
                Transition::InitTask,
                Transition::Run,
            ]
        );
        // the DAQ alias walks the same path
        assert_eq!(expand(DeviceState::Idle, Command::Start), steps);
    }

    #[test]
    fn forward_expansion_truncates_by_progress() {
        assert_eq!(
            expand(DeviceState::Initialized, Command::Connect),
            vec![Transition::Bind, Transition::Connect]
        );
        assert_eq!(expand(DeviceState::Bound, Command::InitTask), vec![Transition::Connect, Transition::InitTask]);
        assert_eq!(expand(DeviceState::DeviceReady, Command::Run), vec![Transition::InitTask, Transition::Run]);
        assert_eq!(expand(DeviceState::Ready, Command::Run), vec![Transition::Run]);
        // already there or beyond: no-op
        assert!(expand(DeviceState::Running, Command::Run).is_empty());
        assert!(expand(DeviceState::Bound, Command::Bind).is_empty());
        assert!(expand(DeviceState::InitializingDevice, Command::InitDevice).is_empty());
    }

    #[test]
    fn reset_family_expansion() {
        assert_eq!(expand(DeviceState::Bound, Command::ResetDevice), vec![Transition::ResetDevice]);
        assert_eq!(
            expand(DeviceState::Ready, Command::ResetDevice),
            vec![Transition::ResetTask, Transition::ResetDevice]
        );
        assert_eq!(
            expand(DeviceState::Running, Command::Reset),
            vec![Transition::Stop, Transition::ResetTask, Transition::ResetDevice]
        );
        assert_eq!(expand(DeviceState::Running, Command::Stop), vec![Transition::Stop]);
        // no reset edge out of Idle
        assert!(expand(DeviceState::Idle, Command::ResetDevice).is_empty());
    }

    #[test]
    fn complete_init_from_in_flight_init() {
        assert_eq!(
            expand(DeviceState::InitializingDevice, Command::CompleteInit),
            vec![Transition::CompleteInit]
        );
        assert_eq!(
            expand(DeviceState::Idle, Command::CompleteInit),
            vec![Transition::InitDevice, Transition::CompleteInit]
        );
    }

    #[test]
    fn transition_shapes() {
        assert_eq!(Transition::Bind.transient_state(), Some(DeviceState::Binding));
        assert_eq!(Transition::Bind.target_state(), DeviceState::Bound);
        assert_eq!(Transition::Run.transient_state(), None);
        assert!(Transition::ResetDevice.accepts_from(DeviceState::DeviceReady));
        assert!(!Transition::ResetDevice.accepts_from(DeviceState::Ready));
    }

    #[test]
    fn shutdown_walk_reaches_exiting() {
        let mut state = DeviceState::Running;
        let mut seen = Vec::new();
        while let Some(step) = shutdown_step(state) {
            seen.push(step);
            state = step.target_state();
        }
        assert_eq!(state, DeviceState::Exiting);
        assert_eq!(
            seen,
            vec![
                Transition::Stop,
                Transition::ResetTask,
                Transition::ResetDevice,
                Transition::End,
            ]
        );
    }

    #[test]
    fn startup_state_parsing_and_walk() {
        assert_eq!(StartupState::parse("device-ready"), Some(StartupState::DeviceReady));
        assert_eq!(StartupState::parse("RUNNING"), Some(StartupState::Running));
        assert!(StartupState::parse("bogus").is_none());
        assert_eq!(StartupState::Idle.startup_transitions().len(), 0);
        assert_eq!(StartupState::Running.startup_transitions().len(), 6);
    }

    #[test]
    fn command_parsing() {
        assert_eq!(Command::parse("INIT DEVICE"), Some(Command::InitDevice));
        assert_eq!(Command::parse("exit"), Some(Command::Exit));
        assert_eq!(Command::parse("run"), None);
        assert!(Command::End.is_terminal());
        assert!(!Command::Run.is_terminal());
    }
}
