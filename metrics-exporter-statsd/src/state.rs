//! Connection state machine.
//!
//! ```text
//!     +---------+  immediate   +------------+  connected   +---------+
//!     | NOTCONN | -----------> | CONNECTING | -----------> | NOMINAL |
//!     +---------+              +------------+              +---------+
//!          ^                         |                          |
//!          |                         | error                    |
//!          |                         v                          |
//!          |       wait elapsed +----------+     error or end   |
//!          +------------------- | CONNWAIT | <------------------+
//!                               +----------+
//! ```
//!
//! The machine itself performs no I/O: [`transition`] maps a state and an input to the next state and the actions
//! the driver must carry out, and [`ConnectionMachine`] layers the connection counters on top of it.
use std::{sync::Arc, time::Duration};

use quanta::Instant;

use crate::error::TransportError;

/// Longest wait between connection attempts; longer delays are clamped to it.
pub(crate) const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Connection state.
#[derive(Clone, Debug)]
pub(crate) enum ConnectionState {
    /// Not connected, and not waiting to retry. Only ever held momentarily.
    NotConnected,

    /// A connection attempt is in progress.
    Connecting { connect_start: Instant },

    /// Connected and able to send.
    Nominal { connect_start: Instant, connected: Instant },

    /// Waiting out the retry delay after a failure.
    ConnWait { last_error: Arc<TransportError>, wait_start: Instant },
}

/// Public view of the connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, and not waiting to retry.
    NotConnected,

    /// A connection attempt is in progress.
    Connecting,

    /// Connected and able to send.
    Nominal,

    /// Waiting to retry after a failure.
    Waiting,
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::NotConnected => ConnectionStatus::NotConnected,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Nominal { .. } => ConnectionStatus::Nominal,
            ConnectionState::ConnWait { .. } => ConnectionStatus::Waiting,
        }
    }
}

/// Notifications fed into the machine.
#[derive(Debug)]
pub(crate) enum Input {
    /// Start connecting. Sent once by the driver when it starts.
    Start,

    /// The pending connection attempt succeeded.
    Connected,

    /// The socket failed, either while connecting or while connected.
    Failed(TransportError),

    /// The remote side closed the connection.
    Ended,

    /// The retry delay is over.
    WaitElapsed,
}

/// Side effects requested by a transition, in the order they must be carried out.
#[derive(Debug)]
pub(crate) enum Action {
    /// Open a new connection and start watching it.
    OpenSocket,

    /// Stop watching the current socket and drop it.
    CloseSocket,

    /// Feed [`Input::WaitElapsed`] back at the given deadline.
    ArmTimer(Instant),

    /// Notify observers that the connection is up.
    EmitNominal,

    /// Notify observers of the error.
    EmitWarn(Arc<TransportError>),

    /// Send as much of the queue as the socket accepts.
    Drain,
}

/// Computes the next state for `input`.
///
/// Returns `None` if `input` has no meaning in `state`, as is the case for a notification about a socket that has
/// already been discarded. Such inputs must be ignored.
pub(crate) fn transition(
    state: &ConnectionState,
    input: Input,
    now: Instant,
    reconnect_delay: Duration,
) -> Option<(ConnectionState, Vec<Action>)> {
    match (state, input) {
        (ConnectionState::NotConnected, Input::Start) => {
            Some((ConnectionState::Connecting { connect_start: now }, vec![Action::OpenSocket]))
        }
        (ConnectionState::Connecting { connect_start }, Input::Connected) => Some((
            ConnectionState::Nominal { connect_start: *connect_start, connected: now },
            vec![Action::EmitNominal, Action::Drain],
        )),
        (ConnectionState::Connecting { .. }, Input::Failed(e))
        | (ConnectionState::Nominal { .. }, Input::Failed(e)) => Some(disconnected(e, now, reconnect_delay)),
        (ConnectionState::Nominal { .. }, Input::Ended) => {
            Some(disconnected(TransportError::Closed, now, reconnect_delay))
        }
        (ConnectionState::ConnWait { .. }, Input::WaitElapsed) => Some((ConnectionState::NotConnected, Vec::new())),
        _ => None,
    }
}

fn disconnected(error: TransportError, now: Instant, reconnect_delay: Duration) -> (ConnectionState, Vec<Action>) {
    let error = Arc::new(error);
    let deadline = now.checked_add(reconnect_delay.min(MAX_RECONNECT_DELAY)).unwrap_or(now);
    let actions = vec![Action::CloseSocket, Action::EmitWarn(Arc::clone(&error)), Action::ArmTimer(deadline)];
    (ConnectionState::ConnWait { last_error: error, wait_start: now }, actions)
}

/// The connection state together with its counters.
pub(crate) struct ConnectionMachine {
    state: ConnectionState,
    reconnect_delay: Duration,
    attempts: u64,
    connects: u64,
    last_error: Option<Arc<TransportError>>,
}

impl ConnectionMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::NotConnected,
            reconnect_delay,
            attempts: 0,
            connects: 0,
            last_error: Some(Arc::new(TransportError::NeverConnected)),
        }
    }

    /// Applies `input`, returning the actions to carry out.
    ///
    /// Entering `NotConnected` immediately starts a new attempt, so the actions of both transitions are returned.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut next_input = Some(input);

        while let Some(input) = next_input.take() {
            let (state, mut step) = match transition(&self.state, input, now, self.reconnect_delay) {
                Some(next) => next,
                None => break,
            };

            match &state {
                ConnectionState::NotConnected => next_input = Some(Input::Start),
                ConnectionState::Connecting { .. } => self.attempts += 1,
                ConnectionState::Nominal { .. } => {
                    self.connects += 1;
                    self.last_error = None;
                }
                ConnectionState::ConnWait { last_error, .. } => self.last_error = Some(Arc::clone(last_error)),
            }

            self.state = state;
            actions.append(&mut step);
        }

        actions
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self.state, ConnectionState::Nominal { .. })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn last_error(&self) -> Option<&Arc<TransportError>> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use quanta::Clock;

    use super::{Action, ConnectionMachine, ConnectionState, ConnectionStatus, Input, MAX_RECONNECT_DELAY};
    use crate::error::TransportError;

    const DELAY: Duration = Duration::from_millis(1000);

    /// Tracks the resources a driver would hold while following the machine's actions.
    #[derive(Default)]
    struct Resources {
        socket: bool,
        timer: bool,
        nominal_events: usize,
        warn_events: usize,
        drains: usize,
    }

    impl Resources {
        fn apply(&mut self, actions: Vec<Action>) {
            for action in actions {
                match action {
                    Action::OpenSocket => {
                        assert!(!self.socket, "socket opened twice");
                        self.socket = true;
                    }
                    Action::CloseSocket => {
                        assert!(self.socket, "closed a socket that was not open");
                        self.socket = false;
                    }
                    Action::ArmTimer(_) => {
                        assert!(!self.timer, "timer armed twice");
                        self.timer = true;
                    }
                    Action::EmitNominal => self.nominal_events += 1,
                    Action::EmitWarn(_) => self.warn_events += 1,
                    Action::Drain => self.drains += 1,
                }
            }
        }

        fn fire_timer(&mut self) {
            assert!(self.timer, "timer fired while not armed");
            self.timer = false;
        }
    }

    fn check_invariants(machine: &ConnectionMachine, resources: &Resources) {
        assert!(resources.socket != resources.timer, "exactly one of socket and timer must exist");
        match machine.state() {
            ConnectionState::NotConnected => panic!("machine rests in NotConnected"),
            ConnectionState::Connecting { .. } => {
                assert!(resources.socket);
                assert!(machine.last_error().is_some());
            }
            ConnectionState::Nominal { connect_start, connected } => {
                assert!(resources.socket);
                assert!(machine.last_error().is_none());
                assert!(connected >= connect_start);
            }
            ConnectionState::ConnWait { last_error, .. } => {
                assert!(!resources.socket);
                assert!(resources.timer);
                let recorded = machine.last_error().expect("last error must be set while waiting");
                assert!(std::sync::Arc::ptr_eq(recorded, last_error));
            }
        }
    }

    fn socket_error() -> TransportError {
        TransportError::Socket(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[test]
    fn starts_connecting() {
        let (clock, _) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        assert!(matches!(machine.last_error().map(|e| &**e), Some(TransportError::NeverConnected)));

        let mut resources = Resources::default();
        resources.apply(machine.handle(Input::Start, clock.now()));
        check_invariants(&machine, &resources);
        assert_eq!(machine.state().status(), ConnectionStatus::Connecting);
        assert_eq!(machine.attempts(), 1);
        assert_eq!(machine.connects(), 0);
    }

    #[test]
    fn connect_then_fail_then_retry() {
        let (clock, mock) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        let mut resources = Resources::default();

        resources.apply(machine.handle(Input::Start, clock.now()));
        resources.apply(machine.handle(Input::Connected, clock.now()));
        check_invariants(&machine, &resources);
        assert!(machine.is_nominal());
        assert_eq!(machine.connects(), 1);
        assert_eq!(resources.nominal_events, 1);
        assert_eq!(resources.drains, 1);

        mock.increment(Duration::from_secs(5));
        let actions = machine.handle(Input::Failed(socket_error()), clock.now());
        let deadline = actions
            .iter()
            .find_map(|action| match action {
                Action::ArmTimer(deadline) => Some(*deadline),
                _ => None,
            })
            .expect("timer must be armed");
        assert_eq!(deadline, clock.now() + DELAY);
        resources.apply(actions);
        check_invariants(&machine, &resources);
        assert_eq!(machine.state().status(), ConnectionStatus::Waiting);
        assert_eq!(resources.warn_events, 1);
        let attempts = machine.attempts();

        mock.increment(DELAY);
        resources.fire_timer();
        resources.apply(machine.handle(Input::WaitElapsed, clock.now()));
        check_invariants(&machine, &resources);
        assert_eq!(machine.state().status(), ConnectionStatus::Connecting);
        assert_eq!(machine.attempts(), attempts + 1);
        assert!(matches!(machine.last_error().map(|e| &**e), Some(TransportError::Socket(_))));
    }

    #[test]
    fn remote_end_while_nominal() {
        let (clock, _) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        let mut resources = Resources::default();

        resources.apply(machine.handle(Input::Start, clock.now()));
        resources.apply(machine.handle(Input::Connected, clock.now()));
        resources.apply(machine.handle(Input::Ended, clock.now()));
        check_invariants(&machine, &resources);
        assert!(matches!(machine.last_error().map(|e| &**e), Some(TransportError::Closed)));
    }

    #[test]
    fn connect_failure() {
        let (clock, _) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        let mut resources = Resources::default();

        resources.apply(machine.handle(Input::Start, clock.now()));
        resources.apply(machine.handle(Input::Failed(socket_error()), clock.now()));
        check_invariants(&machine, &resources);
        assert_eq!(machine.connects(), 0);
        assert_eq!(resources.nominal_events, 0);
    }

    #[test]
    fn stale_inputs_are_ignored() {
        let (clock, _) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        let mut resources = Resources::default();

        // Nothing but Start means anything before the first attempt.
        assert!(machine.handle(Input::Connected, clock.now()).is_empty());
        assert!(machine.handle(Input::WaitElapsed, clock.now()).is_empty());

        resources.apply(machine.handle(Input::Start, clock.now()));
        assert!(machine.handle(Input::Ended, clock.now()).is_empty());
        assert!(machine.handle(Input::WaitElapsed, clock.now()).is_empty());

        resources.apply(machine.handle(Input::Failed(socket_error()), clock.now()));
        assert!(machine.handle(Input::Connected, clock.now()).is_empty());
        assert!(machine.handle(Input::Failed(socket_error()), clock.now()).is_empty());
        assert!(machine.handle(Input::Ended, clock.now()).is_empty());
        check_invariants(&machine, &resources);
        assert_eq!(machine.attempts(), 1);
        assert_eq!(resources.warn_events, 1);
    }

    #[test]
    fn huge_reconnect_delay_is_clamped() {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(3600));
        let now = clock.now();
        let mut machine = ConnectionMachine::new(Duration::MAX);

        machine.handle(Input::Start, now);
        let deadline = machine.handle(Input::Failed(socket_error()), now).into_iter().find_map(|action| match action {
            Action::ArmTimer(deadline) => Some(deadline),
            _ => None,
        });

        assert_eq!(deadline, Some(now + MAX_RECONNECT_DELAY));
        assert_eq!(machine.state().status(), ConnectionStatus::Waiting);

        mock.increment(MAX_RECONNECT_DELAY);
        machine.handle(Input::WaitElapsed, clock.now());
        assert_eq!(machine.state().status(), ConnectionStatus::Connecting);
        assert_eq!(machine.attempts(), 2);
    }

    #[test]
    fn invariants_hold_over_many_cycles() {
        let (clock, mock) = Clock::mock();
        let mut machine = ConnectionMachine::new(DELAY);
        let mut resources = Resources::default();

        resources.apply(machine.handle(Input::Start, clock.now()));
        for round in 0..20u64 {
            if round % 3 != 0 {
                resources.apply(machine.handle(Input::Connected, clock.now()));
                check_invariants(&machine, &resources);
            }

            let input = if round % 2 == 0 { Input::Ended } else { Input::Failed(socket_error()) };
            let was_nominal = machine.is_nominal();
            resources.apply(machine.handle(input, clock.now()));
            if was_nominal || round % 2 == 1 {
                check_invariants(&machine, &resources);
            }

            if machine.state().status() == ConnectionStatus::Waiting {
                mock.increment(DELAY);
                resources.fire_timer();
                resources.apply(machine.handle(Input::WaitElapsed, clock.now()));
                check_invariants(&machine, &resources);
            }
        }

        assert_eq!(machine.connects() as usize, resources.nominal_events);
        assert_eq!(machine.attempts(), 1 + resources.warn_events as u64);
    }
}
