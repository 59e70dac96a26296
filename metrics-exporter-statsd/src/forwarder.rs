use std::{
    io::{self, Read as _, Write as _},
    net::{SocketAddr, ToSocketAddrs as _},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, TryRecvError};
use mio::{event::Event, net::TcpStream, Events, Interest, Poll, Token};
use parking_lot::RwLock;
use quanta::{Clock, Instant};
use tracing::{debug, error, trace};

use crate::{
    error::{Error, TransportError},
    observer::Observers,
    queue::{DataPoint, DeliveryQueue, PointSink},
    state::{Action, ConnectionMachine, ConnectionState, ConnectionStatus, Input},
    writer::LineWriter,
};

pub(crate) const WAKER: Token = Token(0);
const START_TOKEN: Token = Token(1);
const SOCKET_INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);
const EVENTS_CAPACITY: usize = 64;
const READ_BUFFER_LEN: usize = 1024;
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum number of points moved from the channel into the queue per loop iteration.
const RECEIVE_BATCH_LEN: usize = 1024;

/// Snapshot of the forwarder's state, published for the client's accessors.
#[derive(Clone, Debug)]
pub(crate) struct Status {
    pub state: ConnectionStatus,
    pub attempts: u64,
    pub connects: u64,
    pub last_error: Option<Arc<TransportError>>,
    pub last_write: Option<Instant>,
}

/// State shared between the client handles and the forwarder thread.
pub(crate) struct Shared {
    status: RwLock<Status>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    pub fn new() -> Self {
        Shared {
            status: RwLock::new(Status {
                state: ConnectionStatus::NotConnected,
                attempts: 0,
                connects: 0,
                last_error: Some(Arc::new(TransportError::NeverConnected)),
                last_write: None,
            }),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        self.status.read().clone()
    }

    pub fn track_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Forwarder configuration.
#[derive(Clone, Debug)]
pub(crate) struct ForwarderConfiguration {
    pub host: String,
    pub port: u16,
    pub max_queue_points: usize,
    pub max_queue_age: Duration,
    pub reconnect_delay: Duration,
}

impl ForwarderConfiguration {
    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let resolve_error = |source| TransportError::Resolve { host: self.host.clone(), port: self.port, source };

        let mut addrs = (self.host.as_str(), self.port).to_socket_addrs().map_err(|e| resolve_error(Some(e)))?;
        addrs.next().ok_or_else(|| resolve_error(None))
    }
}

/// A socket and its write state.
struct Connection {
    stream: TcpStream,
    token: Token,
    connected: bool,
    writable: bool,
    pending: Option<Bytes>,
    bytes_written: u64,
}

impl Connection {
    fn new(stream: TcpStream, token: Token) -> Self {
        Connection { stream, token, connected: false, writable: false, pending: None, bytes_written: 0 }
    }

    /// Checks whether the connection attempt has completed.
    ///
    /// Returns `Ok(true)` once connected, and `Ok(false)` if the attempt is still in progress.
    fn finish_connect(&mut self) -> Result<bool, TransportError> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }

        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                self.writable = true;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads and discards whatever the aggregator sent.
    ///
    /// Returns `Ok(true)` if the aggregator closed the connection.
    fn discard_incoming(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; READ_BUFFER_LEN];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(ref e) if would_block(e) => return Ok(false),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn is_writable(&self) -> bool {
        self.connected && self.writable && self.pending.is_none()
    }

    /// Writes the remainder of a partially written line, if any.
    fn flush_pending(&mut self) -> io::Result<()> {
        match self.pending.take() {
            Some(pending) if self.writable => self.write(&pending),
            pending => {
                self.pending = pending;
                Ok(())
            }
        }
    }

    /// Writes `buf` until it is done or the socket stops accepting data, in which case the rest of `buf` is kept as
    /// the pending buffer and the connection is marked as not writable.
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.write(&buf[offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    offset += n;
                    self.bytes_written += n as u64;
                }
                Err(ref e) if would_block(e) => {
                    trace!(written = offset, remaining = buf.len() - offset, "Socket not writable, holding remainder.");
                    self.writable = false;
                    self.pending = Some(Bytes::copy_from_slice(&buf[offset..]));
                    return Ok(());
                }
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Writes drained points to a connection.
struct SocketSink<'a> {
    connection: &'a mut Connection,
    writer: &'a mut LineWriter,
    buf: &'a mut Vec<u8>,
    error: Option<io::Error>,
}

impl PointSink for SocketSink<'_> {
    fn is_writable(&self) -> bool {
        self.error.is_none() && self.connection.is_writable()
    }

    fn send(&mut self, point: DataPoint) {
        self.buf.clear();
        self.writer.encode(&point, self.buf);
        if let Err(e) = self.connection.write(self.buf) {
            self.error = Some(e);
        }
    }
}

enum SocketOutcome {
    Failed(TransportError),
    Ended,
    Ready,
}

/// Owns the connection to the aggregator and the queue of points waiting for it.
///
/// The forwarder runs on its own thread, and is the only place where the queue and the connection state are touched.
/// Points arrive from the client over a channel; socket readiness and the retry timer are both driven by the poller.
pub(crate) struct Forwarder {
    poll: Poll,
    rx: Receiver<DataPoint>,
    config: ForwarderConfiguration,
    queue: DeliveryQueue,
    machine: ConnectionMachine,
    connection: Option<Connection>,
    next_token: Token,
    wait_deadline: Option<Instant>,
    last_write: Option<Instant>,
    backlog: bool,
    writer: LineWriter,
    write_buf: Vec<u8>,
    clock: Clock,
    shared: Arc<Shared>,
    observers: Observers,
}

impl Forwarder {
    /// Creates a new `Forwarder`.
    ///
    /// `poll` must have the client's waker registered under [`WAKER`].
    pub fn new(
        config: ForwarderConfiguration,
        poll: Poll,
        rx: Receiver<DataPoint>,
        clock: Clock,
        shared: Arc<Shared>,
        observers: Observers,
    ) -> Self {
        Forwarder {
            poll,
            rx,
            queue: DeliveryQueue::new(config.max_queue_points, config.max_queue_age),
            machine: ConnectionMachine::new(config.reconnect_delay),
            config,
            connection: None,
            next_token: START_TOKEN,
            wait_deadline: None,
            last_write: None,
            backlog: false,
            writer: LineWriter::new(),
            write_buf: Vec::new(),
            clock,
            shared,
            observers,
        }
    }

    /// Runs the forwarder until the client is dropped.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        self.apply(Input::Start);

        loop {
            let timeout = if self.backlog {
                Some(Duration::ZERO)
            } else {
                self.wait_deadline.map(|deadline| deadline.saturating_duration_since(self.clock.now()))
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if !interrupted(&e) {
                    error!(error = %e, "Failed to poll for socket events.");
                }
                continue;
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.process_socket_event(event);
                }
            }

            let disconnected = self.receive_points();

            if self.wait_deadline.map_or(false, |deadline| deadline <= self.clock.now()) {
                self.wait_deadline = None;
                if let ConnectionState::ConnWait { last_error, wait_start } = self.machine.state() {
                    let waited = self.clock.now().saturating_duration_since(*wait_start);
                    debug!(?waited, %last_error, "Retrying connection.");
                }
                self.apply(Input::WaitElapsed);
            }

            if disconnected || (self.shared.is_closed() && !self.backlog) {
                self.flush_before_exit(&mut events);
                if self.has_unsent() {
                    debug!(queued = self.queue.len(), "Client dropped, stopping forwarder with points still queued.");
                } else {
                    debug!("Client dropped, stopping forwarder.");
                }
                self.close_connection();
                return;
            }
        }
    }

    /// Keeps sending what is left, including the remainder of a partially written line, until everything is sent, the
    /// connection goes down, or [`SHUTDOWN_FLUSH_TIMEOUT`] elapses.
    fn flush_before_exit(&mut self, events: &mut Events) {
        // Real time, since a mocked clock would never let the timeout elapse.
        let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;

        loop {
            self.drain_and_publish();
            if !self.machine.is_nominal() || !self.has_unsent() {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }

            if let Err(e) = self.poll.poll(events, Some(deadline.saturating_duration_since(now))) {
                if !interrupted(&e) {
                    error!(error = %e, "Failed to poll for socket events.");
                    return;
                }
                continue;
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.process_socket_event(event);
                }
            }
        }
    }

    fn has_unsent(&self) -> bool {
        !self.queue.is_empty() || self.connection.as_ref().map_or(false, |connection| connection.pending.is_some())
    }

    fn process_socket_event(&mut self, event: &Event) {
        let token = event.token();
        let connection = match self.current_connection(token) {
            Some(connection) => connection,
            None => {
                trace!(?token, "Ignoring event for a discarded socket.");
                return;
            }
        };

        if !connection.connected {
            match connection.finish_connect() {
                Ok(false) => return,
                Ok(true) => self.apply(Input::Connected),
                Err(e) => {
                    self.apply(Input::Failed(e));
                    return;
                }
            }

            // The readiness that completed the connection may also carry a close from the other side.
            if !(event.is_readable() || event.is_read_closed() || event.is_error()) {
                return;
            }
        }

        let outcome = match self.current_connection(token) {
            Some(connection) => read_outcome(connection, event),
            None => return,
        };

        match outcome {
            SocketOutcome::Failed(e) => self.apply(Input::Failed(e)),
            SocketOutcome::Ended => self.apply(Input::Ended),
            SocketOutcome::Ready => self.drain_and_publish(),
        }
    }

    fn current_connection(&mut self, token: Token) -> Option<&mut Connection> {
        self.connection.as_mut().filter(|connection| connection.token == token)
    }

    /// Moves points handed off by the client into the queue, and sends them if connected.
    ///
    /// Returns `true` once every sender is gone.
    fn receive_points(&mut self) -> bool {
        let mut received = 0;
        let mut disconnected = false;
        self.backlog = false;

        while received < RECEIVE_BATCH_LEN {
            match self.rx.try_recv() {
                Ok(point) => {
                    received += 1;
                    if !self.queue.enqueue(point) {
                        trace!(queued = self.queue.len(), "Queue bounds reached, dropping point.");
                        self.shared.track_dropped();
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        self.backlog = received == RECEIVE_BATCH_LEN;
        if received > 0 {
            self.drain_and_publish();
        }

        disconnected
    }

    /// Feeds `input` to the state machine and carries out the resulting actions.
    fn apply(&mut self, input: Input) {
        let mut next_input = Some(input);
        while let Some(input) = next_input.take() {
            for action in self.machine.handle(input, self.clock.now()) {
                match action {
                    Action::OpenSocket => {
                        if let Err(e) = self.open_connection() {
                            next_input = Some(Input::Failed(e));
                        }
                    }
                    Action::CloseSocket => self.close_connection(),
                    Action::ArmTimer(deadline) => self.wait_deadline = Some(deadline),
                    Action::EmitNominal => {
                        if let ConnectionState::Nominal { connect_start, connected } = self.machine.state() {
                            debug!(elapsed = ?connected.saturating_duration_since(*connect_start), "Connected.");
                        }
                        self.observers.nominal();
                    }
                    Action::EmitWarn(error) => self.observers.warn(&Error::Transport(error)),
                    Action::Drain => {
                        if let Err(e) = self.drain() {
                            next_input = Some(Input::Failed(e));
                        }
                    }
                }
            }
        }

        self.publish();
    }

    fn drain_and_publish(&mut self) {
        match self.drain() {
            Ok(()) => self.publish(),
            Err(e) => self.apply(Input::Failed(e)),
        }
    }

    /// Sends queued points for as long as the connection accepts them.
    fn drain(&mut self) -> Result<(), TransportError> {
        if !self.machine.is_nominal() {
            return Ok(());
        }

        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return Ok(()),
        };

        let written_before = connection.bytes_written;
        let result = connection.flush_pending().and_then(|()| {
            let mut sink =
                SocketSink { connection: &mut *connection, writer: &mut self.writer, buf: &mut self.write_buf, error: None };
            self.queue.drain_into(&mut sink);
            sink.error.map_or(Ok(()), Err)
        });

        if connection.bytes_written != written_before {
            self.last_write = Some(self.clock.now());
        }

        result.map_err(Into::into)
    }

    fn open_connection(&mut self) -> Result<(), TransportError> {
        debug_assert!(self.connection.is_none(), "opening a socket while one is still open");

        let addr = self.config.resolve()?;
        let mut stream = TcpStream::connect(addr)?;
        let token = next(&mut self.next_token);
        self.poll.registry().register(&mut stream, token, SOCKET_INTEREST)?;

        debug!(%addr, ?token, "Connecting to statsd aggregator.");
        self.connection = Some(Connection::new(stream, token));
        Ok(())
    }

    fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            // Deregister before dropping the socket, so no event for it can reach us afterwards.
            if let Err(e) = self.poll.registry().deregister(&mut connection.stream) {
                trace!(error = %e, token = ?connection.token, "Failed to deregister socket.");
            }
        }
    }

    fn publish(&self) {
        let mut status = self.shared.status.write();
        status.state = self.machine.state().status();
        status.attempts = self.machine.attempts();
        status.connects = self.machine.connects();
        status.last_error = self.machine.last_error().cloned();
        status.last_write = self.last_write;
    }
}

fn read_outcome(connection: &mut Connection, event: &Event) -> SocketOutcome {
    if event.is_error() {
        let error = match connection.stream.take_error() {
            Ok(Some(e)) | Err(e) => e,
            Ok(None) => io::ErrorKind::ConnectionReset.into(),
        };
        return SocketOutcome::Failed(error.into());
    }

    if event.is_readable() || event.is_read_closed() {
        match connection.discard_incoming() {
            Ok(true) => return SocketOutcome::Ended,
            Ok(false) => {}
            Err(e) => return SocketOutcome::Failed(e.into()),
        }
    }

    if event.is_writable() {
        connection.writable = true;
    }

    SocketOutcome::Ready
}

fn next(current: &mut Token) -> Token {
    let next = current.0;
    current.0 += 1;
    Token(next)
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
