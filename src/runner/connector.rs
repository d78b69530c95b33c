//! Connection multiplexer between the debugger and a runner process.
//!
//! The connector listens for exactly one runner connection, correlates debugger requests with
//! runner replies and turns runner initiated requests into [`RunnerEvent`]s. Requests issued
//! before the runner connects are queued and flushed, in order, on connection.

use crate::error::{is_benign_disconnect, ConnectorError, ProtocolError};
use crate::muted_error;
use crate::runner::codec::{decode_frame, encode, FrameDecoder};
use crate::runner::launcher::{Launcher, LauncherEvent};
use crate::runner::pending::{PendingReply, PendingRequests};
use crate::runner::protocol::{
    BreakpointHit, BreakpointRecord, DebuggerMessage, Envelope, PacketType, RunnerMessage,
};
use crate::runner::tracer::WireTracer;
use crate::weak_error;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

const READ_BUF_SIZE: usize = 4096;
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a lost runner socket waits for the runner exit notification.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Runner process exited with this code (`None` if killed by a signal).
    RunnerExited(Option<i32>),
    /// Session terminated by the debugger.
    Terminated,
    /// Runner could not be started.
    LaunchFailed(String),
    /// Unrecoverable socket error.
    TransportFailure(String),
    /// Runner dropped the connection but did not exit.
    Disconnected,
}

/// Events produced by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Connected,
    /// Connection closed. Sent exactly once per connector.
    Closed(CloseReason),
    Error(ProtocolError),
    StopOnEntry,
    StopOnStep,
    StopOnBreakpoint(Option<BreakpointRecord>),
    Output(String),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Closed,
}

/// Called once the runner is connected, after the outbound queue is flushed and before any
/// other request can be written.
pub type ConnectHook = Box<dyn FnMut(&mut Outbox<'_>) + Send>;

struct Inner {
    state: ConnectionState,
    started: bool,
    next_id: u64,
    pending: PendingRequests,
    queue: VecDeque<Vec<u8>>,
    /// Frames for the writer thread, set while connected.
    writer: Option<Sender<Vec<u8>>>,
    socket: Option<TcpStream>,
    listen_addr: Option<SocketAddr>,
    connect_hook: Option<ConnectHook>,
}

struct Shared {
    inner: Mutex<Inner>,
    closed: Condvar,
    events: Sender<RunnerEvent>,
    tracer: OnceLock<WireTracer>,
}

/// Request writer available to a [`ConnectHook`].
pub struct Outbox<'a> {
    shared: &'a Shared,
    inner: &'a mut Inner,
}

impl Outbox<'_> {
    pub fn request(
        &mut self,
        msg: DebuggerMessage,
        args: Value,
    ) -> Result<PendingReply, ConnectorError> {
        self.shared.dispatch(self.inner, msg, args)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RunnerEvent) {
        if self.events.send(event).is_err() {
            log::debug!(target: "runner", "event receiver is gone");
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ConnectionState::Closed
    }

    /// Allocate an id, register the reply and write (or queue) the request.
    fn dispatch(
        &self,
        inner: &mut Inner,
        msg: DebuggerMessage,
        args: Value,
    ) -> Result<PendingReply, ConnectorError> {
        if inner.state == ConnectionState::Closed {
            return Err(ConnectorError::Closed);
        }

        let id = inner.next_id;
        let frame = encode(&Envelope::request(id, msg, args))?;
        inner.next_id += 1;
        let reply = inner.pending.insert(id);

        if inner.state == ConnectionState::Connected {
            Self::send_frame(inner, frame)?;
        } else {
            log::debug!(target: "runner", "runner not connected, queue request {id} {msg}");
            inner.queue.push_back(frame);
        }
        Ok(reply)
    }

    /// Hand a frame to the writer thread, frames are written in the order they are sent.
    fn send_frame(inner: &Inner, frame: Vec<u8>) -> Result<(), ConnectorError> {
        let Some(writer) = inner.writer.as_ref() else {
            return Err(ConnectorError::Closed);
        };
        writer.send(frame).map_err(|_| ConnectorError::Closed)
    }

    fn write_loop(&self, mut socket: TcpStream, frames: Receiver<Vec<u8>>) {
        for frame in frames {
            log::debug!(target: "runner", "runner write: {}", String::from_utf8_lossy(&frame).trim_end());
            if let Some(tracer) = self.tracer.get() {
                tracer.outgoing(&frame);
            }

            match socket.write_all(&frame).and_then(|_| socket.flush()) {
                Ok(()) => {}
                Err(e) if is_benign_disconnect(&e) => {
                    log::debug!(target: "runner", "runner is gone, frame dropped: {e}");
                }
                Err(e) => {
                    if !self.is_closed() {
                        log::error!(target: "runner", "write to runner: {e}");
                        self.close(CloseReason::TransportFailure(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    fn on_accept(self: &Arc<Self>, stream: &TcpStream) -> Result<(), ConnectorError> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Unconnected {
            return Err(ConnectorError::Closed);
        }

        muted_error!(stream.set_nodelay(true), "set TCP_NODELAY:");
        let (frames_tx, frames_rx) = mpsc::channel();
        thread::spawn({
            let shared = self.clone();
            let socket = stream.try_clone()?;
            move || shared.write_loop(socket, frames_rx)
        });
        inner.socket = Some(stream.try_clone()?);
        inner.writer = Some(frames_tx);
        inner.state = ConnectionState::Connected;

        while let Some(frame) = inner.queue.pop_front() {
            Self::send_frame(&inner, frame)?;
        }

        if let Some(mut hook) = inner.connect_hook.take() {
            hook(&mut Outbox {
                shared: self,
                inner: &mut *inner,
            });
            inner.connect_hook = Some(hook);
        }

        self.emit(RunnerEvent::Connected);
        Ok(())
    }

    fn receive(&self, envelope: Envelope) {
        log::debug!(target: "runner", "runner receive: {envelope:?}");

        match envelope.packet_type() {
            Some(PacketType::Reply) => {
                let resolved = self.lock().pending.resolve(envelope.id, envelope.args);
                if let Err(e) = resolved {
                    self.emit(RunnerEvent::Error(e));
                }
            }
            Some(PacketType::Request) => {
                let event = match envelope.tag().parse::<RunnerMessage>() {
                    Ok(RunnerMessage::Breakpoint) => {
                        let hit = weak_error!(
                            serde_json::from_value::<BreakpointHit>(envelope.args),
                            "breakpoint hit without a breakpoint record:"
                        );
                        RunnerEvent::StopOnBreakpoint(hit.map(|h| h.breakpoint))
                    }
                    Ok(RunnerMessage::Step) => RunnerEvent::StopOnStep,
                    Ok(RunnerMessage::StopOnEntry) => RunnerEvent::StopOnEntry,
                    Ok(msg @ (RunnerMessage::CallStack | RunnerMessage::SetBreakpoints)) => {
                        RunnerEvent::Error(ProtocolError::UnexpectedRequest(msg.to_string()))
                    }
                    Err(_) => RunnerEvent::Error(ProtocolError::UnknownRequest(
                        envelope.tag().to_string(),
                    )),
                };
                self.emit(event);
            }
            None => self.emit(RunnerEvent::Error(ProtocolError::UnknownPacketType(
                envelope.kind,
            ))),
        }
    }

    fn read_loop(&self, mut stream: TcpStream) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    self.close_on_disconnect();
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_benign_disconnect(&e) => {
                    log::debug!(target: "runner", "runner connection reset: {e}");
                    self.close_on_disconnect();
                    return;
                }
                Err(e) => {
                    if !self.is_closed() {
                        log::error!(target: "runner", "read from runner: {e}");
                        self.close(CloseReason::TransportFailure(e.to_string()));
                    }
                    return;
                }
            };

            for frame in decoder.feed_raw(&buf[..n]) {
                if let Some(tracer) = self.tracer.get() {
                    tracer.incoming(&frame);
                }
                match decode_frame(&frame) {
                    Ok(envelope) => self.receive(envelope),
                    Err(e) => self.emit(RunnerEvent::Error(ProtocolError::Malformed(e.to_string()))),
                }
            }
        }
    }

    /// Close a connection whose socket is gone. A runner exit notified within [`EXIT_GRACE`]
    /// takes precedence, otherwise the connection is closed as [`CloseReason::Disconnected`].
    fn close_on_disconnect(&self) {
        let inner = self.lock();
        let (mut inner, _) = self
            .closed
            .wait_timeout_while(inner, EXIT_GRACE, |inner| {
                inner.state != ConnectionState::Closed
            })
            .unwrap_or_else(PoisonError::into_inner);
        if self.close_locked(&mut inner, CloseReason::Disconnected) {
            log::warn!(target: "runner", "runner closed the connection before exit");
        }
    }

    fn serve(self: Arc<Self>, listener: TcpListener) {
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_closed() {
                        return;
                    }
                    log::info!(target: "runner", "runner connected: {peer}");
                    break stream;
                }
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    log::warn!(target: "runner", "accept failed: {e:#}");
                }
            }
        };
        // exactly one runner per session
        drop(listener);

        if let Err(e) = self.on_accept(&stream) {
            log::warn!(target: "runner", "drop runner connection: {e:#}");
            return;
        }
        self.read_loop(stream);
    }

    fn supervise(&self, events: Receiver<LauncherEvent>) {
        for event in events {
            match event {
                LauncherEvent::Output(line) => self.emit(RunnerEvent::Output(line)),
                LauncherEvent::Exit(code) => {
                    log::info!(target: "runner", "runner exited with code {code:?}");
                    self.close(CloseReason::RunnerExited(code));
                    return;
                }
            }
        }
        log::debug!(target: "runner", "launcher gone without exit notification");
    }

    fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.lock();
        self.close_locked(&mut inner, reason)
    }

    /// Transition to [`ConnectionState::Closed`], return false if already closed.
    fn close_locked(&self, inner: &mut Inner, reason: CloseReason) -> bool {
        if inner.state == ConnectionState::Closed {
            return false;
        }
        let was_connected = inner.state == ConnectionState::Connected;
        inner.state = ConnectionState::Closed;
        inner.queue.clear();
        inner.writer = None;
        self.closed.notify_all();

        if let Some(socket) = inner.socket.take() {
            muted_error!(socket.shutdown(Shutdown::Both), "shutdown runner socket:");
        }
        if !was_connected {
            // unblock a listener still waiting for the runner
            if let Some(addr) = inner.listen_addr {
                muted_error!(TcpStream::connect_timeout(&addr, WAKE_TIMEOUT), "wake listener:");
            }
        }

        log::info!(target: "runner", "runner connection closed: {reason:?}");
        self.emit(RunnerEvent::Closed(reason));
        true
    }
}

/// Bind a listener, IPv4 addresses first, runners connect over IPv4.
fn bind_listener(hostname: &str, port: u16) -> Result<TcpListener, ConnectorError> {
    let bind_err = |source| ConnectorError::Bind {
        addr: format!("{hostname}:{port}"),
        source,
    };

    let mut addrs: Vec<SocketAddr> = (hostname, port)
        .to_socket_addrs()
        .map_err(bind_err)?
        .collect();
    addrs.sort_by_key(SocketAddr::is_ipv6);

    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = e,
        }
    }
    Err(bind_err(last_err))
}

/// Debugger side of the runner channel.
pub struct RunnerConnector {
    shared: Arc<Shared>,
    launcher: Mutex<Box<dyn Launcher>>,
    hostname: String,
    port: u16,
}

impl RunnerConnector {
    /// Create a connector, return it with the receiver of its events.
    ///
    /// Port `0` asks the OS for an ephemeral port, the runner is told the actual one.
    pub fn new(
        launcher: impl Launcher + 'static,
        hostname: impl Into<String>,
        port: u16,
    ) -> (Self, Receiver<RunnerEvent>) {
        let (events_tx, events_rx) = mpsc::channel();
        let shared = Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Unconnected,
                started: false,
                next_id: 0,
                pending: PendingRequests::new(),
                queue: VecDeque::new(),
                writer: None,
                socket: None,
                listen_addr: None,
                connect_hook: None,
            }),
            closed: Condvar::new(),
            events: events_tx,
            tracer: OnceLock::new(),
        };

        let connector = Self {
            shared: Arc::new(shared),
            launcher: Mutex::new(Box::new(launcher)),
            hostname: hostname.into(),
            port,
        };
        (connector, events_rx)
    }

    /// Trace all wire traffic with this tracer. Only the first tracer is installed.
    pub fn set_tracer(&self, tracer: WireTracer) {
        _ = self.shared.tracer.set(tracer);
    }

    pub fn set_connect_hook(&self, hook: impl FnMut(&mut Outbox<'_>) + Send + 'static) {
        self.shared.lock().connect_hook = Some(Box::new(hook));
    }

    /// Start listening and launch the runner. Return the address the runner connects to.
    pub fn start(&self) -> Result<SocketAddr, ConnectorError> {
        {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed {
                return Err(ConnectorError::Closed);
            }
            if inner.started {
                return Err(ConnectorError::AlreadyStarted);
            }
            inner.started = true;
        }

        let listener = bind_listener(&self.hostname, self.port)?;
        let addr = listener.local_addr()?;
        self.shared.lock().listen_addr = Some(addr);
        log::info!(target: "runner", "listening for runner on {addr}");

        let shared = self.shared.clone();
        thread::spawn(move || shared.serve(listener));

        let (launcher_tx, launcher_rx) = mpsc::channel();
        let shared = self.shared.clone();
        thread::spawn(move || shared.supervise(launcher_rx));

        let launched = self
            .launcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(addr, &self.hostname, launcher_tx);
        if let Err(e) = launched {
            log::error!(target: "runner", "launch runner: {e:#}");
            self.shared.close(CloseReason::LaunchFailed(e.to_string()));
            return Err(e.into());
        }

        Ok(addr)
    }

    /// Send a request to the runner, return a handle resolved by the runner reply.
    ///
    /// Requests issued before the runner connects are queued. A request whose reply never
    /// arrives (for example, the runner exited first) is never resolved. Never blocks on the
    /// socket, frames are written by a dedicated writer thread.
    pub fn request(&self, msg: DebuggerMessage, args: Value) -> Result<PendingReply, ConnectorError> {
        self.request_with(|outbox| outbox.request(msg, args))
    }

    /// Run `f` with exclusive access to the outbound request stream.
    ///
    /// No other request, connect hook included, is issued while `f` runs, so state updated by
    /// `f` stays in step with the requests it sends.
    pub fn request_with<R>(&self, f: impl FnOnce(&mut Outbox<'_>) -> R) -> R {
        let mut inner = self.shared.lock();
        f(&mut Outbox {
            shared: &self.shared,
            inner: &mut *inner,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Return the number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Close the connection and stop the runner.
    pub fn shutdown(&self) {
        self.shared.close(CloseReason::Terminated);
        weak_error!(
            self.launcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .kill(),
            "stop runner:"
        );
    }
}

impl Drop for RunnerConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
