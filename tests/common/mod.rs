#![allow(dead_code)]

use serde_json::{json, Value};
use std::fmt::Debug;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use suitedbg::error::LaunchError;
use suitedbg::runner::protocol::{Envelope, PacketType, RunnerMessage};
use suitedbg::runner::{Launcher, LauncherEvent};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Wait for the next event.
pub fn next_event<E: Debug>(events: &Receiver<E>) -> E {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("no event received in time")
}

/// Skip events until one matches the predicate.
pub fn wait_for<E: Debug>(events: &Receiver<E>, pred: impl Fn(&E) -> bool) -> E {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return event,
            Ok(event) => eprintln!("skip event: {event:?}"),
            Err(e) => panic!("expected event not received: {e}"),
        }
    }
}

/// Collect events until nothing arrives for [`QUIET_PERIOD`] or the channel disconnects.
pub fn drain<E>(events: &Receiver<E>) -> Vec<E> {
    let mut collected = vec![];
    loop {
        match events.recv_timeout(QUIET_PERIOD) {
            Ok(event) => collected.push(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return collected
            }
        }
    }
}

#[derive(Default)]
struct MockState {
    stream: Mutex<Option<TcpStream>>,
    events: Mutex<Option<Sender<LauncherEvent>>>,
    received: Mutex<Vec<Envelope>>,
    /// Replies held back until this many requests arrive, 0 to reply immediately.
    hold: Mutex<usize>,
    held: Mutex<Vec<Envelope>>,
    next_id: AtomicU64,
    exited: AtomicBool,
    killed: AtomicBool,
}

impl MockState {
    fn run(&self, endpoint: SocketAddr) {
        let start = Instant::now();
        let stream = loop {
            match TcpStream::connect(endpoint) {
                Ok(stream) => break stream,
                Err(e) if start.elapsed() < CONNECT_TIMEOUT => {
                    eprintln!("mock runner connect retry: {e}");
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => panic!("mock runner can't connect to {endpoint}: {e}"),
            }
        };
        stream.set_nodelay(true).unwrap();
        *lock(&self.stream) = Some(stream.try_clone().unwrap());

        self.request(RunnerMessage::StopOnEntry, json!({}));

        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else {
                return;
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope = serde_json::from_str(&line).unwrap();
            lock(&self.received).push(envelope.clone());
            if envelope.packet_type() == Some(PacketType::Request) {
                self.reply(reply_to(&envelope));
            }
        }
    }

    fn reply(&self, reply: Envelope) {
        let mut hold = lock(&self.hold);
        if *hold == 0 {
            self.write(&reply);
            return;
        }

        let mut held = lock(&self.held);
        held.push(reply);
        if held.len() == *hold {
            *hold = 0;
            for reply in held.drain(..).rev() {
                self.write(&reply);
            }
        }
    }

    fn request(&self, msg: RunnerMessage, args: Value) {
        let envelope = Envelope {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind: PacketType::Request.to_string(),
            msg: Some(msg.to_string()),
            args,
        };
        self.write(&envelope);
    }

    fn write(&self, envelope: &Envelope) {
        let mut data = serde_json::to_string(envelope).unwrap();
        data.push('\n');
        self.write_raw(&data);
    }

    /// Write into the socket, wait for the connection if the mock is not connected yet.
    fn write_raw(&self, data: &str) {
        let start = Instant::now();
        loop {
            if self.exited.load(Ordering::SeqCst) {
                return;
            }
            if let Some(stream) = lock(&self.stream).as_mut() {
                // the debugger may already be gone
                _ = stream.write_all(data.as_bytes());
                return;
            }
            assert!(
                start.elapsed() < CONNECT_TIMEOUT,
                "mock runner is not connected"
            );
            thread::sleep(CONNECT_RETRY_DELAY);
        }
    }
}

/// Canned runner replies.
fn reply_to(request: &Envelope) -> Envelope {
    let args = match request.tag() {
        "SET_BREAKPOINTS" => {
            let lines = request.args["lines"].as_array().cloned().unwrap_or_default();
            let breakpoints: Vec<Value> = lines
                .iter()
                .enumerate()
                .map(|(i, line)| json!({"id": i + 1, "line": line, "verified": true}))
                .collect();
            json!({ "breakpoints": breakpoints })
        }
        "CALL_STACK" => json!({
            "frames": [
                {"index": 0, "name": "Valid Login", "file": "/suites/login.robot", "line": 12},
                {"index": 1, "name": "Login Suite", "file": "/suites/login.robot", "line": 1},
            ]
        }),
        "VARIABLES" => json!({
            "variables": [{"name": "${USER}", "value": "demo"}]
        }),
        "EVALUATE" => request.args.clone(),
        _ => json!({}),
    };
    Envelope::reply(request.id, Some(request.tag()), args)
}

/// In-process runner speaking the wire protocol over TCP.
///
/// Connects on start, sends `STOP_ON_ENTRY` and replies to every debugger request. Clones share
/// the same state, so a test keeps one clone while the connector owns another.
#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold replies until `count` requests arrive, then send them in reverse order.
    pub fn hold_replies(&self, count: usize) {
        *lock(&self.state.hold) = count;
    }

    pub fn send_raw(&self, data: &str) {
        self.state.write_raw(data)
    }

    pub fn send_request(&self, msg: RunnerMessage, args: Value) {
        self.state.request(msg, args)
    }

    pub fn hit_breakpoint(&self, args: Value) {
        self.send_request(RunnerMessage::Breakpoint, args)
    }

    pub fn stop_on_step(&self) {
        self.send_request(RunnerMessage::Step, json!({}))
    }

    /// Close the connection and report exit to the supervisor.
    pub fn exit(&self, code: Option<i32>) {
        self.state.exited.store(true, Ordering::SeqCst);
        if let Some(stream) = lock(&self.state.stream).take() {
            _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(events) = lock(&self.state.events).take() {
            _ = events.send(LauncherEvent::Exit(code));
        }
    }

    /// Drop the connection but keep running.
    pub fn disconnect(&self) {
        if let Some(stream) = lock(&self.state.stream).take() {
            _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn output(&self, line: &str) {
        if let Some(events) = lock(&self.state.events).as_ref() {
            _ = events.send(LauncherEvent::Output(line.to_string()));
        }
    }

    pub fn received(&self) -> Vec<Envelope> {
        lock(&self.state.received).clone()
    }

    /// Return tags of received debugger requests in arrival order.
    pub fn received_tags(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|e| e.packet_type() == Some(PacketType::Request))
            .map(|e| e.tag().to_string())
            .collect()
    }

    /// Wait until a request with this tag arrives.
    pub fn wait_request(&self, tag: &str) -> Envelope {
        let start = Instant::now();
        loop {
            if let Some(envelope) = self.received().into_iter().find(|e| e.tag() == tag) {
                return envelope;
            }
            assert!(start.elapsed() < EVENT_TIMEOUT, "request {tag} not received");
            thread::sleep(CONNECT_RETRY_DELAY);
        }
    }

    /// Wait until `count` requests with this tag arrive, return them in arrival order.
    pub fn wait_requests(&self, tag: &str, count: usize) -> Vec<Envelope> {
        let start = Instant::now();
        loop {
            let requests: Vec<_> = self
                .received()
                .into_iter()
                .filter(|e| e.tag() == tag)
                .collect();
            if requests.len() >= count {
                return requests;
            }
            assert!(
                start.elapsed() < EVENT_TIMEOUT,
                "{} of {count} {tag} requests received",
                requests.len()
            );
            thread::sleep(CONNECT_RETRY_DELAY);
        }
    }

    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }
}

impl Launcher for MockRunner {
    fn start(
        &mut self,
        endpoint: SocketAddr,
        _hostname: &str,
        events: Sender<LauncherEvent>,
    ) -> Result<(), LaunchError> {
        *lock(&self.state.events) = Some(events);
        let state = self.state.clone();
        thread::spawn(move || state.run(endpoint));
        Ok(())
    }

    fn kill(&mut self) -> Result<(), LaunchError> {
        self.state.killed.store(true, Ordering::SeqCst);
        self.exit(None);
        Ok(())
    }
}

/// Launcher of a runner that never connects.
pub struct IdleLauncher;

impl Launcher for IdleLauncher {
    fn start(
        &mut self,
        _endpoint: SocketAddr,
        _hostname: &str,
        _events: Sender<LauncherEvent>,
    ) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// Launcher of a runner that can't be started.
pub struct FailingLauncher;

impl Launcher for FailingLauncher {
    fn start(
        &mut self,
        _endpoint: SocketAddr,
        _hostname: &str,
        _events: Sender<LauncherEvent>,
    ) -> Result<(), LaunchError> {
        Err(LaunchError::Spawn(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )))
    }
}
