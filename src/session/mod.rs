//! Debug session: one supervised runner, its connection and the breakpoint state.

pub mod breakpoint;

use crate::config::SessionConfig;
use crate::error::{CodecError, ConnectorError, ProtocolError, ReplyError};
use crate::runner::connector::{
    CloseReason, ConnectionState, Outbox, RunnerConnector, RunnerEvent,
};
use crate::runner::launcher::RunnerLauncher;
use crate::runner::pending::{Pending, PendingReply};
use crate::runner::protocol::{
    BreakpointRecord, CallStackReply, ClearBreakpointsArgs, DebuggerMessage, EvaluateArgs, Frame,
    SetBreakpointsArgs, SetBreakpointsReply, Variable, VariablesArgs, VariablesReply,
};
use crate::runner::tracer::WireTracer;
use crate::weak_error;
use breakpoint::{zip_records, Breakpoint, BreakpointSets};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

/// Events of a debug session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    /// Session is over, sent exactly once.
    Terminated(CloseReason),
    Error(ProtocolError),
    StoppedOnEntry,
    StoppedOnStep,
    StoppedOnBreakpoint(Option<BreakpointRecord>),
    /// Runner confirmed a breakpoint replayed after connection.
    BreakpointValidated(Breakpoint),
    Output(String),
}

/// Breakpoint set re-sent to a freshly connected runner, with its pending reply.
struct Replay {
    source: String,
    lines: Vec<u32>,
    reply: PendingReply,
}

type Replays = Arc<Mutex<Vec<Replay>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_args(args: impl Serialize) -> Result<Value, ConnectorError> {
    serde_json::to_value(args).map_err(|e| CodecError::Encode(e).into())
}

/// Debugger side of a single runner session.
///
/// Execution control requests are forwarded as is. The runner owns the execution state, it is
/// observed only through [`SessionEvent`]s.
pub struct DebugSession {
    connector: Arc<RunnerConnector>,
    breakpoints: Arc<Mutex<BreakpointSets>>,
}

impl DebugSession {
    /// Create a session around a connector that is not started yet, return it with the receiver
    /// of session events.
    ///
    /// # Arguments
    ///
    /// * `connector`: runner connector
    /// * `runner_events`: event receiver returned together with the connector
    /// * `stop_on_entry`: if false the runner is continued as soon as it reports a stop on entry
    pub fn new(
        connector: RunnerConnector,
        runner_events: Receiver<RunnerEvent>,
        stop_on_entry: bool,
    ) -> (Self, Receiver<SessionEvent>) {
        let connector = Arc::new(connector);
        let breakpoints = Arc::new(Mutex::new(BreakpointSets::default()));
        let replays: Replays = Arc::new(Mutex::new(vec![]));
        let (events_tx, events_rx) = mpsc::channel();

        connector.set_connect_hook({
            let breakpoints = breakpoints.clone();
            let replays = replays.clone();
            move |outbox| replay_breakpoints(outbox, &breakpoints, &replays)
        });

        thread::spawn({
            let connector = Arc::downgrade(&connector);
            move || dispatch_events(runner_events, connector, replays, events_tx, stop_on_entry)
        });

        let session = Self {
            connector,
            breakpoints,
        };
        (session, events_rx)
    }

    /// Create a session that launches a runner process described by `config`.
    pub fn launch(config: &SessionConfig) -> (Self, Receiver<SessionEvent>) {
        let launcher = RunnerLauncher::new(
            config.runner.clone(),
            config.suite.clone(),
            config.execution_mode(),
        )
        .with_cwd(config.cwd.clone())
        .with_interpreter(config.interpreter.clone());

        let (connector, events) =
            RunnerConnector::new(launcher, config.hostname.clone(), config.port);
        Self::new(connector, events, config.stop_on_entry)
    }

    pub fn set_tracer(&self, tracer: WireTracer) {
        self.connector.set_tracer(tracer)
    }

    /// Start listening and launch the runner.
    pub fn start(&self) -> Result<SocketAddr, ConnectorError> {
        self.connector.start()
    }

    pub fn state(&self) -> ConnectionState {
        self.connector.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Replace breakpoints of a source, return the runner view of them in request order.
    ///
    /// The local breakpoint map and the runner are updated as one step, concurrent updates of
    /// the same source reach the runner in the order they are recorded.
    pub fn set_breakpoints(
        &self,
        source: &str,
        lines: Vec<u32>,
    ) -> Result<Pending<Vec<Breakpoint>>, ConnectorError> {
        let args = to_args(SetBreakpointsArgs {
            path: source.to_string(),
            lines: lines.clone(),
        })?;
        let reply = self.connector.request_with(|outbox| {
            lock(&self.breakpoints).replace(source, lines.clone());
            outbox.request(DebuggerMessage::SetBreakpoints, args)
        })?;

        let source = source.to_string();
        Ok(Pending::map(reply, move |payload| {
            let reply: SetBreakpointsReply = serde_json::from_value(payload)?;
            zip_records(&source, &lines, reply.breakpoints)
        }))
    }

    /// Forget all breakpoints of a source.
    pub fn clear_breakpoints(&self, source: &str) -> Result<PendingReply, ConnectorError> {
        let args = to_args(ClearBreakpointsArgs {
            path: source.to_string(),
        })?;
        self.connector.request_with(|outbox| {
            lock(&self.breakpoints).remove(source);
            outbox.request(DebuggerMessage::ClearBreakpoints, args)
        })
    }

    /// Return requested breakpoint lines of a source, no runner round trip.
    pub fn breakpoint_lines(&self, source: &str) -> Vec<u32> {
        lock(&self.breakpoints)
            .lines(source)
            .map(<[u32]>::to_vec)
            .unwrap_or_default()
    }

    fn control(&self, msg: DebuggerMessage) -> Result<PendingReply, ConnectorError> {
        self.connector.request(msg, json!({}))
    }

    pub fn pause(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::Pause)
    }

    pub fn resume(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::Continue)
    }

    pub fn next(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::Step)
    }

    pub fn step_in(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::StepIn)
    }

    pub fn step_out(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::StepOut)
    }

    /// Ask the runner to stop executing and exit.
    pub fn terminate(&self) -> Result<PendingReply, ConnectorError> {
        self.control(DebuggerMessage::Terminate)
    }

    pub fn call_stack(&self) -> Result<Pending<Vec<Frame>>, ConnectorError> {
        let reply = self
            .connector
            .request(DebuggerMessage::CallStack, json!({}))?;
        Ok(Pending::map(reply, |payload| {
            let reply: CallStackReply = serde_json::from_value(payload)?;
            Ok(reply.frames)
        }))
    }

    pub fn variables(&self, frame_id: i64) -> Result<Pending<Vec<Variable>>, ConnectorError> {
        let reply = self
            .connector
            .request(DebuggerMessage::Variables, to_args(VariablesArgs { frame_id })?)?;
        Ok(Pending::map(reply, |payload| {
            let reply: VariablesReply = serde_json::from_value(payload)?;
            Ok(reply.variables)
        }))
    }

    pub fn evaluate(
        &self,
        expression: &str,
        frame_id: i64,
    ) -> Result<Pending<Value>, ConnectorError> {
        let args = to_args(EvaluateArgs {
            expression: expression.to_string(),
            frame_id,
        })?;
        let reply = self.connector.request(DebuggerMessage::Evaluate, args)?;
        Ok(Pending::deserialize(reply))
    }

    /// Close the connection and stop the runner.
    pub fn shutdown(&self) {
        self.connector.shutdown()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Re-send all known breakpoint sets to a freshly connected runner.
fn replay_breakpoints(outbox: &mut Outbox<'_>, breakpoints: &Mutex<BreakpointSets>, replays: &Replays) {
    let sets = lock(breakpoints).clone();
    for (source, lines) in sets.iter() {
        let args = SetBreakpointsArgs {
            path: source.to_string(),
            lines: lines.to_vec(),
        };
        let Some(args) = weak_error!(to_args(args)) else {
            continue;
        };
        match outbox.request(DebuggerMessage::SetBreakpoints, args) {
            Ok(reply) => lock(replays).push(Replay {
                source: source.to_string(),
                lines: lines.to_vec(),
                reply,
            }),
            Err(e) => {
                log::warn!(target: "session", "replay breakpoints of {source}: {e:#}");
                return;
            }
        }
    }
    log::debug!(target: "session", "{} breakpoint sets replayed", sets.len());
}

/// Report replayed breakpoints once the runner confirms them.
fn validate_replays(replays: Vec<Replay>, events: Sender<SessionEvent>) {
    for replay in replays {
        let breakpoints = replay.reply.wait().and_then(|payload| {
            let reply: SetBreakpointsReply = serde_json::from_value(payload)?;
            zip_records(&replay.source, &replay.lines, reply.breakpoints)
        });
        match breakpoints {
            Ok(breakpoints) => {
                for bp in breakpoints {
                    _ = events.send(SessionEvent::BreakpointValidated(bp));
                }
            }
            Err(ReplyError::SessionGone) => return,
            Err(e) => {
                log::warn!(target: "session", "validate breakpoints of {}: {e:#}", replay.source);
            }
        }
    }
}

fn dispatch_events(
    runner_events: Receiver<RunnerEvent>,
    connector: Weak<RunnerConnector>,
    replays: Replays,
    events: Sender<SessionEvent>,
    stop_on_entry: bool,
) {
    for event in runner_events {
        let event = match event {
            RunnerEvent::Connected => {
                let replays = std::mem::take(&mut *lock(&replays));
                if !replays.is_empty() {
                    let events = events.clone();
                    thread::spawn(move || validate_replays(replays, events));
                }
                SessionEvent::Connected
            }
            RunnerEvent::Closed(reason) => {
                _ = events.send(SessionEvent::Terminated(reason));
                return;
            }
            RunnerEvent::Error(e) => {
                log::warn!(target: "session", "runner protocol error: {e}");
                SessionEvent::Error(e)
            }
            RunnerEvent::StopOnEntry => {
                if !stop_on_entry {
                    if let Some(connector) = connector.upgrade() {
                        weak_error!(
                            connector.request(DebuggerMessage::Continue, json!({})),
                            "continue after entry:"
                        );
                    }
                }
                SessionEvent::StoppedOnEntry
            }
            RunnerEvent::StopOnStep => SessionEvent::StoppedOnStep,
            RunnerEvent::StopOnBreakpoint(record) => SessionEvent::StoppedOnBreakpoint(record),
            RunnerEvent::Output(line) => SessionEvent::Output(line),
        };
        _ = events.send(event);
    }
}
