//! Runner wire protocol: envelopes, message vocabularies and typed payloads.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Kind of envelope.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum PacketType {
    #[strum(serialize = "REQUEST")]
    Request,
    #[strum(serialize = "REPLY")]
    Reply,
}

/// Messages sent by the debugger to the runner.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum DebuggerMessage {
    #[strum(serialize = "PAUSE")]
    Pause,
    #[strum(serialize = "CONTINUE")]
    Continue,
    #[strum(serialize = "TERMINATE")]
    Terminate,
    #[strum(serialize = "STEP")]
    Step,
    #[strum(serialize = "STEP_IN")]
    StepIn,
    #[strum(serialize = "STEP_OUT")]
    StepOut,
    #[strum(serialize = "CALL_STACK")]
    CallStack,
    #[strum(serialize = "SET_BREAKPOINTS")]
    SetBreakpoints,
    #[strum(serialize = "CLEAR_BREAKPOINTS")]
    ClearBreakpoints,
    #[strum(serialize = "VARIABLES")]
    Variables,
    #[strum(serialize = "EVALUATE")]
    Evaluate,
}

/// Messages sent by the runner to the debugger.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum RunnerMessage {
    #[strum(serialize = "CALL_STACK")]
    CallStack,
    #[strum(serialize = "SET_BREAKPOINTS")]
    SetBreakpoints,
    #[strum(serialize = "BREAKPOINT")]
    Breakpoint,
    #[strum(serialize = "STEP")]
    Step,
    #[strum(serialize = "STOP_ON_ENTRY")]
    StopOnEntry,
}

/// Unit of wire communication.
///
/// `kind` and `msg` are kept as raw strings so that an envelope with an unknown kind or tag
/// still decodes and can be reported as a protocol error. Runner replies may omit `msg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default)]
    pub args: Value,
}

impl Envelope {
    pub fn request(id: u64, msg: DebuggerMessage, args: Value) -> Self {
        Self {
            id,
            kind: PacketType::Request.to_string(),
            msg: Some(msg.to_string()),
            args: normalize_args(args),
        }
    }

    pub fn reply(id: u64, msg: Option<&str>, args: Value) -> Self {
        Self {
            id,
            kind: PacketType::Reply.to_string(),
            msg: msg.map(ToOwned::to_owned),
            args: normalize_args(args),
        }
    }

    /// Return envelope kind, [`None`] if kind is unknown.
    pub fn packet_type(&self) -> Option<PacketType> {
        self.kind.parse().ok()
    }

    /// Return message tag or empty string if envelope has no tag.
    pub fn tag(&self) -> &str {
        self.msg.as_deref().unwrap_or_default()
    }
}

/// Runner expects an object even for messages without arguments.
fn normalize_args(args: Value) -> Value {
    if args.is_null() {
        json!({})
    } else {
        args
    }
}

/// Breakpoint as the runner sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRecord {
    pub id: i64,
    pub line: u32,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBreakpointsArgs {
    pub path: String,
    pub lines: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearBreakpointsArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBreakpointsReply {
    pub breakpoints: Vec<BreakpointRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: i64,
    pub name: String,
    pub file: String,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStackReply {
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariablesArgs {
    pub frame_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariablesReply {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateArgs {
    pub expression: String,
    pub frame_id: i64,
}

/// Arguments of a runner `BREAKPOINT` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BreakpointHit {
    pub breakpoint: BreakpointRecord,
}
