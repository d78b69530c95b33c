use std::io;
use std::path::PathBuf;

/// Failures of the newline-delimited JSON codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope serialization: {0}")]
    Encode(serde_json::Error),
    #[error("malformed envelope `{fragment}`: {source}")]
    Decode {
        fragment: String,
        source: serde_json::Error,
    },
}

/// Protocol violations observed on the runner channel. They are reported as events and never
/// terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("received reply to unknown request {0}")]
    UnknownReply(u64),
    #[error("received unknown packet type `{0}`")]
    UnknownPacketType(String),
    #[error("received unknown request `{0}`")]
    UnknownRequest(String),
    #[error("received unexpected runner request `{0}`")]
    UnexpectedRequest(String),
    #[error("{0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("runner interpreter `{0}` not found: {1}")]
    InterpreterNotFound(String, which::Error),
    #[error("spawn runner process: {0}")]
    Spawn(io::Error),
    #[error("create output pipe: {0}")]
    Pipe(io::Error),
    #[error("runner already started")]
    AlreadyStarted,
    #[cfg(unix)]
    #[error("kill runner process: {0}")]
    Kill(nix::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    // --------------------------------- lifecycle errors ------------------------------------------
    #[error("connector already started")]
    AlreadyStarted,
    #[error("connection closed")]
    Closed,

    // --------------------------------- transport errors ------------------------------------------
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("runner transport: {0}")]
    Transport(#[from] io::Error),

    // --------------------------------- third party errors ----------------------------------------
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("launch runner: {0}")]
    Launch(#[from] LaunchError),
}

impl ConnectorError {
    /// Return true if the session can't continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectorError::AlreadyStarted => false,
            ConnectorError::Codec(_) => false,

            ConnectorError::Closed => true,
            ConnectorError::Bind { .. } => true,
            ConnectorError::Transport(_) => true,
            ConnectorError::Launch(_) => true,
        }
    }
}

/// Failures while waiting for, or decoding, a runner reply.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("session is gone, reply will never arrive")]
    SessionGone,
    #[error("no reply in time")]
    Timeout,
    #[error("unexpected reply payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("runner returned {returned} breakpoints for {requested} requested lines")]
    BreakpointMismatch { requested: usize, returned: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {0}: {1}")]
    Read(PathBuf, io::Error),
    #[error("parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("`{0}` is required")]
    Missing(&'static str),
}

/// Return true for transport errors that happen while the runner is shutting down.
pub(crate) fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: module_path!(), "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: module_path!(), concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs. The record target is the
/// module of the macro call.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
