//! Runner communication: wire protocol, request correlation, connection and process supervision.

pub mod codec;
pub mod connector;
pub mod launcher;
pub mod pending;
pub mod protocol;
pub mod tracer;

pub use connector::{CloseReason, ConnectionState, RunnerConnector, RunnerEvent};
pub use launcher::{Launcher, LauncherEvent, RunnerLauncher};
pub use pending::{Pending, PendingReply};
