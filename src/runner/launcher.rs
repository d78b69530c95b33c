//! Runner process supervision.

use crate::config::ExecutionMode;
use crate::error::LaunchError;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long the exit notification waits for the rest of the runner stdout. Processes spawned
/// by the runner may keep the pipe open after the runner itself is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Notifications from a supervised runner.
#[derive(Debug, Clone, PartialEq)]
pub enum LauncherEvent {
    /// Line written by the runner to its standard output.
    Output(String),
    /// Runner exited, `None` if it was terminated by a signal. Sent exactly once.
    Exit(Option<i32>),
}

/// Starts the runner that will connect back to the debugger.
pub trait Launcher: Send {
    /// Start the runner. It must connect to `endpoint` as a TCP client.
    fn start(
        &mut self,
        endpoint: SocketAddr,
        hostname: &str,
        events: Sender<LauncherEvent>,
    ) -> Result<(), LaunchError>;

    /// Forcibly stop the runner.
    fn kill(&mut self) -> Result<(), LaunchError> {
        Ok(())
    }
}

#[cfg(not(windows))]
const DEFAULT_INTERPRETER: (&str, &[&str]) = ("python3", &[]);
#[cfg(windows)]
const DEFAULT_INTERPRETER: (&str, &[&str]) = ("py", &["-3"]);

/// Launch a runner script with a python interpreter.
pub struct RunnerLauncher {
    runner: PathBuf,
    suite: PathBuf,
    mode: ExecutionMode,
    cwd: Option<PathBuf>,
    interpreter: Option<String>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl RunnerLauncher {
    pub fn new(runner: impl Into<PathBuf>, suite: impl Into<PathBuf>, mode: ExecutionMode) -> Self {
        Self {
            runner: runner.into(),
            suite: suite.into(),
            mode,
            cwd: None,
            interpreter: None,
            pid: None,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set working directory, suite directory is used by default.
    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Use this interpreter instead of a platform default.
    pub fn with_interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn working_dir(&self) -> PathBuf {
        if let Some(cwd) = &self.cwd {
            return cwd.clone();
        }
        match self.suite.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Return interpreter and its arguments: `[prefix.., runner, hostname, port, mode, suite]`.
    pub fn command_line(&self, hostname: &str, port: u16) -> (String, Vec<OsString>) {
        let (program, prefix): (String, &[&str]) = match &self.interpreter {
            Some(interpreter) => (interpreter.clone(), &[]),
            None => (DEFAULT_INTERPRETER.0.to_string(), DEFAULT_INTERPRETER.1),
        };

        let mut args: Vec<OsString> = prefix.iter().map(OsString::from).collect();
        args.push(self.runner.clone().into_os_string());
        args.push(hostname.into());
        args.push(port.to_string().into());
        args.push(self.mode.to_string().into());
        args.push(self.suite.clone().into_os_string());
        (program, args)
    }
}

fn resolve_program(program: &str) -> Result<PathBuf, LaunchError> {
    if Path::new(program).exists() {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| LaunchError::InterpreterNotFound(program.to_string(), e))
}

/// Relay lines until EOF, invalid UTF-8 is replaced, not treated as an error.
fn relay_lines(stream: impl Read, mut sink: impl FnMut(String)) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink(line.trim_end_matches(&['\n', '\r'][..]).to_string());
            }
            Err(e) => {
                log::debug!(target: "runner", "stop relaying runner output: {e}");
                return;
            }
        }
    }
}

impl Launcher for RunnerLauncher {
    fn start(
        &mut self,
        endpoint: SocketAddr,
        hostname: &str,
        events: Sender<LauncherEvent>,
    ) -> Result<(), LaunchError> {
        if self.pid.is_some() {
            return Err(LaunchError::AlreadyStarted);
        }

        let (program, args) = self.command_line(hostname, endpoint.port());
        log::debug!(target: "runner", "runner endpoint is {endpoint}");
        let program = resolve_program(&program)?;
        let cwd = self.working_dir();

        let (stdout_reader, stdout_writer) = os_pipe::pipe().map_err(LaunchError::Pipe)?;
        let (stderr_reader, stderr_writer) = os_pipe::pipe().map_err(LaunchError::Pipe)?;

        log::info!(
            target: "runner",
            "spawning {} {args:?} with working directory {}",
            program.display(),
            cwd.display()
        );

        let mut child = {
            let mut command = Command::new(&program);
            command
                .args(&args)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(stdout_writer)
                .stderr(stderr_writer);
            // command is dropped at the end of this block, so the pipe writers are closed
            // in this process and readers see EOF when the runner exits
            command.spawn().map_err(LaunchError::Spawn)?
        };
        self.pid = Some(child.id());

        thread::spawn(move || {
            relay_lines(stderr_reader, |line| {
                log::info!(target: "runner", "{line}");
            })
        });

        // disconnected once the stdout relay is done
        let (drained_tx, drained_rx) = mpsc::channel::<()>();
        {
            let events = events.clone();
            thread::spawn(move || {
                relay_lines(stdout_reader, |line| {
                    _ = events.send(LauncherEvent::Output(line));
                });
                drop(drained_tx);
            });
        }

        let exited = self.exited.clone();
        thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => {
                    log::info!(target: "runner", "runner exited: {status}");
                    status.code()
                }
                Err(e) => {
                    log::warn!(target: "runner", "wait for runner: {e}");
                    None
                }
            };
            exited.store(true, Ordering::SeqCst);
            if drained_rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT) == Err(mpsc::RecvTimeoutError::Timeout) {
                log::debug!(target: "runner", "runner stdout is still open, report exit anyway");
            }
            _ = events.send(LauncherEvent::Exit(code));
        });

        Ok(())
    }

    #[cfg(unix)]
    fn kill(&mut self) -> Result<(), LaunchError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Kill(e)),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> Result<(), LaunchError> {
        log::warn!(target: "runner", "killing the runner is not supported on this platform");
        Ok(())
    }
}
