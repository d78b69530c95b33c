//! Line oriented console over a [`DebugSession`].

pub mod command;
pub mod print;

use crate::runner::CloseReason;
use crate::session::breakpoint::Breakpoint;
use crate::session::{DebugSession, SessionEvent};
use crate::weak_error;
use command::Command;
use crossterm::style::Stylize;
use print::style::{ErrorView, FilePathView, FunctionNameView, KeywordView};
use print::ExternalPrinter;
use rustyline::error::ReadlineError;
use rustyline::history::MemHistory;
use rustyline::{Config, Editor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WELCOME_TEXT: &str = "suitedbg greets, type `help` for the list of commands";
const PROMPT: &str = "(sdb) ";
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub const HELP: &str = r#"
Available debugger commands:

b, break <path> <line>..        -- replace breakpoints of a source, without lines show current ones
clear <path>                    -- remove all breakpoints of a source
c, continue                     -- continue suite execution
n, next                         -- step over the current keyword
s, step                         -- step into the current keyword
out, finish                     -- run until the current keyword returns
pause                           -- pause suite execution
bt                              -- print the call stack
vars <frame>                    -- show variables of a frame (0 by default)
eval <expression>               -- evaluate an expression in the top frame
h, help                         -- show help
q, quit                         -- terminate the session and exit
"#;

type SdbEditor = Editor<(), MemHistory>;

fn create_editor() -> anyhow::Result<SdbEditor> {
    let config = Config::builder().history_ignore_space(true).build();
    Ok(Editor::with_history(config, MemHistory::new())?)
}

fn describe_close(reason: &CloseReason) -> String {
    match reason {
        CloseReason::RunnerExited(Some(code)) => format!("runner exited with code {code}"),
        CloseReason::RunnerExited(None) => "runner killed by a signal".to_string(),
        CloseReason::Terminated => "terminated by the debugger".to_string(),
        CloseReason::LaunchFailed(e) => format!("runner launch failed: {e}"),
        CloseReason::TransportFailure(e) => format!("connection failure: {e}"),
        CloseReason::Disconnected => "runner dropped the connection".to_string(),
    }
}

fn render_breakpoint(action: &str, bp: &Breakpoint) -> String {
    let state = if bp.verified { "verified" } else { "unverified" };
    format!(
        "{action} {} at {}:{} ({state})",
        bp.id,
        FilePathView::from(&bp.source),
        bp.line
    )
}

fn print_events(events: Receiver<SessionEvent>, printer: ExternalPrinter, finished: Arc<AtomicBool>) {
    for event in events {
        let msg = match event {
            SessionEvent::Connected => "Runner connected".to_string(),
            SessionEvent::Terminated(reason) => {
                finished.store(true, Ordering::SeqCst);
                format!("Session is over: {}", describe_close(&reason))
            }
            SessionEvent::Error(e) => ErrorView::from(format!("runner protocol error: {e}")).to_string(),
            SessionEvent::StoppedOnEntry => "Stopped on entry".to_string(),
            SessionEvent::StoppedOnStep => "Stopped after step".to_string(),
            SessionEvent::StoppedOnBreakpoint(Some(record)) => {
                format!("Hit breakpoint {} at line {}", record.id, record.line)
            }
            SessionEvent::StoppedOnBreakpoint(None) => "Hit breakpoint".to_string(),
            SessionEvent::BreakpointValidated(bp) => render_breakpoint("Breakpoint", &bp),
            SessionEvent::Output(line) => line,
        };
        printer.print(msg);
    }
}

pub struct TerminalApplication {
    session: DebugSession,
    events: Receiver<SessionEvent>,
    reply_timeout: Duration,
}

impl TerminalApplication {
    pub fn new(session: DebugSession, events: Receiver<SessionEvent>) -> Self {
        Self {
            session,
            events,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Set how long a command waits for the runner reply.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn run(self) -> anyhow::Result<()> {
        let mut editor = create_editor()?;
        let finished = Arc::new(AtomicBool::new(false));

        {
            let printer = ExternalPrinter::new(&mut editor);
            let finished = finished.clone();
            let events = self.events;
            thread::spawn(move || print_events(events, printer, finished));
        }

        let app_loop = AppLoop {
            session: self.session,
            printer: ExternalPrinter::new(&mut editor),
            reply_timeout: self.reply_timeout,
        };

        println!("{WELCOME_TEXT}");
        loop {
            let input = match editor.readline(PROMPT) {
                Ok(input) => input,
                Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
                Err(e) => {
                    app_loop.finish();
                    return Err(e.into());
                }
            };
            _ = editor.add_history_entry(&input);

            if finished.load(Ordering::SeqCst) {
                app_loop.printer.print("Session is over, exit");
                break;
            }

            match Command::parse(&input) {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(e) = app_loop.handle_command(command) {
                        app_loop
                            .printer
                            .print(ErrorView::from(format!("error: {e:#}")));
                    }
                }
                Err(e) => app_loop.printer.print(ErrorView::from(e)),
            }
        }

        app_loop.finish();
        Ok(())
    }
}

struct AppLoop {
    session: DebugSession,
    printer: ExternalPrinter,
    reply_timeout: Duration,
}

impl AppLoop {
    fn handle_command(&self, command: Command) -> anyhow::Result<()> {
        let timeout = self.reply_timeout;
        match command {
            Command::Break { source, lines } if lines.is_empty() => {
                let lines = self.session.breakpoint_lines(&source);
                if lines.is_empty() {
                    self.printer.print(format!(
                        "No breakpoints in {}",
                        FilePathView::from(&source)
                    ));
                }
                for line in lines {
                    self.printer
                        .print(format!("- {}:{line}", FilePathView::from(&source)));
                }
            }
            Command::Break { source, lines } => {
                let breakpoints = self
                    .session
                    .set_breakpoints(&source, lines)?
                    .wait_timeout(timeout)?;
                for bp in &breakpoints {
                    self.printer.print(render_breakpoint("New breakpoint", bp));
                }
            }
            Command::Clear(source) => {
                self.session.clear_breakpoints(&source)?.wait_timeout(timeout)?;
                self.printer.print(format!(
                    "Breakpoints of {} removed",
                    FilePathView::from(&source)
                ));
            }
            Command::Continue => {
                self.session.resume()?.wait_timeout(timeout)?;
            }
            Command::Next => {
                self.session.next()?.wait_timeout(timeout)?;
            }
            Command::StepIn => {
                self.session.step_in()?.wait_timeout(timeout)?;
            }
            Command::StepOut => {
                self.session.step_out()?.wait_timeout(timeout)?;
            }
            Command::Pause => {
                self.session.pause()?.wait_timeout(timeout)?;
            }
            Command::Backtrace => {
                let frames = self.session.call_stack()?.wait_timeout(timeout)?;
                for (num, frame) in frames.iter().enumerate() {
                    let info = format!(
                        "#{} {} at {}:{}",
                        frame.index,
                        FunctionNameView::from(&frame.name),
                        FilePathView::from(&frame.file),
                        frame.line
                    );
                    if num == 0 {
                        self.printer.print(info.bold());
                    } else {
                        self.printer.print(info);
                    }
                }
            }
            Command::Variables(frame_id) => {
                let vars = self.session.variables(frame_id)?.wait_timeout(timeout)?;
                for var in vars {
                    self.printer
                        .print(format!("{} = {}", KeywordView::from(&var.name), var.value));
                }
            }
            Command::Evaluate(expression) => {
                let value = self
                    .session
                    .evaluate(&expression, 0)?
                    .wait_timeout(timeout)?;
                self.printer.print(value);
            }
            Command::Help => self.printer.print(HELP),
            Command::Quit | Command::SkipInput => {}
        }
        Ok(())
    }

    /// Ask the runner to terminate, then tear the session down.
    fn finish(&self) {
        if self.session.is_connected() {
            if let Some(reply) = weak_error!(self.session.terminate(), "terminate runner:") {
                weak_error!(reply.wait_timeout(self.reply_timeout), "terminate runner:");
            }
        }
        self.session.shutdown();
    }
}
