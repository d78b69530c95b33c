use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use suitedbg::config::{FileConfig, SessionConfig};
use suitedbg::console::TerminalApplication;
use suitedbg::runner::tracer::WireTracer;
use suitedbg::session::DebugSession;
use suitedbg::weak_error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runner script that executes the suite and connects back to the debugger
    runner: Option<PathBuf>,

    /// Suite to debug
    suite: Option<PathBuf>,

    /// Hostname the runner connects to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, 0 for any free port
    #[arg(long, short)]
    port: Option<u16>,

    /// Stop before the first step of the suite
    #[arg(long)]
    stop_on_entry: bool,

    /// Runner working directory, suite directory by default
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Interpreter that runs the runner script
    #[arg(long)]
    interpreter: Option<String>,

    /// Initial breakpoint as `path:line`, may be repeated
    #[arg(long = "break", short)]
    breakpoints: Vec<String>,

    /// Config file, `~/.config/suitedbg/config.toml` by default
    #[arg(long, env = "SUITEDBG_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs into this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Trace runner wire traffic into the log file
    #[arg(long, requires = "log_file")]
    trace_wire: bool,
}

impl Args {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            runner: self.runner.clone(),
            suite: self.suite.clone(),
            hostname: self.host.clone(),
            port: self.port,
            stop_on_entry: self.stop_on_entry.then_some(true),
            cwd: self.cwd.clone(),
            interpreter: self.interpreter.clone(),
        }
    }
}

/// Parse `path:line`, the path itself may contain colons.
fn parse_breakpoint(value: &str) -> anyhow::Result<(String, u32)> {
    let Some((path, line)) = value.rsplit_once(':') else {
        bail!("breakpoint `{value}` must look like `path:line`");
    };
    let line = line
        .parse()
        .with_context(|| format!("invalid line in breakpoint `{value}`"))?;
    Ok((path.to_string(), line))
}

/// Group initial breakpoints by source, keeping the order they were given in.
fn group_breakpoints(values: &[String]) -> anyhow::Result<Vec<(String, Vec<u32>)>> {
    let mut groups: Vec<(String, Vec<u32>)> = vec![];
    for value in values {
        let (path, line) = parse_breakpoint(value)?;
        match groups.iter_mut().find(|(source, _)| *source == path) {
            Some((_, lines)) => lines.push(line),
            None => groups.push((path, vec![line])),
        }
    }
    Ok(groups)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    suitedbg::log::init("warn", args.log_file.as_deref())?;

    let file_config = FileConfig::load(args.config.as_deref())?;
    let config = SessionConfig::try_from(args.overrides().or(file_config))?;
    let initial_breakpoints = group_breakpoints(&args.breakpoints)?;

    let (session, events) = DebugSession::launch(&config);
    if let Some(log_file) = args.log_file.as_deref().filter(|_| args.trace_wire) {
        session.set_tracer(WireTracer::new(log_file)?);
    }

    // queued until the runner connects
    for (source, lines) in initial_breakpoints {
        weak_error!(
            session.set_breakpoints(&source, lines),
            "initial breakpoints:"
        );
    }

    let addr = session
        .start()
        .with_context(|| format!("start session for {}", config.suite.display()))?;
    log::info!(target: "console", "waiting for runner on {addr}");

    TerminalApplication::new(session, events).run()
}
