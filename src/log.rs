use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;

/// Install the global logger.
///
/// Filtering is controlled by `RUST_LOG`, `default_filter` is used when it is not set.
/// With `log_file` all records are appended to that file instead of stderr, so they never
/// interleave with console output.
pub fn init(default_filter: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("install logger")?;
    Ok(())
}
