use crate::error::ConfigError;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString, IntoStaticStr};

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5544;

/// How the runner starts executing a suite.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum ExecutionMode {
    /// Start running immediately.
    #[strum(serialize = "run")]
    Run,
    /// Stop before the first step.
    #[strum(serialize = "stop")]
    Stop,
}

impl ExecutionMode {
    pub fn from_stop_on_entry(stop_on_entry: bool) -> Self {
        if stop_on_entry {
            ExecutionMode::Stop
        } else {
            ExecutionMode::Run
        }
    }
}

/// Session configuration as it is written in a config file. All fields are optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub runner: Option<PathBuf>,
    pub suite: Option<PathBuf>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub stop_on_entry: Option<bool>,
    pub cwd: Option<PathBuf>,
    pub interpreter: Option<String>,
}

impl FileConfig {
    const DEFAULT_PATH: &'static str = ".config/suitedbg/config.toml";

    pub fn parse(data: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::de::from_str(data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Load config from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&data, path)
    }

    /// Load config from an explicit path or, if it exists, from the default location in the
    /// home directory. Missing default config is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let Some(default) = home::home_dir().map(|home| home.join(Self::DEFAULT_PATH)) else {
            return Ok(Self::default());
        };
        if !default.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&default)
    }

    /// Fill fields not set in `self` from `fallback`.
    pub fn or(self, fallback: FileConfig) -> FileConfig {
        FileConfig {
            runner: self.runner.or(fallback.runner),
            suite: self.suite.or(fallback.suite),
            hostname: self.hostname.or(fallback.hostname),
            port: self.port.or(fallback.port),
            stop_on_entry: self.stop_on_entry.or(fallback.stop_on_entry),
            cwd: self.cwd.or(fallback.cwd),
            interpreter: self.interpreter.or(fallback.interpreter),
        }
    }
}

/// Resolved configuration of a debug session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Runner script executed by the interpreter.
    pub runner: PathBuf,
    /// Suite to debug.
    pub suite: PathBuf,
    pub hostname: String,
    pub port: u16,
    pub stop_on_entry: bool,
    /// Runner working directory, suite directory if not set.
    pub cwd: Option<PathBuf>,
    /// Interpreter used instead of a platform default.
    pub interpreter: Option<String>,
}

impl SessionConfig {
    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from_stop_on_entry(self.stop_on_entry)
    }
}

impl TryFrom<FileConfig> for SessionConfig {
    type Error = ConfigError;

    fn try_from(cfg: FileConfig) -> Result<Self, Self::Error> {
        Ok(SessionConfig {
            runner: cfg.runner.ok_or(ConfigError::Missing("runner"))?,
            suite: cfg.suite.ok_or(ConfigError::Missing("suite"))?,
            hostname: cfg
                .hostname
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            stop_on_entry: cfg.stop_on_entry.unwrap_or_default(),
            cwd: cfg.cwd,
            interpreter: cfg.interpreter,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_file_config() {
        let data = r#"
            runner = "/opt/suitedbg/TestRunner.py"
            port = 6000
            stop_on_entry = true
        "#;
        let cfg = FileConfig::parse(data, Path::new("cfg.toml")).unwrap();
        assert_eq!(
            cfg.runner,
            Some(PathBuf::from("/opt/suitedbg/TestRunner.py"))
        );
        assert_eq!(cfg.port, Some(6000));
        assert_eq!(cfg.stop_on_entry, Some(true));
        assert_eq!(cfg.hostname, None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = FileConfig::parse("colour = 1", Path::new("cfg.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
    }

    #[test]
    fn test_resolve_defaults_and_overrides() {
        let file = FileConfig {
            runner: Some(PathBuf::from("runner.py")),
            port: Some(7000),
            ..Default::default()
        };
        let cli = FileConfig {
            suite: Some(PathBuf::from("suites/login.robot")),
            port: Some(7001),
            ..Default::default()
        };

        let cfg = SessionConfig::try_from(cli.or(file)).unwrap();
        assert_eq!(cfg.runner, PathBuf::from("runner.py"));
        assert_eq!(cfg.suite, PathBuf::from("suites/login.robot"));
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
        assert_eq!(cfg.execution_mode(), ExecutionMode::Run);
    }

    #[test]
    fn test_missing_suite() {
        let cfg = FileConfig {
            runner: Some(PathBuf::from("runner.py")),
            ..Default::default()
        };
        assert!(matches!(
            SessionConfig::try_from(cfg),
            Err(ConfigError::Missing("suite"))
        ));
    }

    #[test]
    fn test_execution_mode_names() {
        assert_eq!(ExecutionMode::Stop.to_string(), "stop");
        assert_eq!("run".parse::<ExecutionMode>().unwrap(), ExecutionMode::Run);
    }
}
