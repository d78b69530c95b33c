//! Console command parser.

pub const BREAK_COMMAND: &str = "break";
pub const BREAK_COMMAND_SHORT: &str = "b";
pub const CLEAR_COMMAND: &str = "clear";
pub const CONTINUE_COMMAND: &str = "continue";
pub const CONTINUE_COMMAND_SHORT: &str = "c";
pub const NEXT_COMMAND: &str = "next";
pub const NEXT_COMMAND_SHORT: &str = "n";
pub const STEP_COMMAND: &str = "step";
pub const STEP_COMMAND_SHORT: &str = "s";
pub const FINISH_COMMAND: &str = "finish";
pub const FINISH_COMMAND_SHORT: &str = "out";
pub const PAUSE_COMMAND: &str = "pause";
pub const BACKTRACE_COMMAND: &str = "bt";
pub const VARS_COMMAND: &str = "vars";
pub const EVAL_COMMAND: &str = "eval";
pub const HELP_COMMAND: &str = "help";
pub const HELP_COMMAND_SHORT: &str = "h";
pub const QUIT_COMMAND: &str = "quit";
pub const QUIT_COMMAND_SHORT: &str = "q";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("malformed command: {0}")]
    Parsing(String),
}

/// Commands of the interactive console.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Replace breakpoints of a source, an empty line list shows the current ones.
    Break { source: String, lines: Vec<u32> },
    Clear(String),
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Backtrace,
    Variables(i64),
    Evaluate(String),
    Help,
    Quit,
    SkipInput,
}

impl Command {
    pub fn parse(input: &str) -> Result<Command, CommandError> {
        let input = input.trim();
        let (name, rest) = match input.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (input, ""),
        };

        let command = match name {
            "" => Command::SkipInput,
            BREAK_COMMAND | BREAK_COMMAND_SHORT => {
                let mut words = rest.split_whitespace();
                let source = words
                    .next()
                    .ok_or_else(|| CommandError::Parsing("source path expected".to_string()))?;
                let lines = words
                    .map(|word| {
                        word.parse::<u32>()
                            .map_err(|_| CommandError::Parsing(format!("invalid line `{word}`")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Command::Break {
                    source: source.to_string(),
                    lines,
                }
            }
            CLEAR_COMMAND => {
                if rest.is_empty() {
                    return Err(CommandError::Parsing("source path expected".to_string()));
                }
                Command::Clear(rest.to_string())
            }
            CONTINUE_COMMAND | CONTINUE_COMMAND_SHORT => Command::Continue,
            NEXT_COMMAND | NEXT_COMMAND_SHORT => Command::Next,
            STEP_COMMAND | STEP_COMMAND_SHORT => Command::StepIn,
            FINISH_COMMAND | FINISH_COMMAND_SHORT => Command::StepOut,
            PAUSE_COMMAND => Command::Pause,
            BACKTRACE_COMMAND => Command::Backtrace,
            VARS_COMMAND => {
                let frame = if rest.is_empty() {
                    0
                } else {
                    rest.parse::<i64>()
                        .map_err(|_| CommandError::Parsing(format!("invalid frame `{rest}`")))?
                };
                Command::Variables(frame)
            }
            EVAL_COMMAND => {
                if rest.is_empty() {
                    return Err(CommandError::Parsing("expression expected".to_string()));
                }
                Command::Evaluate(rest.to_string())
            }
            HELP_COMMAND | HELP_COMMAND_SHORT => Command::Help,
            QUIT_COMMAND | QUIT_COMMAND_SHORT => Command::Quit,
            unknown => return Err(CommandError::Unknown(unknown.to_string())),
        };
        Ok(command)
    }
}
