//! # Cli
//!
//! Argument parsing for the `ssi` binary.

use clap::{Parser, ValueEnum};

/// Command-line configuration for an interpreter session.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// The path to the C source file to load.
    #[arg(index = 1)]
    pub file: std::path::PathBuf,

    /// How much of the interpreter's inner workings to log.
    #[arg(value_enum, short, long, default_value_t = LogLevel::default())]
    pub verbosity: LogLevel,

    /// Print the collected module metadata as JSON after the globals pass.
    #[arg(long)]
    pub module_info: bool,

    /// Exit after the globals pass instead of dropping into the prompt.
    #[arg(long)]
    pub no_prompt: bool,

    /// Maximum number of statements per run command; opaque loop conditions
    /// always take the true branch, so runs need a bound.
    #[arg(long, default_value_t = 1000)]
    pub step_limit: usize,
}

impl Cli {
    pub fn init() -> Self {
        Cli::parse()
    }
}

/// What gets logged while the interpreter runs. Each level includes the ones
/// above it.
#[derive(ValueEnum, Clone, Default, Debug)]
pub enum LogLevel {
    /// The default: only failures that end a run, such as a source file that
    /// does not lex or a construct the interpreter cannot execute.
    #[default]
    #[value(alias("0"))]
    Error,

    /// Also log recoverable oddities, e.g. malformed prompt commands.
    #[value(alias("1"))]
    Warn,

    /// Also log session progress: which file is loaded and when the globals
    /// pass runs.
    #[value(alias("2"))]
    Info,

    /// Also log execution itself: the line each step executes, macro
    /// expansions, stream rewrites, and callees that resolve to no body.
    /// This is the level to watch a lowering happen token by token.
    #[value(alias("3"))]
    Debug,

    /// Everything, down to the chattiest internals. Rarely useful outside of
    /// debugging the interpreter.
    #[value(alias("4"))]
    Trace,
}

impl From<&LogLevel> for log::Level {
    fn from(value: &LogLevel) -> Self {
        match value {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}
