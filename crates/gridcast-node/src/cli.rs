//! Command-line argument parsing for the node daemon.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use gridcast_core::constants::PRESENCE_PORT;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for gridcast_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => gridcast_core::LogFormat::Text,
            CliLogFormat::Json => gridcast_core::LogFormat::Json,
        }
    }
}

/// gridcast render node - LAN projection-mapping cluster member.
#[derive(Debug, Parser)]
#[command(
    name = "gridcast-node",
    version,
    about = "gridcast render node - LAN projection-mapping cluster member"
)]
pub struct Cli {
    /// Project directory holding settings.json and synced/ (defaults to CWD)
    #[arg(value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// UDP port for presence and control frames
    #[arg(long = "presence-port", default_value_t = PRESENCE_PORT)]
    pub presence_port: u16,

    /// Start in master role instead of peer
    #[arg(long = "master")]
    pub master: bool,

    /// Disable the interactive stdin command loop
    #[arg(long = "headless")]
    pub headless: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// The project directory, defaulting to the process working directory.
    pub fn project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
