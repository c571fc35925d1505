//! CLI command definitions and output helpers

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{SessionStatus, StatusView, short_id};

/// DripWriter - paced text release into documents
#[derive(Debug, Parser)]
#[command(
    name = "dw",
    about = "Release text into a document gradually, at a human typing pace",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log at DEBUG level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a drip session
    Start {
        /// Owner whose credentials are used
        #[arg(long)]
        owner: String,

        /// Target document id
        #[arg(long)]
        doc: String,

        /// Session length in minutes (1-1440)
        #[arg(long, allow_negative_numbers = true)]
        duration: i64,

        /// Text to release
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Read the text from a file (default: stdin)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Do not run the first tick immediately
        #[arg(long)]
        no_kick: bool,
    },

    /// Pause a running session
    Pause {
        /// Session ID (or unique fragment)
        id: String,
    },

    /// Resume a paused session
    Resume {
        /// Session ID (or unique fragment)
        id: String,
    },

    /// Cancel a session for good
    Cancel {
        /// Session ID (or unique fragment)
        id: String,
    },

    /// Show committed session state
    Status {
        /// Session ID (or unique fragment)
        id: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List sessions
    List {
        /// Filter by status (running, paused, done, canceled)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Dump the full stored record as JSON
    Inspect {
        /// Session ID (or unique fragment)
        id: String,
    },

    /// Process one due tick (oldest due session when no id is given)
    Tick {
        /// Session ID (or unique fragment)
        id: Option<String>,
    },

    /// Tick a batch of due sessions
    Sweep {
        /// Maximum sessions to tick (default: sweep.batch-size)
        #[arg(short, long)]
        batch: Option<usize>,
    },

    /// Run the sweep + kick daemon in the foreground
    Run,

    /// Recompute word count from the cursor, clear the error, leave PAUSED
    Repair {
        /// Session ID (or unique fragment)
        id: String,
    },

    /// Show logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Output format for status/list commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}

/// Log file location
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dripwriter")
        .join("logs")
        .join("dripwriter.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Local time for a Unix-millisecond timestamp
pub fn format_timestamp(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => ms.to_string(),
    }
}

pub fn colored_status(status: SessionStatus) -> String {
    match status {
        SessionStatus::Running => status.as_str().green().to_string(),
        SessionStatus::Paused => status.as_str().yellow().to_string(),
        SessionStatus::Done => status.as_str().blue().to_string(),
        SessionStatus::Canceled => status.as_str().red().to_string(),
    }
}

/// Multi-line human readable status
pub fn format_status(view: &StatusView) -> String {
    let percent = if view.total_word_count == 0 {
        100
    } else {
        view.applied_word_count * 100 / view.total_word_count
    };

    let mut out = String::new();
    out.push_str(&format!("Session:  {}\n", view.id));
    out.push_str(&format!("Status:   {}\n", colored_status(view.status)));
    out.push_str(&format!(
        "Progress: {}/{} words ({}%)\n",
        view.applied_word_count, view.total_word_count, percent
    ));
    out.push_str(&format!(
        "Next:     {}\n",
        view.next_eligible_at.map(format_timestamp).unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!("Deadline: {}\n", format_timestamp(view.deadline_at)));
    if let Some(error) = &view.last_error {
        out.push_str(&format!("Error:    {}\n", error.red()));
    }
    out
}

/// One line per session for `list`
pub fn format_row(view: &StatusView) -> String {
    format!(
        "{}  {:<9} {:>5}/{:<5} next {}",
        short_id(&view.id),
        view.status.as_str(),
        view.applied_word_count,
        view.total_word_count,
        view.next_eligible_at.map(format_timestamp).unwrap_or_else(|| "-".to_string())
    )
}
