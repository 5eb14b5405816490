//! CLI argument definitions for flowsentry-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.
//! Flags take precedence over environment variables and the config file.

use std::path::{Path, PathBuf};

use clap::Parser;

use flowsentry_core::config::FlowSentryConfig;

/// flowsentry real-time DDoS flow classifier daemon.
///
/// Reconstructs bidirectional flows from a packet source, classifies
/// finalized flows and emits enforcement decisions.
#[derive(Parser, Debug)]
#[command(name = "flowsentry-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to flowsentry.toml configuration file.
    #[arg(short, long, default_value = "/etc/flowsentry/flowsentry.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path.
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Replay packets from a file instead of the configured source.
    ///
    /// Files ending in `.bin` or `.raw` are read as fixed-size capture
    /// records, anything else as JSON lines.
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

impl DaemonCli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut FlowSentryConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.general.log_format.clone_from(format);
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file.clone_from(pid_file);
        }
        if let Some(path) = &self.replay {
            config.capture.enabled = true;
            config.capture.source = replay_source_for(path).to_owned();
            config.capture.replay_path = path.display().to_string();
        }
    }
}

/// Pick the replay source name from a file extension.
pub fn replay_source_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("bin" | "raw") => "replay-raw",
        _ => "replay-jsonl",
    }
}
