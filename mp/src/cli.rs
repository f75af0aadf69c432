//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::domain::{ProfileName, UnitSelection};

/// maxprobe - diagnostic snapshot collector
#[derive(Parser)]
#[command(
    name = "mp",
    about = "Collect a diagnostic snapshot of this host with resource-aware scheduling",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one collection in the foreground
    Run {
        /// Profile to run (lite, diagnostic, forensic, auto)
        #[arg(short, long, default_value = "auto")]
        profile: ProfileName,

        /// Maximum units running at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// `all` or a comma-separated list of unit ids
        #[arg(long, default_value = "all")]
        collectors: UnitSelection,

        /// Parent directory for the working tree and archive
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Serve the Status/Control API
    Serve {
        /// Address to bind (overrides api.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port to bind (overrides api.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Query a running API for the current run
    Status {
        /// Base URL of the API (defaults to the configured bind and port)
        #[arg(long)]
        url: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show detected hardware and the units of each profile
    Profiles,

    /// List archives in the output directory
    Archives {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("maxprobe")
        .join("logs")
        .join("maxprobe.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["mp", "run"]).unwrap();
        match cli.command {
            Command::Run {
                profile,
                concurrency,
                collectors,
                output_dir,
            } => {
                assert_eq!(profile, ProfileName::Auto);
                assert_eq!(concurrency, None);
                assert_eq!(collectors, UnitSelection::All);
                assert_eq!(output_dir, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_with_options() {
        let cli = Cli::try_parse_from([
            "mp",
            "-l",
            "debug",
            "run",
            "--profile",
            "lite",
            "-j",
            "3",
            "--collectors",
            "sys-proc,net-listen",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        let Command::Run {
            profile,
            concurrency,
            collectors,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(profile, ProfileName::Lite);
        assert_eq!(concurrency, Some(3));
        assert_eq!(
            collectors,
            UnitSelection::Only(vec!["sys-proc".to_string(), "net-listen".to_string()])
        );
    }

    #[test]
    fn test_rejects_unknown_profile() {
        assert!(Cli::try_parse_from(["mp", "run", "--profile", "huge"]).is_err());
    }

    #[test]
    fn test_status_format() {
        let cli = Cli::try_parse_from(["mp", "status", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Command::Status { format: OutputFormat::Json, .. }));
    }
}
