//! CLI argument parsing for secretscan

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ss")]
#[command(author, version, about = "Location-only secret scanner", long_about = None)]
pub struct Cli {
    /// YAML file with extra rules (list of {label, pattern})
    #[arg(short, long)]
    pub rules: Option<PathBuf>,

    /// Skip files larger than this many bytes
    #[arg(long)]
    pub max_file_bytes: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report sensitive locations in a file or directory
    Scan {
        /// File or directory to scan
        #[arg(required = true)]
        path: PathBuf,

        /// Top-level directories to leave out (repeatable)
        #[arg(short, long)]
        skip: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Write a redacted copy of a file or directory
    Redact {
        /// Source file or directory
        #[arg(required = true)]
        src: PathBuf,

        /// Destination path (must not exist inside the source)
        #[arg(required = true)]
        dst: PathBuf,
    },

    /// List the active rules in evaluation order
    Rules,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
