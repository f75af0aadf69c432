use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use secretscan::cli::{Cli, Command, OutputFormat};
use secretscan::{PRIVATE_KEY_LABEL, ScanOptions, Scanner, TreeScan, load_rule_file};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let extra = match &cli.rules {
        Some(path) => load_rule_file(path).context("Failed to load rule file")?,
        None => Vec::new(),
    };

    let mut options = ScanOptions::default();
    if let Some(max) = cli.max_file_bytes {
        options.max_file_bytes = max;
    }

    info!("secretscan starting with {} extra rules", extra.len());

    match cli.command {
        Command::Scan { path, skip, format } => {
            options.skip_dirs = skip;
            let scanner = Scanner::new(&extra)?.with_options(options);
            let report = if path.is_dir() {
                scanner.scan_tree(&path)?
            } else {
                let root = path.parent().unwrap_or(path.as_path()).to_path_buf();
                match scanner.scan_file(&root, &path)? {
                    Some(locations) => TreeScan {
                        locations,
                        files_scanned: 1,
                        files_skipped: 0,
                    },
                    None => TreeScan {
                        files_skipped: 1,
                        ..Default::default()
                    },
                }
            };

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    for loc in &report.locations {
                        let label = if loc.label == PRIVATE_KEY_LABEL {
                            loc.label.red()
                        } else {
                            loc.label.yellow()
                        };
                        println!("{}:{} {}", loc.path, loc.line.to_string().dimmed(), label);
                    }
                    println!(
                        "{} {} locations in {} files ({} skipped)",
                        "✓".green(),
                        report.locations.len(),
                        report.files_scanned,
                        report.files_skipped
                    );
                }
            }
        }
        Command::Redact { src, dst } => {
            let scanner = Scanner::new(&extra)?.with_options(options);
            if src.is_dir() {
                let summary = scanner.redact_tree(&src, &dst)?;
                println!(
                    "{} Redacted {} lines in {} files ({} copied, {} skipped) -> {}",
                    "✓".green(),
                    summary.lines_redacted,
                    summary.files_redacted,
                    summary.files_copied,
                    summary.files_skipped,
                    dst.display().to_string().cyan()
                );
            } else {
                let lines = scanner.redact_file(&src, &dst)?;
                println!("{} Redacted {} lines -> {}", "✓".green(), lines, dst.display().to_string().cyan());
            }
        }
        Command::Rules => {
            let scanner = Scanner::new(&extra)?;
            println!("{}  (multi-line PEM block)", PRIVATE_KEY_LABEL.cyan());
            for rule in scanner.rules() {
                println!("{}  {}", rule.label().cyan(), rule.pattern().dimmed());
            }
        }
    }

    Ok(())
}
