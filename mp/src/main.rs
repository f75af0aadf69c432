//! maxprobe - diagnostic snapshot collector
//!
//! CLI entry point: foreground runs, the Status/Control API and a few
//! inspection commands.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use maxprobe::api::{self, ApiState};
use maxprobe::cli::{Cli, Command, OutputFormat, get_log_path};
use maxprobe::config::Config;
use maxprobe::domain::{ProfileName, RunPhase, RunState, UnitSelection, UnitStatus};
use maxprobe::orchestrator::{Orchestrator, RunRequest};
use maxprobe::packager::list_archives;

/// Run completed; individual unit outcomes do not matter
const EXIT_OK: i32 = 0;
/// The run never started
const EXIT_INIT_FAILED: i32 = 1;
/// The run ended in `failed` because a required unit did not succeed
const EXIT_RUN_FAILED: i32 = 2;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!("maxprobe loaded config: output-dir={}", config.output_dir.display());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            profile,
            concurrency,
            collectors,
            output_dir,
        } => {
            let request = RunRequest {
                profile,
                concurrency,
                collectors,
                output_dir,
            };
            let code = cmd_run(config, request).await?;
            std::process::exit(code);
        }
        Command::Serve { bind, port } => cmd_serve(config, bind, port).await,
        Command::Status { url, format } => cmd_status(&config, url, format).await,
        Command::Profiles => cmd_profiles(config),
        Command::Archives { format } => cmd_archives(&config, format),
    }
}

async fn cmd_run(config: Config, request: RunRequest) -> Result<i32> {
    debug!(?request, "cmd_run: called");
    let orchestrator = Orchestrator::new(config);

    let handle = match orchestrator.start_run(request).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            return Ok(EXIT_INIT_FAILED);
        }
    };
    println!(
        "{} Run {} started: profile {}, concurrency {}, {} units",
        "✓".green(),
        handle.run_id,
        handle.profile,
        handle.concurrency,
        handle.units.len()
    );
    println!("  workdir: {}", handle.workdir.display());

    let state = tokio::select! {
        state = orchestrator.wait_terminal() => state,
        _ = tokio::signal::ctrl_c() => {
            println!("{} Interrupted, stopping run...", "!".yellow());
            orchestrator.stop_run().await;
            orchestrator.wait_terminal().await
        }
    };

    print_outcome(&state);
    Ok(match state.phase {
        RunPhase::Failed => EXIT_RUN_FAILED,
        _ => EXIT_OK,
    })
}

fn status_cell(status: UnitStatus) -> ColoredString {
    let text = format!("{:<10}", status.to_string());
    match status {
        UnitStatus::Succeeded => text.green(),
        UnitStatus::Failed | UnitStatus::TimedOut => text.red(),
        UnitStatus::Skipped => text.yellow(),
        UnitStatus::Pending | UnitStatus::Running => text.normal(),
    }
}

fn print_outcome(state: &RunState) {
    println!();
    println!("{:<20} {:<8} {:<10} {:>9} {:>10}  NOTE", "UNIT", "CATEGORY", "STATUS", "MS", "BYTES");
    for unit in &state.units {
        let ms = unit.duration_ms().map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<8} {} {:>9} {:>10}  {}",
            unit.id,
            unit.category,
            status_cell(unit.status),
            ms,
            unit.output_bytes,
            unit.error.as_deref().unwrap_or("")
        );
    }
    println!();

    let phase = match state.phase {
        RunPhase::Completed => state.phase.to_string().green(),
        RunPhase::Failed => state.phase.to_string().red(),
        _ => state.phase.to_string().normal(),
    };
    let cancelled = if state.cancelled { " (cancelled)" } else { "" };
    println!("Run {}{}: {} units finished", phase, cancelled, state.progress());
    if !state.sensitive.is_empty() {
        println!(
            "{} {} suspected secret locations, see analysis/SENSITIVE_LOCATIONS.md",
            "!".yellow(),
            state.sensitive.len()
        );
    }
    for error in &state.errors {
        println!("{} {}", "✗".red(), error);
    }
    if let Some(archive) = &state.archive {
        println!("Archive: {} ({} bytes)", archive.path.display(), archive.size);
    } else if let Some(workdir) = &state.workdir {
        println!("Output: {}", workdir.display());
    }
}

async fn cmd_serve(mut config: Config, bind: Option<String>, port: Option<u16>) -> Result<()> {
    debug!(?bind, ?port, "cmd_serve: called");
    if let Some(bind) = bind {
        config.api.bind = bind;
    }
    if let Some(port) = port {
        config.api.port = port;
    }
    config.validate().context("Invalid API settings")?;

    let token = config.api.resolve_token();
    let listener = api::bind_with_fallback(&config.api.bind, config.api.port, config.api.port_fallback).await?;
    let addr = listener.local_addr().context("Failed to read bound address")?;
    println!("{} Status/Control API on http://{}", "✓".green(), addr);
    if token.is_none() {
        println!("{} no bearer token configured (loopback only)", "!".yellow());
    }

    let orchestrator = Arc::new(Orchestrator::new(config));
    let state = ApiState::new(orchestrator.clone(), token);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };
    api::serve(state, listener, shutdown).await?;

    let phase = orchestrator.stop_run().await;
    debug!(%phase, "cmd_serve: final run phase");
    Ok(())
}

async fn cmd_status(config: &Config, url: Option<String>, format: OutputFormat) -> Result<()> {
    debug!(?url, ?format, "cmd_status: called");
    let base = url.unwrap_or_else(|| format!("http://{}:{}", config.api.bind, config.api.port));
    let client = reqwest::Client::new();
    let mut request = client.get(format!("{}/status", base.trim_end_matches('/')));
    if let Some(token) = config.api.resolve_token() {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.context(format!("Failed to reach {}", base))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(eyre!("{} returned {}: {}", base, status, body.trim()));
    }
    let body: serde_json::Value = response.json().await.context("Invalid status response")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Text => {
            let run: RunState = serde_json::from_value(body["run"].clone()).context("Invalid run state")?;
            println!("maxprobe Status");
            println!("---------------");
            println!("Phase:    {}", run.phase);
            println!("Progress: {}", run.progress());
            if let Some(profile) = run.profile {
                println!("Profile:  {}", profile);
            }
            if let Some(sample) = run.metrics.filter(|s| s.known) {
                println!(
                    "Metrics:  cpu {:.1}% mem {:.1}% load1 {:.2}",
                    sample.cpu_pct, sample.mem_pct, sample.load1
                );
            }
            for unit in &run.units {
                println!("  {:<20} {}", unit.id, status_cell(unit.status));
            }
            if let Some(archives) = body["archives"].as_array() {
                println!("Archives: {}", archives.len());
            }
        }
    }
    Ok(())
}

fn cmd_profiles(config: Config) -> Result<()> {
    debug!("cmd_profiles: called");
    let orchestrator = Orchestrator::new(config);
    let hw = orchestrator.detect_hardware();
    println!("Hardware: {} cores, {} MiB, {}", hw.cores, hw.mem_total_kb / 1024, hw.arch);
    if let Some(model) = &hw.model {
        println!("CPU:      {}", model);
    }
    println!("Auto:     {}", ProfileName::Auto.resolve(&hw));
    println!();

    for name in ProfileName::CONCRETE {
        let (profile, _) = orchestrator.resolve(&RunRequest {
            profile: name,
            collectors: UnitSelection::All,
            ..Default::default()
        });
        println!(
            "{} (concurrency {}, timeout {}s)",
            name.to_string().bold(),
            profile.concurrency,
            profile.default_timeout.as_secs()
        );
        for unit in &profile.units {
            let prereqs = if unit.prerequisites.is_empty() {
                String::new()
            } else {
                format!(" after {}", unit.prerequisites.join(","))
            };
            println!(
                "  {:<20} {:<8} {:<8} {}{}",
                unit.id,
                unit.category,
                unit.kind_label(),
                unit.weight,
                prereqs
            );
        }
    }
    Ok(())
}

fn cmd_archives(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_archives: called");
    let archives = list_archives(&config.output_dir, usize::MAX);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&archives)?),
        OutputFormat::Text => {
            if archives.is_empty() {
                println!("No archives in {}", config.output_dir.display());
            }
            for archive in &archives {
                println!(
                    "{}  {:>12}  {}  {}",
                    archive.modified.format("%Y-%m-%d %H:%M:%S"),
                    archive.size,
                    archive.name,
                    archive.checksum_file.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
