//! maxprobe configuration types and loading

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use secretscan::RuleSpec;
use serde::{Deserialize, Serialize};

use crate::domain::{ProfileName, Weight};

/// Main maxprobe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parent of per-run working directories, archives and the run lock
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,

    /// Log level used when --log-level is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Directory of executables discovered as external collectors
    #[serde(rename = "collectors-dir")]
    pub collectors_dir: Option<PathBuf>,

    /// Resource ceilings for admission
    pub limits: LimitsConfig,

    /// Resource monitor sampling
    pub monitor: MonitorConfig,

    /// Dispatch loop tuning
    pub scheduler: SchedulerConfig,

    /// Status/Control API
    pub api: ApiConfig,

    /// Secret scanning of captured output
    pub scan: ScanConfig,

    /// Archive packaging
    pub package: PackageConfig,

    /// HTTP endpoint probe collector
    #[serde(rename = "http-probe")]
    pub http_probe: HttpProbeConfig,

    /// Config mirror collector
    pub mirror: MirrorConfig,

    /// Declared external collector units
    pub collectors: Vec<ExternalUnitConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/var/tmp"),
            log_level: None,
            collectors_dir: None,
            limits: LimitsConfig::default(),
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            api: ApiConfig::default(),
            scan: ScanConfig::default(),
            package: PackageConfig::default(),
            http_probe: HttpProbeConfig::default(),
            mirror: MirrorConfig::default(),
            collectors: Vec::new(),
        }
    }
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        for (name, pct) in [
            ("limits.max-cpu-pct", self.limits.max_cpu_pct),
            ("limits.max-mem-pct", self.limits.max_mem_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(eyre!("{} must be within 0..=100, got {}", name, pct));
            }
        }
        if self.monitor.interval_ms == 0 {
            return Err(eyre!("monitor.interval-ms must be greater than zero"));
        }
        if self.monitor.history == 0 {
            return Err(eyre!("monitor.history must be greater than zero"));
        }
        if self.scheduler.concurrency == Some(0) {
            return Err(eyre!("scheduler.concurrency must be at least 1"));
        }

        let mut seen = HashSet::new();
        for unit in &self.collectors {
            if unit.id.trim().is_empty() || unit.command.trim().is_empty() {
                return Err(eyre!("collectors entries need both id and command"));
            }
            if !seen.insert(unit.id.as_str()) {
                return Err(eyre!("duplicate collector id '{}'", unit.id));
            }
        }

        if !self.api.is_loopback() && self.api.resolve_token().is_none() {
            return Err(eyre!(
                "api.bind {} is not loopback; set api.token or the {} environment variable",
                self.api.bind,
                self.api.token_env
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .maxprobe.yml
        let local_config = PathBuf::from(".maxprobe.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/maxprobe/maxprobe.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("maxprobe").join("maxprobe.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Admission ceilings, as percentages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(rename = "max-cpu-pct")]
    pub max_cpu_pct: f64,

    #[serde(rename = "max-mem-pct")]
    pub max_mem_pct: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_cpu_pct: 85.0,
            max_mem_pct: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,

    /// Rolling sample history capacity
    pub history: usize,

    /// procfs mount point
    #[serde(rename = "proc-root")]
    pub proc_root: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            history: 120,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Overrides the profile's default concurrency
    pub concurrency: Option<usize>,

    /// Signal-then-force window for terminating units
    #[serde(rename = "grace-ms")]
    pub grace_ms: u64,

    /// Admit the head unit anyway after this long throttled with nothing running
    #[serde(rename = "max-throttle-wait-ms")]
    pub max_throttle_wait_ms: u64,

    /// Dispatch loop wake-up interval while throttled
    #[serde(rename = "poll-ms")]
    pub poll_ms: u64,

    /// Bound on how long stop waits for the run to reach a terminal phase
    #[serde(rename = "stop-wait-ms")]
    pub stop_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            grace_ms: 5000,
            max_throttle_wait_ms: 30_000,
            poll_ms: 250,
            stop_wait_ms: 15_000,
        }
    }
}

impl SchedulerConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn max_throttle_wait(&self) -> Duration {
        Duration::from_millis(self.max_throttle_wait_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(10))
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,

    /// Further ports tried when the configured one is in use
    #[serde(rename = "port-fallback")]
    pub port_fallback: u16,

    /// Bearer token; takes precedence over the environment variable
    pub token: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(rename = "token-env")]
    pub token_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8088,
            port_fallback: 20,
            token: None,
            token_env: "MAXPROBE_TOKEN".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.is_empty())
    }

    pub fn is_loopback(&self) -> bool {
        if self.bind == "localhost" {
            return true;
        }
        self.bind.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub enabled: bool,

    #[serde(rename = "max-file-bytes")]
    pub max_file_bytes: u64,

    /// Also write a redacted mirror of the working tree
    #[serde(rename = "redacted-copy")]
    pub redacted_copy: bool,

    /// Rules appended after the built-in ones
    #[serde(rename = "extra-rules")]
    pub extra_rules: Vec<RuleSpec>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_bytes: secretscan::DEFAULT_MAX_FILE_BYTES,
            redacted_copy: false,
            extra_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub enabled: bool,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbeConfig {
    pub hosts: Vec<String>,
    pub ports: Vec<u16>,
    pub paths: Vec<String>,

    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Upper bound on probed ports after merging listening sockets
    #[serde(rename = "max-ports")]
    pub max_ports: usize,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            ports: vec![80, 443, 8080],
            paths: vec!["/".to_string()],
            timeout_ms: 3000,
            max_ports: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub paths: Vec<PathBuf>,

    #[serde(rename = "max-file-bytes")]
    pub max_file_bytes: u64,

    #[serde(rename = "max-files")]
    pub max_files: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("/etc"), PathBuf::from("/opt/etc")],
            max_file_bytes: 1024 * 1024,
            max_files: 5000,
        }
    }
}

fn default_category() -> String {
    "ext".to_string()
}

fn default_profiles() -> Vec<ProfileName> {
    vec![ProfileName::Diagnostic, ProfileName::Forensic]
}

fn default_true() -> bool {
    true
}

/// An external program declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUnitConfig {
    pub id: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_category")]
    pub category: String,

    /// Defaults to the profile's unit timeout
    #[serde(rename = "timeout-ms", default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub weight: Weight,

    #[serde(default)]
    pub prerequisites: Vec<String>,

    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileName>,

    #[serde(default)]
    pub required: bool,

    /// Append the unit's output directory as the last argument
    #[serde(rename = "pass-workdir", default = "default_true")]
    pub pass_workdir: bool,
}
