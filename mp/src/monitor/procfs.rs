//! procfs access and parsers for the resource monitor

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {name}: {message}")]
    Parse { name: String, message: String },
}

impl ProcError {
    fn parse(name: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Source of procfs file contents, keyed by path relative to the mount
/// point (`"stat"`, `"meminfo"`, `"net/tcp"`).
pub trait ProcSource: Send + Sync {
    fn read(&self, name: &str) -> io::Result<String>;
}

/// Reads from a real procfs mount
#[derive(Debug, Clone)]
pub struct RealProc {
    root: PathBuf,
}

impl RealProc {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for RealProc {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcSource for RealProc {
    fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(name))
    }
}

/// In-memory source. Each file holds a queue of contents: reads pop until a
/// single entry is left, which is then returned forever.
#[derive(Debug, Default)]
pub struct StaticProc {
    files: Mutex<HashMap<String, VecDeque<String>>>,
}

impl StaticProc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, content: &str) -> Self {
        self.push(name, content);
        self
    }

    pub fn push(&self, name: &str, content: &str) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.entry(name.to_string()).or_default().push_back(content.to_string());
    }
}

impl ProcSource for StaticProc {
    fn read(&self, name: &str) -> io::Result<String> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let queue = files
            .get_mut(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        let content = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        content.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// Aggregate CPU counters from the `cpu` line of `/proc/stat`, in jiffies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy percentage between two reads; `None` when no time elapsed or
    /// the counters went backwards.
    pub fn busy_pct_since(&self, prev: &CpuTimes) -> Option<f64> {
        let total = self.total().checked_sub(prev.total())?;
        let idle = self.idle_total().checked_sub(prev.idle_total())?;
        if total == 0 {
            return None;
        }
        Some((total.saturating_sub(idle)) as f64 * 100.0 / total as f64)
    }
}

pub fn parse_cpu_times(content: &str) -> Result<CpuTimes, ProcError> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| ProcError::parse("stat", "no aggregate cpu line"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return Err(ProcError::parse("stat", "short cpu line"));
    }
    let get = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };
    Ok(CpuTimes {
        user: get(1),
        nice: get(2),
        system: get(3),
        idle: get(4),
        iowait: get(5),
        irq: get(6),
        softirq: get(7),
        steal: get(8),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: Option<u64>,
    pub buffers: u64,
    pub cached: u64,
}

impl MemInfo {
    /// Used memory as a percentage of total. Old kernels without
    /// `MemAvailable` fall back to free + buffers + cached.
    pub fn used_pct(&self) -> f64 {
        if self.mem_total == 0 {
            return 0.0;
        }
        let available = self
            .mem_available
            .unwrap_or(self.mem_free + self.buffers + self.cached)
            .min(self.mem_total);
        (self.mem_total - available) as f64 * 100.0 / self.mem_total as f64
    }
}

pub fn parse_meminfo(content: &str) -> Result<MemInfo, ProcError> {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 { line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0) };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.mem_total = parse_kb(line);
        } else if line.starts_with("MemFree:") {
            info.mem_free = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            info.mem_available = Some(parse_kb(line));
        } else if line.starts_with("Buffers:") {
            info.buffers = parse_kb(line);
        } else if line.starts_with("Cached:") {
            info.cached = parse_kb(line);
        }
    }

    if info.mem_total == 0 {
        return Err(ProcError::parse("meminfo", "missing MemTotal"));
    }
    Ok(info)
}

pub fn parse_load1(content: &str) -> Result<f64, ProcError> {
    content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProcError::parse("loadavg", "invalid load1"))
}

/// A listening TCP socket from `/proc/net/tcp` or `/proc/net/tcp6`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ListenSocket {
    pub proto: String,
    pub address: String,
    pub port: u16,
    pub inode: u64,
}

const TCP_LISTEN: &str = "0A";

/// Parse LISTEN sockets out of a `/proc/net/tcp{,6}` table
pub fn parse_listen_sockets(content: &str, proto: &str) -> Vec<ListenSocket> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 || parts[3] != TCP_LISTEN {
                return None;
            }
            let (addr_hex, port_hex) = parts[1].split_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let address = decode_address(addr_hex)?;
            Some(ListenSocket {
                proto: proto.to_string(),
                address,
                port,
                inode: parts[9].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Addresses are stored as native-endian 32-bit words; procfs on the
/// little-endian targets we care about prints them byte-reversed.
fn decode_address(hex: &str) -> Option<String> {
    match hex.len() {
        8 => {
            let raw = u32::from_str_radix(hex, 16).ok()?;
            Some(std::net::Ipv4Addr::from(raw.swap_bytes()).to_string())
        }
        32 => {
            let mut bytes = [0u8; 16];
            for word in 0..4 {
                let raw = u32::from_str_radix(&hex[word * 8..word * 8 + 8], 16).ok()?;
                bytes[word * 4..word * 4 + 4].copy_from_slice(&raw.swap_bytes().to_be_bytes());
            }
            Some(std::net::Ipv6Addr::from(bytes).to_string())
        }
        _ => None,
    }
}
