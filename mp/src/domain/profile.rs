//! Profiles and hardware-based auto-selection

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::unit::CollectorUnit;

/// Memory below which the lightest profile is chosen (128 MiB)
const LITE_MEM_KB: u64 = 128 * 1024;

/// Memory below which the diagnostic profile is chosen (512 MiB)
const DIAGNOSTIC_MEM_KB: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Lite,
    Diagnostic,
    Forensic,
    #[default]
    Auto,
}

impl ProfileName {
    pub const CONCRETE: [ProfileName; 3] = [ProfileName::Lite, ProfileName::Diagnostic, ProfileName::Forensic];

    fn rank(&self) -> u8 {
        match self {
            ProfileName::Lite => 0,
            ProfileName::Diagnostic => 1,
            ProfileName::Forensic | ProfileName::Auto => 2,
        }
    }

    /// True when a unit whose lightest profile is `min` belongs to this profile
    pub fn includes(&self, min: ProfileName) -> bool {
        self.rank() >= min.rank()
    }

    /// Pick a concrete profile: explicit names pass through, `auto` looks at
    /// the hardware.
    pub fn resolve(self, hw: &HardwareInfo) -> ProfileName {
        match self {
            ProfileName::Auto => {
                let picked = if hw.cores <= 1 || hw.mem_total_kb < LITE_MEM_KB {
                    ProfileName::Lite
                } else if hw.cores <= 2 || hw.mem_total_kb < DIAGNOSTIC_MEM_KB {
                    ProfileName::Diagnostic
                } else {
                    ProfileName::Forensic
                };
                debug!(cores = hw.cores, mem_kb = hw.mem_total_kb, ?picked, "ProfileName::resolve: auto");
                picked
            }
            other => other,
        }
    }

    pub fn default_concurrency(&self, cores: usize) -> usize {
        match self {
            ProfileName::Lite => 1,
            ProfileName::Diagnostic => 2,
            ProfileName::Forensic | ProfileName::Auto => cores.clamp(1, 4),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            ProfileName::Lite => Duration::from_secs(20),
            ProfileName::Diagnostic => Duration::from_secs(45),
            ProfileName::Forensic | ProfileName::Auto => Duration::from_secs(120),
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProfileName::Lite => "lite",
            ProfileName::Diagnostic => "diagnostic",
            ProfileName::Forensic => "forensic",
            ProfileName::Auto => "auto",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
#[error("unknown profile '{0}' (expected lite, diagnostic, forensic or auto)")]
pub struct ParseProfileError(String);

impl FromStr for ProfileName {
    type Err = ParseProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lite" => Ok(ProfileName::Lite),
            "diagnostic" | "diag" => Ok(ProfileName::Diagnostic),
            "forensic" | "full" => Ok(ProfileName::Forensic),
            "auto" | "" => Ok(ProfileName::Auto),
            other => Err(ParseProfileError(other.to_string())),
        }
    }
}

/// Hardware facts used for auto-selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cores: usize,
    pub mem_total_kb: u64,
    pub model: Option<String>,
    pub arch: String,
}

impl HardwareInfo {
    /// Build from the text of `/proc/cpuinfo` and `/proc/meminfo`.
    ///
    /// Missing inputs fall back to the runtime's view of parallelism and to
    /// zero memory, which selects the lightest profile.
    pub fn from_proc(cpuinfo: Option<&str>, meminfo: Option<&str>) -> Self {
        let mut cores = 0;
        let mut model = None;
        if let Some(text) = cpuinfo {
            for line in text.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let key = key.trim();
                let value = value.trim();
                if key == "processor" {
                    cores += 1;
                } else if model.is_none()
                    && matches!(key, "model name" | "system type" | "cpu model" | "Hardware" | "machine")
                    && !value.is_empty()
                {
                    model = Some(value.to_string());
                }
            }
        }
        if cores == 0 {
            cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        }

        let mem_total_kb = meminfo
            .and_then(|text| {
                text.lines()
                    .find(|l| l.starts_with("MemTotal:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(0);

        Self {
            cores,
            mem_total_kb,
            model,
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Which units of a profile to keep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UnitSelection {
    #[default]
    All,
    Only(Vec<String>),
}

impl FromStr for UnitSelection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids: Vec<String> = s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if ids.is_empty() || ids.iter().any(|p| p == "all") {
            Ok(UnitSelection::All)
        } else {
            Ok(UnitSelection::Only(ids))
        }
    }
}

/// A resolved profile: fixed once a run starts
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: ProfileName,
    pub units: Vec<CollectorUnit>,
    pub concurrency: usize,
    pub default_timeout: Duration,
}

impl Profile {
    pub fn new(name: ProfileName, hw: &HardwareInfo, units: Vec<CollectorUnit>) -> Self {
        Self {
            name,
            units,
            concurrency: name.default_concurrency(hw.cores),
            default_timeout: name.default_timeout(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Narrow the unit set. Prerequisites of kept units are kept too.
    /// Returns the ids that matched nothing.
    pub fn select(mut self, selection: &UnitSelection) -> (Self, Vec<String>) {
        let UnitSelection::Only(wanted) = selection else {
            return (self, Vec::new());
        };

        let known: HashSet<&str> = self.units.iter().map(|u| u.id.as_str()).collect();
        let unknown: Vec<String> = wanted.iter().filter(|id| !known.contains(id.as_str())).cloned().collect();

        let mut keep: HashSet<String> = wanted.iter().filter(|id| known.contains(id.as_str())).cloned().collect();
        loop {
            let extra: Vec<String> = self
                .units
                .iter()
                .filter(|u| keep.contains(&u.id))
                .flat_map(|u| u.prerequisites.iter())
                .filter(|p| known.contains(p.as_str()) && !keep.contains(*p))
                .cloned()
                .collect();
            if extra.is_empty() {
                break;
            }
            keep.extend(extra);
        }

        self.units.retain(|u| keep.contains(&u.id));
        (self, unknown)
    }

    pub fn unit_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(cores: usize, mem_mb: u64) -> HardwareInfo {
        HardwareInfo {
            cores,
            mem_total_kb: mem_mb * 1024,
            model: None,
            arch: "mipsel".to_string(),
        }
    }

    #[test]
    fn test_auto_selection() {
        assert_eq!(ProfileName::Auto.resolve(&hw(1, 1024)), ProfileName::Lite);
        assert_eq!(ProfileName::Auto.resolve(&hw(4, 64)), ProfileName::Lite);
        assert_eq!(ProfileName::Auto.resolve(&hw(2, 1024)), ProfileName::Diagnostic);
        assert_eq!(ProfileName::Auto.resolve(&hw(4, 256)), ProfileName::Diagnostic);
        assert_eq!(ProfileName::Auto.resolve(&hw(4, 1024)), ProfileName::Forensic);
    }

    #[test]
    fn test_explicit_profile_passes_through() {
        assert_eq!(ProfileName::Forensic.resolve(&hw(1, 32)), ProfileName::Forensic);
    }

    #[test]
    fn test_includes_is_cumulative() {
        assert!(ProfileName::Forensic.includes(ProfileName::Lite));
        assert!(ProfileName::Diagnostic.includes(ProfileName::Diagnostic));
        assert!(!ProfileName::Lite.includes(ProfileName::Diagnostic));
    }

    #[test]
    fn test_default_concurrency() {
        assert_eq!(ProfileName::Lite.default_concurrency(8), 1);
        assert_eq!(ProfileName::Diagnostic.default_concurrency(8), 2);
        assert_eq!(ProfileName::Forensic.default_concurrency(8), 4);
        assert_eq!(ProfileName::Forensic.default_concurrency(2), 2);
    }

    #[test]
    fn test_parse_profile() {
        assert_eq!("Forensic".parse::<ProfileName>().unwrap(), ProfileName::Forensic);
        assert_eq!("".parse::<ProfileName>().unwrap(), ProfileName::Auto);
        assert!("turbo".parse::<ProfileName>().is_err());
    }

    #[test]
    fn test_hardware_from_proc() {
        let cpuinfo = "system type\t\t: MT7621\nprocessor\t: 0\nprocessor\t: 1\n";
        let meminfo = "MemTotal:         255280 kB\nMemFree:           10000 kB\n";
        let info = HardwareInfo::from_proc(Some(cpuinfo), Some(meminfo));
        assert_eq!(info.cores, 2);
        assert_eq!(info.mem_total_kb, 255280);
        assert_eq!(info.model.as_deref(), Some("MT7621"));
    }

    #[test]
    fn test_hardware_missing_sources() {
        let info = HardwareInfo::from_proc(None, None);
        assert!(info.cores >= 1);
        assert_eq!(info.mem_total_kb, 0);
        assert_eq!(ProfileName::Auto.resolve(&info), ProfileName::Lite);
    }

    #[test]
    fn test_selection_keeps_prerequisites() {
        let units = vec![
            CollectorUnit::external("a", "x", "true"),
            CollectorUnit::external("b", "x", "true").with_prerequisites(vec!["a".into()]),
            CollectorUnit::external("c", "x", "true"),
        ];
        let profile = Profile::new(ProfileName::Lite, &hw(1, 64), units);
        let selection: UnitSelection = "b,nope".parse().unwrap();
        let (profile, unknown) = profile.select(&selection);
        assert_eq!(profile.unit_ids(), vec!["a", "b"]);
        assert_eq!(unknown, vec!["nope".to_string()]);
    }

    #[test]
    fn test_selection_all() {
        assert_eq!("all".parse::<UnitSelection>().unwrap(), UnitSelection::All);
        assert_eq!(" ".parse::<UnitSelection>().unwrap(), UnitSelection::All);
    }
}
