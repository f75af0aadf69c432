//! ResourceSample type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One CPU/memory/load reading.
///
/// A sample with `known == false` is the sentinel produced when the sampling
/// source is unavailable; its numeric fields carry no information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub load1: f64,
    pub known: bool,
}

impl ResourceSample {
    pub fn new(cpu_pct: f64, mem_pct: f64, load1: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_pct: cpu_pct.clamp(0.0, 100.0),
            mem_pct: mem_pct.clamp(0.0, 100.0),
            load1,
            known: true,
        }
    }

    pub fn unknown() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_pct: 0.0,
            mem_pct: 0.0,
            load1: 0.0,
            known: false,
        }
    }

    /// Tab-separated `ts cpu mem load1` line used by the metrics files
    pub fn to_tsv(&self) -> String {
        if self.known {
            format!(
                "{}\t{:.1}\t{:.1}\t{:.2}",
                self.timestamp.timestamp(),
                self.cpu_pct,
                self.mem_pct,
                self.load1
            )
        } else {
            format!("{}\t-\t-\t-", self.timestamp.timestamp())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_percentages() {
        let s = ResourceSample::new(140.0, -3.0, 0.5);
        assert_eq!(s.cpu_pct, 100.0);
        assert_eq!(s.mem_pct, 0.0);
        assert!(s.known);
    }

    #[test]
    fn test_tsv_unknown() {
        let s = ResourceSample::unknown();
        assert!(s.to_tsv().ends_with("\t-\t-\t-"));
    }
}
