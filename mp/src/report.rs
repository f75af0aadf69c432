//! Run artifacts written at finalization: REPORT.md,
//! SENSITIVE_LOCATIONS.md, metrics_summary.json, inventory.json and
//! manifest.json

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use handlebars::Handlebars;
use secretscan::{SensitiveLocation, relative_display};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::collectors::{LISTEN_JSON, PROBE_TSV};
use crate::domain::{RunPhase, RunState, UnitResult, UnitStatus};
use crate::monitor::ListenSocket;
use crate::packager::sha256_file;

const REPORT_TEMPLATE: &str = include_str!("../templates/report.md.hbs");
const SENSITIVE_TEMPLATE: &str = include_str!("../templates/sensitive.md.hbs");

/// Cap on the probe hit lists in inventory.json
const MAX_PROBE_HITS: usize = 120;

/// Run errors kept in inventory.json
const ERRORS_TAIL: usize = 200;

/// count/min/max/p50/p95 of one metrics column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub name: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Rows in metrics.tsv, known or not
    pub samples: usize,
    pub series: Vec<SeriesStats>,
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn series(name: &str, mut values: Vec<f64>) -> Option<SeriesStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(SeriesStats {
        name: name.to_string(),
        count: values.len(),
        min: values[0],
        max: values[values.len() - 1],
        p50: percentile(&values, 50.0),
        p95: percentile(&values, 95.0),
    })
}

/// Summarize `ts cpu mem load1` rows; `-` marks an unknown value
pub fn summarize_metrics(tsv: &str) -> MetricsSummary {
    let mut cpu = Vec::new();
    let mut mem = Vec::new();
    let mut load = Vec::new();
    let mut samples = 0;
    for line in tsv.lines().filter(|l| !l.trim().is_empty()) {
        samples += 1;
        let cols: Vec<&str> = line.split('\t').collect();
        for (col, target) in [(1, &mut cpu), (2, &mut mem), (3, &mut load)] {
            if let Some(v) = cols.get(col).and_then(|s| s.parse::<f64>().ok()) {
                target.push(v);
            }
        }
    }
    MetricsSummary {
        samples,
        series: [series("cpu_pct", cpu), series("mem_pct", mem), series("load1", load)]
            .into_iter()
            .flatten()
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    /// Hex SHA-256; absent when the file could not be read
    pub sha256: Option<String>,
    /// Permission bits, e.g. 0o644
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Option<DateTime<Utc>>,
}

impl ManifestFile {
    fn describe(root: &Path, path: &Path, meta: &fs::Metadata) -> Self {
        let sha256 = match sha256_file(path) {
            Ok(digest) => Some(digest),
            Err(e) => {
                debug!(path = %path.display(), %e, "ManifestFile::describe: hash failed");
                None
            }
        };
        Self {
            path: relative_display(root, path),
            size: meta.len(),
            sha256,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: Option<String>,
    pub profile: Option<String>,
    pub phase: RunPhase,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub units: Vec<UnitResult>,
    pub files: Vec<ManifestFile>,
}

/// Every regular file under `root`, sorted
pub fn list_files(root: &Path) -> Vec<ManifestFile> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            Some(ManifestFile::describe(root, e.path(), &meta))
        })
        .collect()
}

/// Probe outcomes for one port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    /// 2xx and 3xx
    pub ok: usize,
    /// 401
    pub auth: usize,
    /// 403
    pub forbidden: usize,
    pub other: usize,
    /// No HTTP answer at all
    pub no: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeHit {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub path: String,
    pub code: String,
    pub note: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProbeSummary {
    pub per_port: BTreeMap<u16, PortSummary>,
    /// Paths that answered with a code meaning the endpoint exists
    pub exists: Vec<ProbeHit>,
    /// `/rci/` paths that answered, with or without auth
    pub rci_candidates: Vec<ProbeHit>,
}

/// Summarize `ts host port scheme path code note` rows
pub fn summarize_http_probe(tsv: &str) -> HttpProbeSummary {
    let mut summary = HttpProbeSummary::default();
    for line in tsv.lines().filter(|l| !l.starts_with("ts\t")) {
        let cols: Vec<&str> = line.split('\t').collect();
        let [_, host, port, scheme, path, code, note, ..] = cols[..] else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };

        let counts = summary.per_port.entry(port).or_default();
        match code {
            "000" => {
                counts.no += 1;
                continue;
            }
            c if c.starts_with('2') || c.starts_with('3') => counts.ok += 1,
            "401" => counts.auth += 1,
            "403" => counts.forbidden += 1,
            _ => counts.other += 1,
        }

        let hit = || ProbeHit {
            host: host.to_string(),
            port,
            scheme: scheme.to_string(),
            path: path.to_string(),
            code: code.to_string(),
            note: note.to_string(),
        };
        if matches!(code, "200" | "301" | "302" | "307" | "308" | "401" | "403")
            && summary.exists.len() < MAX_PROBE_HITS
        {
            summary.exists.push(hit());
        }
        if path.starts_with("/rci/")
            && matches!(code, "200" | "401" | "403")
            && summary.rci_candidates.len() < MAX_PROBE_HITS
        {
            summary.rci_candidates.push(hit());
        }
    }
    summary
}

/// Machine-readable overview of what the run found on the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    pub run_id: Option<String>,
    pub profile: Option<String>,
    pub listen: Vec<ListenSocket>,
    pub http_probe: HttpProbeSummary,
    pub errors_tail: Vec<String>,
}

pub fn build_inventory(state: &RunState, root: &Path) -> Inventory {
    let net = root.join("net");
    let listen = match fs::read(net.join("net-listen").join(LISTEN_JSON)) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            debug!(%e, "build_inventory: unreadable listen list");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    let probe = fs::read_to_string(net.join("net-http-probe").join(PROBE_TSV)).unwrap_or_default();
    let skip = state.errors.len().saturating_sub(ERRORS_TAIL);
    Inventory {
        run_id: state.run_id.clone(),
        profile: state.profile.map(|p| p.to_string()),
        listen,
        http_probe: summarize_http_probe(&probe),
        errors_tail: state.errors[skip..].to_vec(),
    }
}

pub fn build_manifest(state: &RunState, root: &Path) -> Manifest {
    Manifest {
        run_id: state.run_id.clone(),
        profile: state.profile.map(|p| p.to_string()),
        phase: state.phase,
        cancelled: state.cancelled,
        started_at: state.started_at,
        ended_at: state.ended_at,
        units: state.units.clone(),
        files: list_files(root),
    }
}

#[derive(Serialize)]
struct UnitRow {
    id: String,
    category: String,
    kind: String,
    status: String,
    duration: String,
    output_bytes: u64,
    sensitive: usize,
    error: String,
}

#[derive(Serialize)]
struct Counts {
    succeeded: usize,
    failed: usize,
    timed_out: usize,
    skipped: usize,
}

#[derive(Serialize)]
struct ReportContext<'a> {
    run_id: String,
    profile: String,
    concurrency: usize,
    started_at: String,
    ended_at: String,
    phase: String,
    cancelled: bool,
    progress: String,
    units: Vec<UnitRow>,
    counts: Counts,
    metrics: &'a MetricsSummary,
    sensitive_count: usize,
    errors: Vec<String>,
}

/// Keep free text from breaking a markdown table row
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

fn stamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string()).unwrap_or_else(|| "-".to_string())
}

pub struct ReportRenderer {
    hbs: Handlebars<'static>,
}

impl ReportRenderer {
    pub fn new() -> Result<Self> {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        hbs.register_template_string("report", REPORT_TEMPLATE)
            .map_err(|e| eyre!("Failed to register report template: {}", e))?;
        hbs.register_template_string("sensitive", SENSITIVE_TEMPLATE)
            .map_err(|e| eyre!("Failed to register sensitive template: {}", e))?;
        Ok(Self { hbs })
    }

    pub fn render_report(&self, state: &RunState, metrics: &MetricsSummary) -> Result<String> {
        debug!(units = state.units.len(), "ReportRenderer::render_report: called");
        let context = ReportContext {
            run_id: state.run_id.clone().unwrap_or_default(),
            profile: state.profile.map(|p| p.to_string()).unwrap_or_default(),
            concurrency: state.concurrency,
            started_at: stamp(state.started_at),
            ended_at: stamp(state.ended_at),
            phase: state.phase.to_string(),
            cancelled: state.cancelled,
            progress: state.progress(),
            units: state
                .units
                .iter()
                .map(|u| UnitRow {
                    id: cell(&u.id),
                    category: cell(&u.category),
                    kind: u.kind.clone(),
                    status: u.status.to_string(),
                    duration: u.duration_ms().map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
                    output_bytes: u.output_bytes,
                    sensitive: u.sensitive,
                    error: u.error.as_deref().map(cell).unwrap_or_default(),
                })
                .collect(),
            counts: Counts {
                succeeded: state.count(UnitStatus::Succeeded),
                failed: state.count(UnitStatus::Failed),
                timed_out: state.count(UnitStatus::TimedOut),
                skipped: state.count(UnitStatus::Skipped),
            },
            metrics,
            sensitive_count: state.sensitive.len(),
            errors: state.errors.clone(),
        };
        self.hbs
            .render("report", &context)
            .map_err(|e| eyre!("Failed to render report: {}", e))
    }

    pub fn render_sensitive(&self, locations: &[SensitiveLocation]) -> Result<String> {
        #[derive(Serialize)]
        struct Ctx<'a> {
            locations: &'a [SensitiveLocation],
        }
        self.hbs
            .render("sensitive", &Ctx { locations })
            .map_err(|e| eyre!("Failed to render sensitive locations: {}", e))
    }
}

/// Write REPORT.md, the sensitive location files, metrics_summary.json and
/// inventory.json under `analysis`, and manifest.json under `meta`
pub fn write_artifacts(state: &RunState, root: &Path) -> Result<()> {
    let analysis = root.join("analysis");
    let meta = root.join("meta");
    let renderer = ReportRenderer::new()?;

    let tsv = fs::read_to_string(meta.join("metrics.tsv")).unwrap_or_default();
    let metrics = summarize_metrics(&tsv);
    write_json(&analysis.join("metrics_summary.json"), &metrics)?;

    write_json(&analysis.join("sensitive_locations.json"), &state.sensitive)?;
    fs::write(
        analysis.join("SENSITIVE_LOCATIONS.md"),
        renderer.render_sensitive(&state.sensitive)?,
    )
    .context("Failed to write SENSITIVE_LOCATIONS.md")?;

    fs::write(analysis.join("REPORT.md"), renderer.render_report(state, &metrics)?)
        .context("Failed to write REPORT.md")?;

    write_json(&analysis.join("inventory.json"), &build_inventory(state, root))?;

    // Last, so the file list includes the analysis output
    write_json(&meta.join("manifest.json"), &build_manifest(state, root))?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
