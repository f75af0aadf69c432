//! Location-only secret scanning
//!
//! The scanner never returns matched values. A hit is reported as the file
//! path relative to the scanned root, the 1-based line number and the label
//! of the rule that fired.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, Read};
use std::path::{Component, Path};

use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use grep_searcher::sinks::Lossy;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::ScanError;
use crate::rules::{PEM_BEGIN, PEM_END, PREFILTER_KEYWORDS, PRIVATE_KEY_LABEL, Rule, RuleSpec, builtin_rules};

/// Default per-file size cap (5MB)
pub const DEFAULT_MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Bytes inspected when deciding whether a file is text
const TEXT_PROBE_BYTES: usize = 8192;

/// A suspected secret: where it is, never what it is
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensitiveLocation {
    pub path: String,
    pub line: u64,
    pub label: String,
}

/// Result of scanning a directory tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeScan {
    pub locations: Vec<SensitiveLocation>,
    pub files_scanned: usize,
    pub files_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files larger than this are skipped
    pub max_file_bytes: u64,

    /// Top-level directory names excluded from tree scans
    pub skip_dirs: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            skip_dirs: Vec::new(),
        }
    }
}

/// What a single line means to the scanner, given the block state
#[derive(Debug)]
pub(crate) enum LineClass<'r> {
    Plain,
    Rule(&'r Rule),
    /// A private key block starts here; `closed` when it also ends on this line
    BlockStart {
        closed: bool,
    },
    BlockBody,
    BlockEnd,
}

/// Per-stream state for the multi-line private key rule
#[derive(Debug, Default)]
pub(crate) struct BlockState {
    open: bool,
}

impl BlockState {
    pub(crate) fn is_open(&self) -> bool {
        self.open
    }
}

pub struct Scanner {
    rules: Vec<Rule>,
    prefilter: RegexMatcher,
    options: ScanOptions,
}

impl Scanner {
    /// Build a scanner from the built-in rules followed by `extra` rules
    pub fn new(extra: &[RuleSpec]) -> Result<Self, ScanError> {
        debug!("Scanner::new: called with {} extra rules", extra.len());
        let mut rules = builtin_rules();
        for spec in extra {
            rules.push(Rule::try_from(spec)?);
        }

        let mut alternatives = vec![format!("(?i:{PREFILTER_KEYWORDS})")];
        alternatives.extend(extra.iter().map(|spec| format!("(?:{})", spec.pattern)));
        let prefilter = RegexMatcherBuilder::new()
            .multi_line(true)
            .build(&alternatives.join("|"))?;

        Ok(Self {
            rules,
            prefilter,
            options: ScanOptions::default(),
        })
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub(crate) fn classify(&self, line: &str, state: &mut BlockState) -> LineClass<'_> {
        if state.open {
            if PEM_END.is_match(line) {
                state.open = false;
                return LineClass::BlockEnd;
            }
            return LineClass::BlockBody;
        }

        // NoError: the matcher cannot fail
        if !self.prefilter.is_match(line.as_bytes()).unwrap_or(true) {
            return LineClass::Plain;
        }

        if let Some(begin) = PEM_BEGIN.find(line) {
            let closed = PEM_END.is_match(&line[begin.end()..]);
            state.open = !closed;
            return LineClass::BlockStart { closed };
        }

        match self.rules.iter().find(|r| r.is_match(line)) {
            Some(rule) => LineClass::Rule(rule),
            None => LineClass::Plain,
        }
    }

    fn locate(&self, path: &str, line_no: u64, line: &str, state: &mut BlockState) -> Option<SensitiveLocation> {
        let label = match self.classify(line, state) {
            LineClass::Rule(rule) => rule.label().to_string(),
            LineClass::BlockStart { .. } => PRIVATE_KEY_LABEL.to_string(),
            LineClass::Plain | LineClass::BlockBody | LineClass::BlockEnd => return None,
        };
        Some(SensitiveLocation {
            path: path.to_string(),
            line: line_no,
            label,
        })
    }

    /// Scan an in-memory sequence of lines. Line numbers are 1-based.
    pub fn scan<I, S>(&self, path: &str, lines: I) -> Vec<SensitiveLocation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = BlockState::default();
        lines
            .into_iter()
            .enumerate()
            .filter_map(|(idx, line)| self.locate(path, idx as u64 + 1, &clean_line(line.as_ref()), &mut state))
            .collect()
    }

    /// Scan a byte stream line by line; invalid UTF-8 is decoded lossily
    pub fn scan_reader<R: BufRead>(&self, path: &str, mut reader: R) -> std::io::Result<Vec<SensitiveLocation>> {
        let mut state = BlockState::default();
        let mut found = Vec::new();
        let mut buf = Vec::new();
        let mut line_no = 0u64;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;
            let line = String::from_utf8_lossy(&buf);
            if let Some(loc) = self.locate(path, line_no, &clean_line(&line), &mut state) {
                found.push(loc);
            }
        }
        Ok(found)
    }

    /// Scan one file on disk, reporting paths relative to `root`.
    ///
    /// Returns `Ok(None)` when the file is skipped for size or because it
    /// looks binary.
    pub fn scan_file(&self, root: &Path, file: &Path) -> Result<Option<Vec<SensitiveLocation>>, ScanError> {
        debug!("Scanner::scan_file: {}", file.display());
        let meta = std::fs::metadata(file).map_err(|e| ScanError::io(file, e))?;
        if meta.len() > self.options.max_file_bytes {
            debug!("Scanner::scan_file: {} exceeds size cap, skipping", file.display());
            return Ok(None);
        }
        if !is_probably_text(file).map_err(|e| ScanError::io(file, e))? {
            debug!("Scanner::scan_file: {} looks binary, skipping", file.display());
            return Ok(None);
        }

        let rel = relative_display(root, file);
        let mut state = BlockState::default();
        let mut found = Vec::new();

        // Only lines the prefilter flags can start a block or fire a rule, so
        // feeding the block state those lines alone is equivalent to a full pass.
        // NUL bytes past the probe window must not end the search early.
        let mut searcher = SearcherBuilder::new()
            .binary_detection(BinaryDetection::none())
            .build();
        searcher
            .search_path(
                &self.prefilter,
                file,
                Lossy(|line_no, line| {
                    if let Some(loc) = self.locate(&rel, line_no, &clean_line(line), &mut state) {
                        found.push(loc);
                    }
                    Ok(true)
                }),
            )
            .map_err(|e| ScanError::io(file, e))?;

        Ok(Some(found))
    }

    /// Scan every regular file under `root`, skipping configured top-level
    /// directories. Per-file failures are logged and counted as skipped.
    pub fn scan_tree(&self, root: &Path) -> Result<TreeScan, ScanError> {
        self.scan_subtree(root, root)
    }

    /// Scan only `dir`, reporting paths relative to `root`
    pub fn scan_tree_under(&self, root: &Path, dir: &Path) -> Result<Vec<SensitiveLocation>, ScanError> {
        Ok(self.scan_subtree(root, dir)?.locations)
    }

    fn scan_subtree(&self, root: &Path, dir: &Path) -> Result<TreeScan, ScanError> {
        debug!("Scanner::scan_subtree: {}", dir.display());
        if !dir.is_dir() {
            return Err(ScanError::io(
                dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            ));
        }

        let mut report = TreeScan::default();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_skipped_dir(root, e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Scanner::scan_subtree: walk error: {}", e);
                    report.files_skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.scan_file(root, entry.path()) {
                Ok(Some(mut locations)) => {
                    report.files_scanned += 1;
                    report.locations.append(&mut locations);
                }
                Ok(None) => report.files_skipped += 1,
                Err(e) => {
                    warn!("Scanner::scan_subtree: {}", e);
                    report.files_skipped += 1;
                }
            }
        }

        report.locations.sort();
        Ok(report)
    }

    pub(crate) fn is_skipped_dir(&self, root: &Path, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(root) else {
            return false;
        };
        let mut components = rel.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(first)), None) => {
                path.is_dir() && self.options.skip_dirs.iter().any(|d| first.to_str() == Some(d.as_str()))
            }
            _ => false,
        }
    }
}

pub(crate) fn trim_eol(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Line content as the rules see it: no line terminator, no NUL bytes.
///
/// Some device strings carry NUL terminators inside otherwise plain text.
pub(crate) fn clean_line(line: &str) -> Cow<'_, str> {
    let line = trim_eol(line);
    if line.contains('\0') {
        Cow::Owned(line.replace('\0', ""))
    } else {
        Cow::Borrowed(line)
    }
}

/// True when the head of the file decodes as UTF-8. NUL bytes count as text.
pub fn is_probably_text(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut head = vec![0u8; TEXT_PROBE_BYTES];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(looks_like_text(&head[..filled], filled == head.len()))
}

fn looks_like_text(head: &[u8], truncated: bool) -> bool {
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // a multi-byte character cut by the probe window
        Err(e) => truncated && e.error_len().is_none(),
    }
}

/// Path of `file` relative to `root`, `/` separated
pub fn relative_display(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
