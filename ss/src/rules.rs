//! Labeled detection rules
//!
//! Rules are evaluated in order against a single line and the first match
//! wins, so a line produces at most one location. Private key blocks are
//! not a line rule: they are tracked by the block state in the scanner.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Label reported for a PEM private key block
pub const PRIVATE_KEY_LABEL: &str = "private-key-block";

/// Replacement written in place of a detected value
pub const REDACTED: &str = "<REDACTED>";

/// Replacement written in place of a private key body
pub const REDACTED_KEY_BODY: &str = "<REDACTED PRIVATE KEY>";

pub(crate) static PEM_BEGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-----BEGIN [A-Z0-9 ]*PRIVATE KEY-----").unwrap());

pub(crate) static PEM_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"-----END [A-Z0-9 ]*PRIVATE KEY-----").unwrap());

/// Keywords that every built-in rule needs to see on a line. Used as a cheap
/// prefilter before the ordered rules run.
pub(crate) const PREFILTER_KEYWORDS: &str =
    r"pass|pwd|secret|token|api[_-]?key|psk|shared|key|community|authorization";

/// A non-empty value running to the end of the line
const VALUE: &str = r#"(?P<value>["']?[^\s"':=].*)$"#;

/// Separator shared by the key/value rules: `=`/`:` joined or whitespace
const ASSIGNED: &str = r#"["']?(?:\s*[:=]+\s*|\s+)"#;

/// A rule as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub label: String,
    pub pattern: String,
}

/// Compiled single-line rule
#[derive(Debug, Clone)]
pub struct Rule {
    label: String,
    regex: Regex,
}

impl Rule {
    pub fn new(label: impl Into<String>, pattern: &str) -> Result<Self, ScanError> {
        let label = label.into();
        let regex = Regex::new(pattern).map_err(|source| ScanError::InvalidRule {
            label: label.clone(),
            source,
        })?;
        Ok(Self { label, regex })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Rewrite a matching line with its value replaced.
    ///
    /// Rules with a `value` group keep everything before the value; rules
    /// without one have their whole match replaced.
    pub fn redact(&self, line: &str) -> Option<String> {
        let caps = self.regex.captures(line)?;
        let span = caps.name("value").or_else(|| caps.get(0))?;
        let mut out = String::with_capacity(line.len());
        out.push_str(&line[..span.start()]);
        out.push_str(REDACTED);
        out.push_str(&line[span.end()..]);
        Some(out)
    }
}

impl TryFrom<&RuleSpec> for Rule {
    type Error = ScanError;

    fn try_from(spec: &RuleSpec) -> Result<Self, Self::Error> {
        Rule::new(spec.label.clone(), &spec.pattern)
    }
}

fn keyed(label: &str, keys: &str) -> Rule {
    let pattern = format!(r"(?i)(?:^|[^a-z0-9])(?:{keys}){ASSIGNED}{VALUE}");
    Rule::new(label, &pattern).unwrap()
}

static BUILTIN_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new(
            "password-assignment",
            &format!(
                r#"(?i)(?:^|[^a-z0-9])(?:(?:password|passwd|passphrase|pwd){ASSIGNED}|pass["']?\s*[:=]+\s*){VALUE}"#
            ),
        )
        .unwrap(),
        keyed("secret-assignment", "secret"),
        keyed("token-assignment", r"token|api[_-]?key|apikey"),
        keyed("psk-assignment", r"psk|pre[_-]?shared[_-]?key"),
        keyed("key-assignment", "key"),
        keyed("snmp-community", r"(?:ro|rw)?community"),
        Rule::new(
            "basic-auth-header",
            r"(?i)\b(?:proxy-)?authorization\s*:\s*basic\s+(?P<value>\S.*)$",
        )
        .unwrap(),
        Rule::new(
            "bearer-header",
            r"(?i)\b(?:proxy-)?authorization\s*:\s*bearer\s+(?P<value>\S.*)$",
        )
        .unwrap(),
    ]
});

/// The built-in ordered rule list
pub fn builtin_rules() -> Vec<Rule> {
    BUILTIN_RULES.clone()
}

/// Load extra rules from a YAML list of `{label, pattern}` entries
pub fn load_rule_file(path: &Path) -> Result<Vec<RuleSpec>, ScanError> {
    let content = fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
    serde_yaml::from_str(&content).map_err(|e| ScanError::RuleFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
