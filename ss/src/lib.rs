//! SecretScan - location-only secret detection for captured text
//!
//! Scans text for credentials and key material and reports *where* they
//! are (path, 1-based line, rule label) without ever returning the value.
//! A separate copy-producing mode writes redacted mirrors of files or
//! whole trees; originals are never modified.
//!
//! # Example
//!
//! ```ignore
//! use secretscan::Scanner;
//!
//! let scanner = Scanner::new(&[])?;
//! let hits = scanner.scan("etc/config", ["password plain MyS3cret"]);
//! assert_eq!(hits[0].label, "password-assignment");
//! ```

pub mod cli;
mod error;
mod redact;
mod rules;
mod scanner;

pub use error::ScanError;
pub use redact::RedactSummary;
pub use rules::{PRIVATE_KEY_LABEL, REDACTED, REDACTED_KEY_BODY, Rule, RuleSpec, builtin_rules, load_rule_file};
pub use scanner::{
    DEFAULT_MAX_FILE_BYTES, ScanOptions, Scanner, SensitiveLocation, TreeScan, is_probably_text, relative_display,
};
