//! Error types for secretscan

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rule '{label}': {source}")]
    InvalidRule {
        label: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to build prefilter: {0}")]
    Prefilter(#[from] grep_regex::Error),

    #[error("Failed to parse rule file {path}: {message}")]
    RuleFile { path: PathBuf, message: String },
}

impl ScanError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
