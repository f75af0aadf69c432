//! Textual run log: meta/run.log and meta/errors.log

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{error, info, warn};

/// Bytes read from the end of the log when tailing
const TAIL_WINDOW: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

pub struct RunLog {
    run: Mutex<File>,
    errors: Mutex<File>,
    path: PathBuf,
}

impl RunLog {
    pub fn create(meta_dir: &Path) -> io::Result<Self> {
        let path = meta_dir.join("run.log");
        let open = |p: &Path| OpenOptions::new().create(true).append(true).open(p);
        Ok(Self {
            run: Mutex::new(open(&path)?),
            errors: Mutex::new(open(&meta_dir.join("errors.log"))?),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        info!("{}", msg.as_ref());
        self.write(Level::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        warn!("{}", msg.as_ref());
        self.write(Level::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        error!("{}", msg.as_ref());
        self.write(Level::Error, msg.as_ref());
    }

    fn write(&self, level: Level, msg: &str) {
        let tag = match level {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        let line = format!("{} [{}] {}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), tag, msg);
        // The run log is best effort; a full disk must not stop the run
        if let Ok(mut f) = self.run.lock() {
            let _ = f.write_all(line.as_bytes());
        }
        if !matches!(level, Level::Info)
            && let Ok(mut f) = self.errors.lock()
        {
            let _ = f.write_all(line.as_bytes());
        }
    }
}

/// Last `n` lines of a text file, reading at most a bounded window from
/// its end.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<&str> = text.lines().collect();
    // A window that starts mid-file begins with a partial line
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}
