//! sys-proc: copy core procfs files

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{CollectContext, CollectError, Collector, read_capped};

/// Per-file copy limit
const FILE_CAP: u64 = 64 * 1024;

const FILES: &[&str] = &["cpuinfo", "meminfo", "loadavg", "uptime", "version", "cmdline", "mounts"];

pub struct SysProc {
    proc_root: PathBuf,
}

impl SysProc {
    pub fn new(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }
}

#[async_trait]
impl Collector for SysProc {
    fn name(&self) -> &str {
        "sys-proc"
    }

    async fn collect(&self, ctx: CollectContext) -> Result<(), CollectError> {
        debug!(root = %self.proc_root.display(), "SysProc::collect: called");
        let mut copied = 0;
        for name in FILES {
            ctx.check_cancelled()?;
            match read_capped(&self.proc_root.join(name), FILE_CAP).await {
                Ok(bytes) => {
                    tokio::fs::write(ctx.out_dir.join(format!("{}.txt", name)), bytes).await?;
                    copied += 1;
                }
                Err(e) => debug!(%name, %e, "SysProc::collect: unreadable, skipping"),
            }
        }
        if copied == 0 {
            return Err(CollectError::Unavailable(format!(
                "{} is not readable",
                self.proc_root.display()
            )));
        }
        Ok(())
    }
}
