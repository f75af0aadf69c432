//! net-listen: listening TCP sockets from procfs

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{CollectContext, CollectError, Collector};
use crate::monitor::{ListenSocket, ProcSource, parse_listen_sockets};

/// File the http probe reads back
pub const LISTEN_JSON: &str = "listen_ports.json";

pub struct NetListen {
    source: Arc<dyn ProcSource>,
}

impl NetListen {
    pub fn new(source: Arc<dyn ProcSource>) -> Self {
        Self { source }
    }

    fn read_sockets(&self) -> Option<Vec<ListenSocket>> {
        let mut any = false;
        let mut sockets = Vec::new();
        for (name, proto) in [("net/tcp", "tcp"), ("net/tcp6", "tcp6")] {
            match self.source.read(name) {
                Ok(table) => {
                    any = true;
                    sockets.extend(parse_listen_sockets(&table, proto));
                }
                Err(e) => debug!(%name, %e, "NetListen::read_sockets: table unavailable"),
            }
        }
        if !any {
            return None;
        }
        sockets.sort();
        sockets.dedup_by(|a, b| a.proto == b.proto && a.address == b.address && a.port == b.port);
        Some(sockets)
    }
}

#[async_trait]
impl Collector for NetListen {
    fn name(&self) -> &str {
        "net-listen"
    }

    async fn collect(&self, ctx: CollectContext) -> Result<(), CollectError> {
        debug!("NetListen::collect: called");
        let sockets = self
            .read_sockets()
            .ok_or_else(|| CollectError::Unavailable("no /proc/net/tcp tables".to_string()))?;
        ctx.check_cancelled()?;

        let mut tsv = String::from("proto\taddress\tport\tinode\n");
        for s in &sockets {
            tsv.push_str(&format!("{}\t{}\t{}\t{}\n", s.proto, s.address, s.port, s.inode));
        }
        tokio::fs::write(ctx.out_dir.join("listen_ports.tsv"), tsv).await?;

        let json = serde_json::to_vec_pretty(&sockets).map_err(|e| CollectError::Failed(e.to_string()))?;
        tokio::fs::write(ctx.out_dir.join(LISTEN_JSON), json).await?;
        Ok(())
    }
}
