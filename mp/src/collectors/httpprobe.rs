//! net-http-probe: HTTP(S) reachability of local listening ports

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::netlisten::LISTEN_JSON;
use super::{CollectContext, CollectError, Collector};
use crate::config::HttpProbeConfig;
use crate::monitor::ListenSocket;

const PROBE_PARALLELISM: usize = 4;

/// Result table, summarized into analysis/inventory.json
pub const PROBE_TSV: &str = "http_probe.tsv";

pub struct HttpProbe {
    config: HttpProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Target {
    host: String,
    port: u16,
    path: String,
}

impl Target {
    fn scheme(&self) -> &'static str {
        scheme_for(self.port)
    }

    fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme(), self.host, self.port, self.path)
    }
}

fn scheme_for(port: u16) -> &'static str {
    match port {
        443 | 8443 => "https",
        _ => "http",
    }
}

impl HttpProbe {
    pub fn new(config: HttpProbeConfig) -> Self {
        Self { config }
    }

    /// Configured ports plus the ones net-listen found, capped
    fn ports(&self, run_root: &Path) -> Vec<u16> {
        let mut ports: BTreeSet<u16> = self.config.ports.iter().copied().collect();
        let listen = run_root.join("net").join("net-listen").join(LISTEN_JSON);
        if let Ok(bytes) = std::fs::read(&listen) {
            match serde_json::from_slice::<Vec<ListenSocket>>(&bytes) {
                Ok(sockets) => ports.extend(sockets.iter().map(|s| s.port)),
                Err(e) => debug!(%e, "HttpProbe::ports: unreadable listen list"),
            }
        }
        ports.into_iter().take(self.config.max_ports).collect()
    }

    fn targets(&self, run_root: &Path) -> Vec<Target> {
        let ports = self.ports(run_root);
        let mut targets = Vec::new();
        for host in &self.config.hosts {
            for port in &ports {
                for path in &self.config.paths {
                    targets.push(Target {
                        host: host.clone(),
                        port: *port,
                        path: path.clone(),
                    });
                }
            }
        }
        targets
    }
}

#[async_trait]
impl Collector for HttpProbe {
    fn name(&self) -> &str {
        "net-http-probe"
    }

    async fn collect(&self, ctx: CollectContext) -> Result<(), CollectError> {
        let targets = self.targets(&ctx.run_root);
        debug!(targets = targets.len(), "HttpProbe::collect: called");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CollectError::Failed(format!("http client: {}", e)))?;

        let probes = stream::iter(targets.into_iter().map(|target| {
            let client = client.clone();
            let cancel = ctx.cancel.clone();
            async move {
                let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
                let outcome = tokio::select! {
                    r = client.get(target.url()).send() => Some(r),
                    _ = cancel.cancelled() => None,
                };
                let (code, note) = match outcome {
                    Some(Ok(resp)) => (resp.status().as_u16(), String::new()),
                    Some(Err(e)) if e.is_timeout() => (0, "timeout".to_string()),
                    Some(Err(e)) if e.is_connect() => (0, "connect-failed".to_string()),
                    Some(Err(_)) => (0, "error".to_string()),
                    None => (0, "cancelled".to_string()),
                };
                (target, ts, code, note)
            }
        }))
        .buffer_unordered(PROBE_PARALLELISM)
        .collect::<Vec<_>>()
        .await;
        ctx.check_cancelled()?;

        let mut rows = probes;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        let mut tsv = String::from("ts\thost\tport\tscheme\tpath\tcode\tnote\n");
        for (target, ts, code, note) in &rows {
            tsv.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{:03}\t{}\n",
                ts,
                target.host,
                target.port,
                target.scheme(),
                target.path,
                code,
                note
            ));
        }
        tokio::fs::write(ctx.out_dir.join(PROBE_TSV), tsv).await?;
        Ok(())
    }
}
