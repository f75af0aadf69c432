//! Status/Control HTTP API
//!
//! Thin transport over the `Orchestrator`: handlers read `RunState`
//! snapshots or submit start/stop requests, never running collector logic.
//! Everything except `GET /health` sits behind the bearer token middleware.

mod auth;
mod error;
mod handlers;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use eyre::{Context, Result, eyre};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

pub use error::ApiError;
pub use handlers::StatusResponse;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// `None` disables authentication; only valid on a loopback bind
    pub token: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>, token: Option<String>) -> Self {
        Self {
            orchestrator,
            token: token.map(Arc::from),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/start", post(handlers::handle_start))
        .route("/stop", post(handlers::handle_stop))
        .route("/status", get(handlers::handle_status))
        .route("/log", get(handlers::handle_log))
        .route("/archives", get(handlers::handle_archives))
        .route("/download/{name}", get(handlers::handle_download))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(handlers::handle_health))
        .merge(protected)
        .with_state(state)
}

/// Bind `bind:port`, moving up through `fallback` further ports while the
/// address is in use.
pub async fn bind_with_fallback(bind: &str, port: u16, fallback: u16) -> Result<TcpListener> {
    debug!(%bind, port, fallback, "bind_with_fallback: called");
    let last = port.saturating_add(fallback);
    for candidate in port..=last {
        match TcpListener::bind((bind, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!("Port {} in use, bound {} instead", port, candidate);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(candidate, "bind_with_fallback: address in use");
            }
            Err(e) => return Err(e).context(format!("Failed to bind {}:{}", bind, candidate)),
        }
    }
    Err(eyre!("no free port in {}:{}..={}", bind, port, last))
}

/// Serve until `shutdown` resolves
pub async fn serve(state: ApiState, listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr: SocketAddr = listener.local_addr().context("Failed to read bound address")?;
    if state.token.is_none() {
        warn!("API on {} has no bearer token configured", addr);
    }
    info!("Status/Control API listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server failed")?;
    info!("Status/Control API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ExternalUnitConfig};
    use crate::domain::{ProfileName, Weight};
    use crate::monitor::StaticProc;
    use crate::packager::TarPackager;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "t0ken";

    fn slow_unit() -> ExternalUnitConfig {
        ExternalUnitConfig {
            id: "slow".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            category: "t".to_string(),
            timeout_ms: Some(10_000),
            weight: Weight::Small,
            prerequisites: Vec::new(),
            profiles: vec![ProfileName::Lite],
            required: false,
            pass_workdir: false,
        }
    }

    fn state(dir: &Path) -> ApiState {
        let mut config = Config::default();
        config.output_dir = dir.to_path_buf();
        config.monitor.interval_ms = 50;
        config.monitor.proc_root = dir.join("no-proc");
        config.scheduler.poll_ms = 20;
        config.scheduler.grace_ms = 200;
        config.scheduler.stop_wait_ms = 500;
        config.package.enabled = false;
        config.collectors.push(slow_unit());
        let orch = Orchestrator::with_parts(config, Arc::new(StaticProc::new()), Arc::new(TarPackager));
        ApiState::new(Arc::new(orch), Some(TOKEN.to_string()))
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(resp).await, serde_json::json!({ "error": "unauthorized" }));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));
        let resp = app.oneshot(request("GET", "/status", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["progress"], "0/0");
        assert!(body["archives"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_run_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));
        let resp = app.oneshot(request("POST", "/stop", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(resp).await["phase"], "idle");
    }

    #[tokio::test]
    async fn test_start_rejects_malformed_body() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));
        let resp = app.oneshot(request("POST", "/start", "{profile:")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json(resp).await["error"].as_str().unwrap().contains("invalid request body"));
    }

    #[tokio::test]
    async fn test_start_conflict_stop_and_log() {
        let dir = TempDir::new().unwrap();
        let state = state(dir.path());
        let app = router(state.clone());
        let body = r#"{"profile":"lite","collectors":["slow"]}"#;

        let resp = app.clone().oneshot(request("POST", "/start", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let handle = json(resp).await;
        assert_eq!(handle["profile"], "lite");
        assert_eq!(handle["units"], serde_json::json!(["slow"]));

        let resp = app.clone().oneshot(request("POST", "/start", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(request("GET", "/status", "")).await.unwrap();
        let status = json(resp).await;
        assert_eq!(status["progress"], "0/1");

        let resp = app.clone().oneshot(request("POST", "/stop", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["phase"], "completed");

        let final_state = state.orchestrator.snapshot();
        assert!(final_state.cancelled);
        assert_eq!(final_state.unit("slow").unwrap().error.as_deref(), Some("cancelled"));

        let resp = app.oneshot(request("GET", "/log?tail=2", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let log = json(resp).await;
        assert_eq!(log["lines"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_before_any_run_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));
        let resp = app.oneshot(request("GET", "/log", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_archives_and_download() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("maxprobe-x-lite.tar.gz"), b"abc").unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"nope").unwrap();
        let app = router(state(dir.path()));

        let resp = app.clone().oneshot(request("GET", "/archives", "")).await.unwrap();
        let list = json(resp).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["name"], "maxprobe-x-lite.tar.gz");
        assert_eq!(list[0]["size"], 3);

        let resp = app
            .clone()
            .oneshot(request("GET", "/download/maxprobe-x-lite.tar.gz", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/gzip");
        let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"abc");

        for uri in ["/download/secret.txt", "/download/..%2Fsecret.txt", "/download/maxprobe-missing.tar.gz"] {
            let resp = app.clone().oneshot(request("GET", uri, "")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_bind_with_fallback_skips_busy_port() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = busy.local_addr().unwrap().port();
        let listener = bind_with_fallback("127.0.0.1", port, 20).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }
}
