//! HTTP request handlers

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::ApiState;
use super::error::ApiError;
use crate::domain::{ProfileName, ResourceSample, RunPhase, RunState, UnitSelection};
use crate::orchestrator::{RunHandle, RunRequest};
use crate::packager::{ArchiveInfo, list_archives};
use crate::state::{sanitize_name, tail_lines};

const STATUS_ARCHIVES: usize = 10;
const LIST_ARCHIVES: usize = 100;
const DEFAULT_TAIL: usize = 100;
const MAX_TAIL: usize = 10_000;

/// `collectors` may be a comma list or a JSON array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CollectorsField {
    List(Vec<String>),
    Text(String),
}

/// Fields other clients send (web UI `mode`, `deps_level`) are ignored
#[derive(Debug, Default, Deserialize)]
struct StartBody {
    profile: Option<ProfileName>,
    concurrency: Option<usize>,
    collectors: Option<CollectorsField>,
}

impl StartBody {
    fn into_request(self) -> Result<RunRequest, ApiError> {
        if self.concurrency == Some(0) {
            return Err(ApiError::BadRequest("concurrency must be at least 1".to_string()));
        }
        let collectors = match self.collectors {
            None => UnitSelection::All,
            Some(CollectorsField::Text(s)) => s.parse().unwrap_or_default(),
            Some(CollectorsField::List(ids)) => ids.join(",").parse().unwrap_or_default(),
        };
        Ok(RunRequest {
            profile: self.profile.unwrap_or_default(),
            concurrency: self.concurrency,
            collectors,
            output_dir: None,
        })
    }
}

fn parse_start(body: &[u8]) -> Result<RunRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return StartBody::default().into_request();
    }
    let parsed: StartBody =
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))?;
    parsed.into_request()
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: RunPhase,
    pub progress: String,
    pub metrics: Option<ResourceSample>,
    pub run: RunState,
    pub archives: Vec<ArchiveInfo>,
}

#[derive(Debug, Serialize)]
struct PhaseResponse {
    phase: RunPhase,
}

#[derive(Debug, Serialize)]
struct LogResponse {
    path: String,
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    tail: Option<usize>,
}

pub async fn handle_health() -> &'static str {
    "ok"
}

pub async fn handle_start(State(state): State<ApiState>, body: Bytes) -> Result<Json<RunHandle>, ApiError> {
    debug!(len = body.len(), "handle_start: called");
    let request = parse_start(&body)?;
    let handle = state.orchestrator.start_run(request).await?;
    info!("Run {} started via API ({})", handle.run_id, handle.profile);
    Ok(Json(handle))
}

pub async fn handle_stop(State(state): State<ApiState>) -> Result<Response, ApiError> {
    debug!("handle_stop: called");
    let phase = state.orchestrator.stop_run().await;
    if phase == RunPhase::Idle {
        let body = serde_json::json!({ "error": "no run has been started", "phase": phase });
        return Ok((axum::http::StatusCode::NOT_FOUND, Json(body)).into_response());
    }
    Ok(Json(PhaseResponse { phase }).into_response())
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    debug!("handle_status: called");
    let run = state.orchestrator.snapshot();
    let output_dir = state.orchestrator.config().output_dir.clone();
    let archives = tokio::task::spawn_blocking(move || list_archives(&output_dir, STATUS_ARCHIVES))
        .await
        .unwrap_or_default();
    Json(StatusResponse {
        phase: run.phase,
        progress: run.progress(),
        metrics: run.metrics,
        run,
        archives,
    })
}

pub async fn handle_log(State(state): State<ApiState>, Query(query): Query<LogQuery>) -> Result<Response, ApiError> {
    debug!(tail = ?query.tail, "handle_log: called");
    let tail = query.tail.unwrap_or(DEFAULT_TAIL).min(MAX_TAIL);
    let Some(workdir) = state.orchestrator.snapshot().workdir else {
        return Err(ApiError::NotFound("no run log: no run has been started".to_string()));
    };
    let path = workdir.join("meta").join("run.log");
    let read_path = path.clone();
    let lines = tokio::task::spawn_blocking(move || tail_lines(&read_path, tail))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::NotFound(format!("{}: {}", path.display(), e)))?;
    Ok(Json(LogResponse {
        path: path.display().to_string(),
        lines,
    })
    .into_response())
}

pub async fn handle_archives(State(state): State<ApiState>) -> Json<Vec<ArchiveInfo>> {
    debug!("handle_archives: called");
    let output_dir = state.orchestrator.config().output_dir.clone();
    let archives = tokio::task::spawn_blocking(move || list_archives(&output_dir, LIST_ARCHIVES))
        .await
        .unwrap_or_default();
    Json(archives)
}

pub async fn handle_download(State(state): State<ApiState>, Path(name): Path<String>) -> Result<Response, ApiError> {
    debug!(%name, "handle_download: called");
    let not_found = || ApiError::NotFound(format!("no archive named {}", name));
    if sanitize_name(&name) != name {
        return Err(not_found());
    }
    let output_dir = state.orchestrator.config().output_dir.clone();
    let archives = tokio::task::spawn_blocking(move || list_archives(&output_dir, usize::MAX))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let Some(archive) = archives.into_iter().find(|a| a.name == name) else {
        return Err(not_found());
    };

    let file = tokio::fs::File::open(&archive.path).await.map_err(|_| not_found())?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_LENGTH, archive.size.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", archive.name)),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_empty_body_is_default() {
        assert_eq!(parse_start(b"").unwrap(), RunRequest::default());
        assert_eq!(parse_start(b" \n").unwrap(), RunRequest::default());
    }

    #[test]
    fn test_parse_start_fields() {
        let req = parse_start(br#"{"profile":"lite","concurrency":3,"collectors":["sys-proc","net-listen"]}"#).unwrap();
        assert_eq!(req.profile, ProfileName::Lite);
        assert_eq!(req.concurrency, Some(3));
        assert_eq!(
            req.collectors,
            UnitSelection::Only(vec!["sys-proc".to_string(), "net-listen".to_string()])
        );

        let req = parse_start(br#"{"collectors":"all"}"#).unwrap();
        assert_eq!(req.collectors, UnitSelection::All);
    }

    #[test]
    fn test_parse_start_rejects_bad_input() {
        assert!(matches!(parse_start(b"{not json"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_start(br#"{"profile":"huge"}"#), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_start(br#"{"concurrency":0}"#), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_start(br#""lite""#), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_parse_start_ignores_unknown_fields() {
        let req = parse_start(br#"{"profile":"lite","mode":"safe","deps_level":2}"#).unwrap();
        assert_eq!(req.profile, ProfileName::Lite);
        assert_eq!(req.collectors, UnitSelection::All);
    }
}
