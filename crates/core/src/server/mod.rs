use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

mod jobs;

pub use jobs::{CancelError, Job, JobOutput, JobResponse, JobStatus, JobTable, JobWsEvent};

use crate::config::AppConfig;
use crate::enhance::EnhanceOutcome;
use crate::generator::GenerationRequest;
use crate::service::{GenerationService, ProgressSink};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: Arc<GenerationService>,
    jobs: JobTable,
    config: AppConfig,
}

impl AppState {
    pub fn new(service: Arc<GenerationService>, config: AppConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                service,
                jobs: JobTable::with_retention(config.housekeeping.retention()),
                config,
            }),
        }
    }

    pub fn service(&self) -> &Arc<GenerationService> {
        &self.inner.service
    }

    pub fn jobs(&self) -> &JobTable {
        &self.inner.jobs
    }

    /// Cancels every queued or running job, for graceful shutdown.
    pub fn cancel_all_jobs(&self) -> usize {
        let mut cancelled = 0;
        for job in self.inner.jobs.list() {
            if !job.status.is_terminal() && self.inner.jobs.cancel(&job.id).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[derive(Debug, Deserialize)]
pub struct EnhanceRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct EnhanceResponse {
    pub prompt: String,
    pub outcome: EnhanceOutcome,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub num_inference_steps: Option<u32>,
    #[serde(default)]
    pub guidance_scale: Option<f32>,
    #[serde(default)]
    pub enhance: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub upscale_enabled: bool,
    pub enhance_enabled: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Embedded frontend assets ───────────────────────────────────────────────

#[derive(rust_embed::RustEmbed)]
#[folder = "../../web"]
struct FrontendAssets;

async fn embedded_static_handler(uri: axum::http::Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match FrontendAssets::get(path) {
        Some(file) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                file.data,
            )
                .into_response()
        }
        None => match FrontendAssets::get("index.html") {
            Some(index) => (
                [(axum::http::header::CONTENT_TYPE, "text/html")],
                index.data,
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let outputs = ServeDir::new(state.inner.service.output_dir());

    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/enhance", post(enhance_prompt))
        .route("/api/generate", post(create_generation))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/jobs/{id}/ws", any(job_ws))
        .route("/api/{*path}", any(api_route_not_found))
        .nest_service("/outputs", outputs)
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback(embedded_static_handler)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        upscale_enabled: state.inner.service.has_upscaler(),
        enhance_enabled: state.inner.service.enhancer_enabled(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.inner.config.clone())
}

async fn enhance_prompt(
    State(state): State<AppState>,
    Json(payload): Json<EnhanceRequest>,
) -> Result<Json<EnhanceResponse>, AppError> {
    if payload.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt must not be empty".to_string()));
    }

    let outcome = state.inner.service.enhance_prompt(&payload.prompt).await;
    info!(outcome = outcome.label(), "Prompt enhance request");
    Ok(Json(EnhanceResponse {
        prompt: outcome.resolve(&payload.prompt),
        outcome,
    }))
}

async fn create_generation(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let defaults = &state.inner.config.generation;
    let request = GenerationRequest::new(
        payload.prompt,
        payload.num_inference_steps.unwrap_or(defaults.default_steps),
        payload.guidance_scale.unwrap_or(defaults.default_guidance),
    );
    request
        .validate()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    let job = state.inner.jobs.create(request, payload.enhance);
    let created = CreateJobResponse {
        id: job.id.clone(),
        status: job.status,
        created_at: job.created_at,
    };

    let state_clone = state.clone();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        run_job(state_clone, job_id).await;
    });

    info!(
        job_id = %created.id,
        steps = job.request.num_inference_steps,
        guidance = job.request.guidance_scale,
        enhance = job.enhance,
        "Job created"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobResponse>> {
    Json(state.inner.jobs.list())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state
        .inner
        .jobs
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;

    Ok(Json(JobResponse::from(&job)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    match state.inner.jobs.cancel(&id) {
        Ok(job) => {
            info!(job_id = %id, "Job cancelled");
            Ok(Json(JobResponse::from(&job)))
        }
        Err(CancelError::NotFound) => Err(AppError::NotFound(format!("job not found: {id}"))),
        Err(CancelError::AlreadyFinished(status)) => Err(AppError::Conflict(format!(
            "job {id} already finished with status {}",
            status.as_str()
        ))),
    }
}

async fn job_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    // Subscribe before reading the snapshot so no transition is missed.
    let rx = state.inner.jobs.subscribe(&id);
    let job = state
        .inner
        .jobs
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    let initial = JobWsEvent::status_of(&job);

    Ok(ws.on_upgrade(move |socket| handle_ws(socket, initial, rx)))
}

async fn send_event(socket: &mut WebSocket, event: &JobWsEvent) -> bool {
    let Ok(json) = serde_json::to_string(event) else {
        return false;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_ws(
    mut socket: WebSocket,
    initial: JobWsEvent,
    rx: Option<broadcast::Receiver<JobWsEvent>>,
) {
    if !send_event(&mut socket, &initial).await || initial.is_terminal() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    let Some(mut rx) = rx else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await || event.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn run_job(state: AppState, job_id: String) {
    let Some(job) = state.inner.jobs.get(&job_id) else {
        return;
    };
    if job.status != JobStatus::Queued {
        // Cancelled before it started; only the event channel needs closing.
        state
            .inner
            .jobs
            .finish(&job_id, Err(anyhow::anyhow!("job cancelled before start")));
        return;
    }

    let progress_state = state.clone();
    let progress_id = job_id.clone();
    let on_progress: ProgressSink = Arc::new(move |progress| {
        progress_state
            .inner
            .jobs
            .record_progress(&progress_id, progress);
    });

    let result = state
        .inner
        .service
        .generate(job.request, job.enhance, job.cancel_token, on_progress)
        .await;

    if let Err(err) = &result {
        error!(job_id = %job_id, error = %format!("{err:#}"), "Job execution failed");
    }
    let status = state.inner.jobs.finish(&job_id, result);
    info!(job_id = %job_id, status = ?status, "Job finished");
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path as StdPath;
    use std::time::Duration;

    use anyhow::bail;
    use axum::body::Body;
    use axum::http::Request;
    use ndarray::Array5;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::config::EnhanceConfig;
    use crate::enhance::PromptEnhancer;
    use crate::export::ExportSettings;
    use crate::generator::VideoGenerator;
    use crate::service::ServiceOptions;

    struct FailingGenerator;

    impl VideoGenerator for FailingGenerator {
        fn generate(&mut self, _request: &GenerationRequest) -> anyhow::Result<Array5<f32>> {
            bail!("no model in tests")
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    fn test_state(output_dir: &StdPath) -> AppState {
        let mut config = AppConfig::default();
        config.paths.output_dir = output_dir.to_path_buf();
        config.enhance.api_key = Some("sk-never-serialized-123456".to_string());

        // The enhancer itself is keyless so no test reaches the network.
        let enhancer = PromptEnhancer::new(&EnhanceConfig::default()).unwrap();
        let options = ServiceOptions {
            output_dir: output_dir.to_path_buf(),
            export: ExportSettings::new(8, &config.export),
            tile: 512,
            overlap: 32,
            timeout: Some(Duration::from_secs(5)),
        };
        let service = GenerationService::new(Box::new(FailingGenerator), None, enhancer, options);
        AppState::new(Arc::new(service), config)
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn wait_for_terminal(state: &AppState, id: &str) -> JobStatus {
        for _ in 0..100 {
            if let Some(job) = state.jobs().get(id) {
                if job.status.is_terminal() {
                    return job.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/api/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["upscale_enabled"], false);
        assert_eq!(json["enhance_enabled"], false);
    }

    #[tokio::test]
    async fn test_config_endpoint_omits_api_key() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/api/config")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("sk-never-serialized"));
        assert!(!text.contains("api_key"));

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["generation"]["default_steps"], 50);
    }

    #[tokio::test]
    async fn test_enhance_without_key_is_passthrough() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let prompt = "a koi pond at dusk ";
        let resp = send_request(
            &mut app,
            json_post("/api/enhance", serde_json::json!({ "prompt": prompt })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["prompt"], prompt);
        assert_eq!(json["outcome"]["kind"], "disabled");
    }

    #[tokio::test]
    async fn test_enhance_rejects_blank_prompt() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(
            &mut app,
            json_post("/api/enhance", serde_json::json!({ "prompt": "   " })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate_validation_errors() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        for body in [
            serde_json::json!({ "prompt": "" }),
            serde_json::json!({ "prompt": "ok", "num_inference_steps": 0 }),
            serde_json::json!({ "prompt": "ok", "guidance_scale": -1.0 }),
        ] {
            let resp = send_request(&mut app, json_post("/api/generate", body)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let json = body_json(resp).await;
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_generate_creates_job_that_fails_without_model() {
        let temp = tempfile::tempdir().unwrap();
        let state = test_state(temp.path());
        let mut app = app_router(state.clone());

        let resp = send_request(
            &mut app,
            json_post("/api/generate", serde_json::json!({ "prompt": "a red kite" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "queued");
        let id = json["id"].as_str().unwrap().to_string();

        assert_eq!(wait_for_terminal(&state, &id).await, JobStatus::Failed);

        let resp = send_request(&mut app, get(&format!("/api/jobs/{id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let job = body_json(resp).await;
        assert_eq!(job["status"], "failed");
        assert_eq!(job["request"]["num_inference_steps"], 50);
        assert!(job["error"].as_str().unwrap().contains("no model in tests"));

        let resp = send_request(&mut app, get("/api/jobs")).await;
        let list = body_json(resp).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_returns_404() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/api/jobs/does-not-exist")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/jobs/does-not-exist")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_conflicts() {
        let temp = tempfile::tempdir().unwrap();
        let state = test_state(temp.path());
        let mut app = app_router(state.clone());

        let job = state
            .jobs()
            .create(GenerationRequest::new("x", 10, 6.0), false);
        state
            .jobs()
            .finish(&job.id, Err(anyhow::anyhow!("failed early")));

        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/api/jobs/{}", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let temp = tempfile::tempdir().unwrap();
        let state = test_state(temp.path());
        let mut app = app_router(state.clone());

        let job = state
            .jobs()
            .create(GenerationRequest::new("x", 10, 6.0), false);
        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/api/jobs/{}", job.id))
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "cancelled");
        assert!(job.cancel_token.is_cancelled());
        assert_eq!(state.cancel_all_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/api/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "api endpoint not found: /api/nope");
    }

    #[tokio::test]
    async fn test_outputs_are_served_from_output_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("20240309_140507.gif"), b"GIF89a").unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/outputs/20240309_140507.gif")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"GIF89a");
    }

    #[tokio::test]
    async fn test_root_serves_embedded_index() {
        let temp = tempfile::tempdir().unwrap();
        let mut app = app_router(test_state(temp.path()));

        let resp = send_request(&mut app, get("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8_lossy(&body);
        assert!(html.contains("Generate Video"));
    }
}
