#![forbid(unsafe_code)]

//! Axum backend for the grabtube web front end.
//!
//! Metadata lookups are answered inline; downloads run in the background and
//! are polled by id until the file can be fetched. Everything outside `/api`
//! is served from the optional static web root.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use grabtube_tools::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use grabtube_tools::download::DownloadRequest;
use grabtube_tools::error::GrabError;
use grabtube_tools::jobs::{JobSnapshot, JobTracker, RetrievedFile};
use grabtube_tools::metadata::{MediaInfo, MetadataClient};
use grabtube_tools::security::ensure_not_root;
use grabtube_tools::tools::{DependencyReport, check_dependencies};
use log::{info, warn};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;

/// How long in-flight downloads get to wind down after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct BackendArgs {
    settings: RuntimeSettings,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--download-dir" => overrides.download_dir = Some(PathBuf::from(value()?)),
                "--www-root" => overrides.www_root = Some(PathBuf::from(value()?)),
                "--port" => overrides.grab_port = Some(parse_port_arg(&value()?)?),
                "--host" => overrides.grab_host = Some(value()?),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(overrides)?;
        let listen_host = parse_host_arg(&settings.grab_host)?;
        Ok(Self {
            settings,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRAB_HOST")
}

/// Shared state handed to every handler.
#[derive(Clone)]
struct AppState {
    metadata: MetadataClient,
    jobs: JobTracker,
    settings: Arc<RuntimeSettings>,
}

impl AppState {
    fn new(settings: RuntimeSettings) -> Self {
        Self {
            metadata: MetadataClient::from_settings(&settings),
            jobs: JobTracker::from_settings(&settings),
            settings: Arc::new(settings),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }
}

impl From<GrabError> for ApiError {
    fn from(err: GrabError) -> Self {
        let status = match &err {
            GrabError::Validation(_) => StatusCode::BAD_REQUEST,
            GrabError::UpstreamTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GrabError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            GrabError::UpstreamMalformed { .. } | GrabError::LocalIo(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GrabError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAccepted {
    download_id: String,
    message: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let BackendArgs {
        settings,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;

    let deps = check_dependencies(&settings.ytdlp_bin, &settings.ffmpeg_bin).await;
    if !deps.ytdlp {
        warn!(
            "{} is not available; downloads will fail",
            settings.ytdlp_bin.display()
        );
    }
    if !deps.ffmpeg {
        warn!(
            "{} is not available; audio extraction and merging will fail",
            settings.ffmpeg_bin.display()
        );
    }

    let addr = SocketAddr::new(listen_host, settings.grab_port);
    let state = AppState::new(settings);
    let sweeper = state.jobs.spawn_sweeper();
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.abort();
    state.jobs.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/dependencies", get(dependencies))
        .route("/api/info", post(get_info))
        .route("/api/downloads", post(start_download))
        .route("/api/downloads/{id}", get(get_download_status))
        .route("/api/downloads/{id}/file", get(download_file))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "grabtube backend is running",
    }))
}

async fn dependencies(State(state): State<AppState>) -> Json<DependencyReport> {
    Json(check_dependencies(&state.settings.ytdlp_bin, &state.settings.ffmpeg_bin).await)
}

async fn get_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<MediaInfo>> {
    let Json(payload) = payload?;
    let info = state.metadata.fetch(&payload.url).await.inspect_err(|err| {
        warn!("metadata lookup for {:?} failed: {err}", payload.url);
    })?;
    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadAccepted>> {
    let Json(payload) = payload?;
    let download_id = state.jobs.submit(payload)?;
    Ok(Json(DownloadAccepted {
        download_id,
        message: "Download started",
    }))
}

/// Unknown ids are answered with the `not_found` snapshot rather than a 404
/// so pollers can treat every response the same way.
async fn get_download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Json<JobSnapshot> {
    Json(state.jobs.poll(&id))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let retrieved = state
        .jobs
        .retrieve(&id)
        .await
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    info!("job {id}: delivering {}", retrieved.filename);
    Ok(attachment_response(retrieved))
}

fn attachment_response(retrieved: RetrievedFile) -> Response {
    let RetrievedFile {
        file,
        filename,
        size,
        ..
    } = retrieved;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = size.to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Some(mime) = MimeGuess::from_path(&filename).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = content_disposition(&filename).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// `filename` carries an ASCII stand-in for old clients; `filename*` carries
/// the real name percent-encoded as UTF-8 (RFC 6266 / RFC 5987).
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.settings.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes (no extension) get the SPA entry point.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut headers = HeaderMap::new();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}
