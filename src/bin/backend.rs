#![forbid(unsafe_code)]

//! Axum backend that serves a LocalTube library straight from disk.
//!
//! The catalogue is whatever the last scan found; files are streamed from the
//! channel folders as-is. The only things this server writes are the user
//! data file and, on explicit request, deletions of a video's files.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use clap::Parser;
use localtube::{
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    library::{Library, LibraryStats},
    scanner::Channel,
    user_data::{UserDataStore, resume_position},
    watcher::watch_library,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal, task,
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "localtube-backend",
    about = "Serve a folder of downloaded videos as a browsable library"
)]
struct BackendArgs {
    /// Library root holding one folder per channel
    #[arg(long, value_name = "DIR")]
    media_root: Option<PathBuf>,

    /// Built frontend to serve for non-API paths
    #[arg(long, value_name = "DIR")]
    www_root: Option<PathBuf>,

    /// Where watch history and playback positions are stored
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_parser = parse_host_arg)]
    host: Option<IpAddr>,

    /// Env file to read settings from [default: .env]
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Do not rescan when files change on disk
    #[arg(long)]
    no_watch: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl BackendArgs {
    fn resolve(&self) -> Result<RuntimeConfig> {
        resolve_runtime_config(RuntimeOverrides {
            media_root: self.media_root.clone(),
            www_root: self.www_root.clone(),
            data_dir: self.data_dir.clone(),
            port: self.port,
            host: self.host.map(|host| host.to_string()),
            watch: self.no_watch.then_some(false),
            env_path: self.env_file.clone(),
        })
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/LOCALTUBE_HOST")
}

#[derive(Clone)]
struct AppState {
    library: Arc<Library>,
    user_data: Arc<UserDataStore>,
    www_root: Option<Arc<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing(args.verbose);
    let config = args.resolve()?;

    let library = Arc::new(Library::new(&config.media_root, config.scan.clone()));
    let stats = {
        let library = library.clone();
        task::spawn_blocking(move || library.rescan())
            .await
            .context("running initial library scan")?
    };
    tracing::info!(
        root = %config.media_root.display(),
        channels = stats.channels,
        videos = stats.videos,
        "initial library scan complete"
    );

    // Held for the lifetime of the server; dropping it stops the watcher.
    let _watcher = if config.watch {
        match watch_library(library.clone(), std::slice::from_ref(&config.data_dir)) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(error = %err, "file watcher not started");
                None
            }
        }
    } else {
        tracing::info!("file watcher disabled");
        None
    };

    let state = AppState {
        library,
        user_data: Arc::new(UserDataStore::load(&config.data_dir)),
        www_root: config.www_root.clone().map(Arc::new),
    };

    let host = parse_host_arg(&config.host)?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "localtube=debug,backend=debug,tower_http=debug"
    } else {
        "localtube=info,backend=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::RANGE]);

    Router::new()
        .route("/api/channels", get(list_channels))
        .route("/api/channels/{folder}", get(get_channel))
        .route("/api/stats", get(get_stats))
        .route("/api/rescan", post(rescan))
        .route(
            "/api/video/{channel}/{name}",
            get(stream_video).delete(delete_video),
        )
        .route("/api/subtitle/{channel}/{file}", get(download_subtitle))
        .route("/api/thumbnail/{channel}/{file}", get(download_thumbnail))
        .route("/api/channel-avatar/{channel}/{file}", get(download_avatar))
        .route(
            "/api/history",
            get(get_history).post(replace_history).put(replace_history),
        )
        .route(
            "/api/deleted",
            get(get_deleted).post(replace_deleted).put(replace_deleted),
        )
        .route(
            "/api/progress/{channel}/{video_id}",
            get(get_progress).put(save_progress),
        )
        .fallback(static_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(www_root) = state.www_root.as_deref() else {
        return ApiError::not_found("frontend not configured").into_response();
    };

    match serve_www_path(www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None).await,
        Ok(_) => stream_file(target, None).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html"), None).await
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

/// Client-side routes have no extension; anything that looks like an asset
/// must exist on disk.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<Channel>> {
    Json(state.library.channels().to_vec())
}

async fn get_channel(
    State(state): State<AppState>,
    AxumPath(folder): AxumPath<String>,
) -> ApiResult<Json<Channel>> {
    state
        .library
        .find_channel(&folder)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("channel not found"))
}

async fn get_stats(State(state): State<AppState>) -> Json<LibraryStats> {
    Json(state.library.stats())
}

async fn rescan(State(state): State<AppState>) -> ApiResult<Json<LibraryStats>> {
    Ok(Json(run_rescan(&state).await?))
}

async fn run_rescan(state: &AppState) -> ApiResult<LibraryStats> {
    let library = state.library.clone();
    task::spawn_blocking(move || library.rescan())
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath((channel, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve_channel_file(&state, &channel, &file, Some(&headers)).await
}

async fn download_subtitle(
    State(state): State<AppState>,
    AxumPath((channel, file)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    serve_channel_file(&state, &channel, &file, None).await
}

async fn download_thumbnail(
    State(state): State<AppState>,
    AxumPath((channel, file)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    serve_channel_file(&state, &channel, &file, None).await
}

async fn download_avatar(
    State(state): State<AppState>,
    AxumPath((channel, file)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    serve_channel_file(&state, &channel, &file, None).await
}

async fn serve_channel_file(
    state: &AppState,
    channel: &str,
    file: &str,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    ensure_safe_path_segment(channel)?;
    ensure_safe_path_segment(file)?;
    let path = state.library.root().join(channel).join(file);
    stream_file(path, headers).await
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
    removed: Vec<String>,
}

/// Removes a video together with every sidecar sharing its stem, then
/// rescans so the catalogue reflects the deletion immediately.
async fn delete_video(
    State(state): State<AppState>,
    AxumPath((channel, video_id)): AxumPath<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    ensure_safe_path_segment(&channel)?;
    ensure_safe_path_segment(&video_id)?;
    let known = state
        .library
        .find_channel(&channel)
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    if known.video(&video_id).is_none() {
        return Err(ApiError::not_found("video not found"));
    }

    let dir = state.library.root().join(&channel);
    let removed = task::spawn_blocking({
        let video_id = video_id.clone();
        move || remove_video_files(&dir, &video_id)
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
    .map_err(|err| {
        tracing::error!(channel = %channel, video = %video_id, error = %err, "delete failed");
        ApiError::internal("delete failed")
    })?;

    if removed.is_empty() {
        return Err(ApiError::not_found("video not found"));
    }
    tracing::info!(channel = %channel, video = %video_id, files = removed.len(), "deleted video");

    if let Err(err) = state.user_data.forget_position(&channel, &video_id) {
        tracing::warn!(error = %err, "could not drop playback position");
    }
    run_rescan(&state).await?;

    Ok(Json(DeleteResponse {
        success: true,
        removed,
    }))
}

/// Deletes `<video_id>.*` files in `dir` and returns their names.
fn remove_video_files(dir: &Path, video_id: &str) -> Result<Vec<String>> {
    let prefix = format!("{video_id}.");
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && entry.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort();
    for name in &names {
        fs::remove_file(dir.join(name)).with_context(|| format!("removing {name}"))?;
    }
    Ok(names)
}

async fn get_history(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.user_data.history())
}

async fn replace_history(
    State(state): State<AppState>,
    Json(entries): Json<Vec<Value>>,
) -> ApiResult<Json<Vec<Value>>> {
    let saved = state
        .user_data
        .replace_history(entries)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(saved))
}

async fn get_deleted(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.user_data.deleted())
}

async fn replace_deleted(
    State(state): State<AppState>,
    Json(entries): Json<Vec<Value>>,
) -> ApiResult<Json<Vec<Value>>> {
    let saved = state
        .user_data
        .replace_deleted(entries)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
struct ProgressUpdate {
    seconds: f64,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressResponse {
    seconds: f64,
    duration: Option<f64>,
    resume_at: f64,
    updated_at: Option<DateTime<Utc>>,
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath((channel, video_id)): AxumPath<(String, String)>,
) -> ApiResult<Json<ProgressResponse>> {
    ensure_safe_path_segment(&channel)?;
    ensure_safe_path_segment(&video_id)?;
    let response = match state.user_data.position(&channel, &video_id) {
        Some(position) => ProgressResponse {
            seconds: position.seconds,
            duration: position.duration,
            resume_at: resume_position(position.seconds, position.duration),
            updated_at: Some(position.updated_at),
        },
        None => ProgressResponse {
            seconds: 0.0,
            duration: None,
            resume_at: 0.0,
            updated_at: None,
        },
    };
    Ok(Json(response))
}

async fn save_progress(
    State(state): State<AppState>,
    AxumPath((channel, video_id)): AxumPath<(String, String)>,
    Json(update): Json<ProgressUpdate>,
) -> ApiResult<Json<ProgressResponse>> {
    ensure_safe_path_segment(&channel)?;
    ensure_safe_path_segment(&video_id)?;
    let position = state
        .user_data
        .save_position(&channel, &video_id, update.seconds, update.duration)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(ProgressResponse {
        seconds: position.seconds,
        duration: position.duration,
        resume_at: resume_position(position.seconds, position.duration),
        updated_at: Some(position.updated_at),
    }))
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    let mut components = Path::new(value).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if value.is_empty() || !single_normal {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(())
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            if let Ok(value) = format!("bytes */{}", size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = format!("bytes {}-{}/{}", start, end, size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header::HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(size));
        response
    };

    response.headers_mut().insert(
        header::ACCEPT_RANGES,
        header::HeaderValue::from_static("bytes"),
    );
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::HeaderValue};
    use localtube::scanner::ScanConfig;
    use serde_json::json;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        media_root: PathBuf,
        www_root: PathBuf,
        state: AppState,
    }

    impl BackendTestContext {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let media_root = temp.path().join("media");
            let www_root = temp.path().join("www");
            fs::create_dir_all(&media_root).unwrap();
            fs::create_dir_all(&www_root).unwrap();
            fs::write(www_root.join("index.html"), "<html>app</html>").unwrap();

            let state = AppState {
                library: Arc::new(Library::new(&media_root, ScanConfig::default())),
                user_data: Arc::new(UserDataStore::load(&temp.path().join("data"))),
                www_root: Some(Arc::new(www_root.clone())),
            };

            Self {
                _temp: temp,
                media_root,
                www_root,
                state,
            }
        }

        fn add_file(&self, channel: &str, name: &str, contents: &[u8]) {
            let dir = self.media_root.join(channel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(name), contents).unwrap();
        }

        fn rescan(&self) {
            self.state.library.rescan();
        }

        async fn send(&self, request: Request<Body>) -> Response {
            build_router(self.state.clone())
                .oneshot(request)
                .await
                .unwrap()
        }
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn json_request(method: Method, uri: &str, payload: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[test]
    fn backend_args_map_to_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--media-root",
            "/custom/media",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
            "--no-watch",
        ])
        .unwrap();
        assert_eq!(args.media_root, Some(PathBuf::from("/custom/media")));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.host, Some("0.0.0.0".parse::<IpAddr>().unwrap()));
        assert!(args.no_watch);
    }

    #[test]
    fn backend_args_reject_bad_host() {
        assert!(BackendArgs::try_parse_from(["backend", "--host", "nowhere"]).is_err());
    }

    #[tokio::test]
    async fn channels_endpoint_returns_current_snapshot() {
        let ctx = BackendTestContext::new();
        ctx.add_file("Some_Channel", "clip.mp4", b"video");

        let response = ctx
            .send(Request::get("/api/channels").body(Body::empty()).unwrap())
            .await;
        assert_eq!(body_json(response).await, json!([]));

        ctx.rescan();
        let response = ctx
            .send(Request::get("/api/channels").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload[0]["id"], "some_channel");
        assert_eq!(payload[0]["videos"][0]["file"], "clip.mp4");
        assert_eq!(payload[0]["videos"][0]["uploadDate"], "Unknown");
    }

    #[tokio::test]
    async fn channel_lookup_and_stats() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "a.mp4", b"");
        ctx.add_file("chan", "b.webm", b"");
        ctx.rescan();

        let Json(channel) = get_channel(State(ctx.state.clone()), AxumPath("chan".into()))
            .await
            .unwrap();
        assert_eq!(channel.videos.len(), 2);

        let err = get_channel(State(ctx.state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(stats) = get_stats(State(ctx.state.clone())).await;
        assert_eq!(stats, LibraryStats { channels: 1, videos: 2 });
    }

    #[tokio::test]
    async fn rescan_endpoint_picks_up_new_files() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "a.mp4", b"");

        let response = ctx
            .send(Request::post("/api/rescan").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "channels": 1, "videos": 1 }));
        assert_eq!(ctx.state.library.total_videos(), 1);
    }

    #[tokio::test]
    async fn video_streams_support_ranges() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "clip.mp4", b"0123456789");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));
        let response = stream_video(
            State(ctx.state.clone()),
            AxumPath(("chan".into(), "clip.mp4".into())),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 2-5/10"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"2345");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=50-60"));
        let response = stream_video(
            State(ctx.state.clone()),
            AxumPath(("chan".into(), "clip.mp4".into())),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn sidecar_routes_serve_channel_files() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "clip.en.vtt", b"WEBVTT");
        ctx.add_file("chan", "clip.jpg", b"JPG");
        ctx.add_file("chan", "chan.png", b"PNG");

        for (uri, expected) in [
            ("/api/subtitle/chan/clip.en.vtt", &b"WEBVTT"[..]),
            ("/api/thumbnail/chan/clip.jpg", &b"JPG"[..]),
            ("/api/channel-avatar/chan/chan.png", &b"PNG"[..]),
        ] {
            let response = ctx.send(Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(body.as_ref(), expected);
        }

        let response = ctx
            .send(
                Request::get("/api/thumbnail/chan/missing.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn channel_files_reject_path_traversal() {
        let ctx = BackendTestContext::new();
        fs::write(ctx.media_root.join("secret.txt"), "nope").unwrap();

        for (channel, file) in [("chan", ".."), ("..", "secret.txt"), ("chan", "a/b")] {
            let err = download_thumbnail(
                State(ctx.state.clone()),
                AxumPath((channel.into(), file.into())),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn delete_removes_only_the_videos_files() {
        let ctx = BackendTestContext::new();
        for name in ["talk.mp4", "talk.en.vtt", "talk.info.json", "talk.jpg", "talk2.mp4"] {
            ctx.add_file("chan", name, b"");
        }
        ctx.rescan();
        ctx.state
            .user_data
            .save_position("chan", "talk", 60.0, None)
            .unwrap();

        let response = ctx
            .send(
                Request::delete("/api/video/chan/talk")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["success"], true);
        assert_eq!(
            payload["removed"],
            json!(["talk.en.vtt", "talk.info.json", "talk.jpg", "talk.mp4"])
        );

        assert!(ctx.media_root.join("chan/talk2.mp4").exists());
        let channel = ctx.state.library.find_channel("chan").unwrap();
        let ids: Vec<&str> = channel.videos.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["talk2"]);
        assert!(ctx.state.user_data.position("chan", "talk").is_none());
    }

    #[tokio::test]
    async fn delete_unknown_targets_is_not_found() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "talk.mp4", b"");
        ctx.rescan();

        let err = delete_video(
            State(ctx.state.clone()),
            AxumPath(("ghost".into(), "talk".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = delete_video(
            State(ctx.state.clone()),
            AxumPath(("chan".into(), "nothing".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(ctx.media_root.join("chan/talk.mp4").exists());
    }

    #[tokio::test]
    async fn delete_refuses_ids_that_are_not_videos() {
        let ctx = BackendTestContext::new();
        ctx.add_file("chan", "clip.mp4", b"");
        ctx.add_file("chan", "chan.png", b"PNG");
        ctx.rescan();
        assert_eq!(
            ctx.state.library.find_channel("chan").unwrap().avatar.as_deref(),
            Some("chan.png")
        );

        let err = delete_video(
            State(ctx.state.clone()),
            AxumPath(("chan".into(), "chan".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(ctx.media_root.join("chan/chan.png").exists());
        assert_eq!(
            ctx.state.library.find_channel("chan").unwrap().avatar.as_deref(),
            Some("chan.png")
        );
    }

    #[tokio::test]
    async fn history_and_deleted_round_trip() {
        let ctx = BackendTestContext::new();
        let entries = json!([
            { "videoId": "a", "videoTitle": "A" },
            { "videoId": "a", "videoTitle": "A again" },
            { "videoId": "b", "videoTitle": "B" },
        ]);

        let response = ctx
            .send(json_request(Method::POST, "/api/history", entries.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

        let response = ctx
            .send(Request::get("/api/history").body(Body::empty()).unwrap())
            .await;
        assert_eq!(body_json(response).await[0]["videoTitle"], "A");

        ctx.send(json_request(Method::POST, "/api/deleted", entries))
            .await;
        let Json(deleted) = get_deleted(State(ctx.state.clone())).await;
        assert_eq!(deleted.len(), 2);
    }

    #[tokio::test]
    async fn history_and_deleted_accept_put() {
        let ctx = BackendTestContext::new();
        for uri in ["/api/history", "/api/deleted"] {
            let response = ctx
                .send(json_request(
                    Method::PUT,
                    uri,
                    json!([{ "videoId": "x" }, { "videoId": "x" }]),
                ))
                .await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(body_json(response).await, json!([{ "videoId": "x" }]));
        }
        assert_eq!(ctx.state.user_data.history().len(), 1);
        assert_eq!(ctx.state.user_data.deleted().len(), 1);
    }

    #[tokio::test]
    async fn progress_reports_resume_point() {
        let ctx = BackendTestContext::new();

        let response = ctx
            .send(Request::get("/api/progress/chan/clip").body(Body::empty()).unwrap())
            .await;
        let payload = body_json(response).await;
        assert_eq!(payload["resumeAt"], 0.0);
        assert_eq!(payload["updatedAt"], Value::Null);

        let response = ctx
            .send(json_request(
                Method::PUT,
                "/api/progress/chan/clip",
                json!({ "seconds": 120.0, "duration": 600.0 }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = ctx
            .send(Request::get("/api/progress/chan/clip").body(Body::empty()).unwrap())
            .await;
        let payload = body_json(response).await;
        assert_eq!(payload["seconds"], 120.0);
        assert_eq!(payload["resumeAt"], 120.0);

        ctx.send(json_request(
            Method::PUT,
            "/api/progress/chan/clip",
            json!({ "seconds": 598.0, "duration": 600.0 }),
        ))
        .await;
        let response = ctx
            .send(Request::get("/api/progress/chan/clip").body(Body::empty()).unwrap())
            .await;
        assert_eq!(body_json(response).await["resumeAt"], 0.0);
    }

    #[tokio::test]
    async fn static_fallback_serves_spa() {
        let ctx = BackendTestContext::new();
        fs::write(ctx.www_root.join("app.js"), "console.log(1)").unwrap();

        let response = ctx
            .send(Request::get("/channels/some").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<html>app</html>");

        let response = ctx
            .send(Request::get("/app.js").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = ctx
            .send(Request::get("/missing.css").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ctx
            .send(Request::get("/api/nope").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "endpoint not found");
    }

    #[tokio::test]
    async fn static_fallback_without_frontend_is_not_found() {
        let mut ctx = BackendTestContext::new();
        ctx.state.www_root = None;
        let response = ctx
            .send(Request::get("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn parse_range_header_variants() {
        let parse = |raw: &'static str| parse_range_header(&HeaderValue::from_static(raw), 100);
        assert_eq!(parse("bytes=0-9"), Some((0, 9)));
        assert_eq!(parse("bytes=90-"), Some((90, 99)));
        assert_eq!(parse("bytes=-10"), Some((90, 99)));
        assert_eq!(parse("bytes=-500"), Some((0, 99)));
        assert_eq!(parse("bytes=9-0"), None);
        assert_eq!(parse("items=0-9"), None);
        assert_eq!(parse("bytes=-0"), None);
    }

    #[test]
    fn safe_segments_are_single_normal_components() {
        assert!(ensure_safe_path_segment("clip.mp4").is_ok());
        assert!(ensure_safe_path_segment("My Channel").is_ok());
        assert!(ensure_safe_path_segment("").is_err());
        assert!(ensure_safe_path_segment(".").is_err());
        assert!(ensure_safe_path_segment("..").is_err());
        assert!(ensure_safe_path_segment("a/b").is_err());
        assert!(ensure_safe_path_segment("/etc").is_err());
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"], "missing");
    }
}
