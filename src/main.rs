use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use reqwest::header::{ACCEPT, REFERER, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpListener, time::Duration};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_MAX_FILE_SIZE_MB: u64 = 80;
const DEFAULT_FILE_TTL_MINUTES: u64 = 30;
const SWEEP_INTERVAL_SECONDS: u64 = 10 * 60;
const RESOLVE_TIMEOUT_SECONDS: u64 = 15;
const DOWNLOAD_TIMEOUT_SECONDS: u64 = 30;
const CLEAN_TITLE_MAX_CHARS: usize = 50;

const ALLOWED_HOST_SUFFIXES: [&str; 2] = ["tiktok.com", "vm.tiktok.com"];
const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const TIKTOK_REFERER: &str = "https://www.tiktok.com/";
const DEFAULT_TITLE: &str = "TikTok Video";
const DEFAULT_AUTHOR: &str = "unknown";
const GENERIC_CONVERT_ERROR: &str =
    "Failed to convert the video. Please try again in a moment.";

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    providers: Arc<Vec<Box<dyn Provider>>>,
    http_client: reqwest::Client,
}

struct AppConfig {
    download_dir: PathBuf,
    max_file_bytes: u64,
    file_ttl: Duration,
    delete_after_download: bool,
}

impl AppConfig {
    fn from_env(root: &Path) -> Self {
        let max_file_size_mb = read_u64_env("MAX_FILE_SIZE_MB")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB);
        let file_ttl_minutes = read_u64_env("FILE_TTL_MINUTES")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_FILE_TTL_MINUTES);
        let delete_after_download = read_bool_env("DELETE_AFTER_DOWNLOAD").unwrap_or(true);
        let download_dir = std::env::var("DOWNLOAD_DIR")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| root.join("downloads"));

        Self {
            download_dir,
            max_file_bytes: max_file_size_mb * 1024 * 1024,
            file_ttl: Duration::from_secs(file_ttl_minutes * 60),
            delete_after_download,
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("extraction service unreachable: {0}")]
    ProviderUnavailable(String),
    #[error("extraction response could not be used: {0}")]
    ParseFailed(String),
    #[error("all extraction services failed: {0}")]
    ResolutionFailed(String),
    #[error("media size exceeds the configured maximum")]
    SizeExceeded,
    #[error("media download failed: {0}")]
    DownloadFailed(String),
    #[error("could not write the media file: {0}")]
    WriteFailed(String),
    #[error("file not found")]
    NotFound,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

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
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// User-facing responses never carry internal diagnostics; those stay in the logs.
impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::InvalidInput(message) => ApiError::bad_request(message),
            FetchError::NotFound => ApiError::not_found("File not found."),
            FetchError::ProviderUnavailable(_)
            | FetchError::ParseFailed(_)
            | FetchError::ResolutionFailed(_)
            | FetchError::SizeExceeded
            | FetchError::DownloadFailed(_)
            | FetchError::WriteFailed(_) => ApiError::internal(GENERIC_CONVERT_ERROR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum Quality {
    Standard,
    #[serde(rename = "HD")]
    Hd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Resolution {
    media_url: String,
    title: String,
    author: String,
    quality: Quality,
}

#[derive(Debug, Deserialize)]
struct ConvertRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConvertResponse {
    success: bool,
    file_name: String,
    download_url: String,
    title: String,
    author: String,
    quality: Quality,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    success: bool,
    message: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tikfetch=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let config = Arc::new(AppConfig::from_env(&root));

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the downloads directory: {error}"))
        })?;

    let http_client = reqwest::Client::builder()
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

    spawn_retention_sweep(config.download_dir.clone(), config.file_ttl);

    let state = AppState {
        config,
        providers: Arc::new(default_providers()),
        http_client,
    };
    let app = build_router(state)?;

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("tikfetch listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_router(state: AppState) -> Result<Router, ApiError> {
    let mut app = Router::new()
        .route("/api/health", get(health))
        .route("/api/convert", post(convert))
        .route("/downloads/{file_name}", get(serve_download))
        .route("/api/cleanup/{file_name}", delete(cleanup_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = build_cors_layer()? {
        app = app.layer(cors);
    }

    Ok(app)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn convert(
    State(state): State<AppState>,
    Json(payload): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, ApiError> {
    let url = payload.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(ApiError::bad_request("A video URL is required."));
    }
    if !is_valid_source_url(url) {
        return Err(ApiError::bad_request("Enter a valid TikTok URL."));
    }

    info!("conversion requested for {url}");

    let resolution = resolve(&state.http_client, &state.providers, url)
        .await
        .map_err(|err| {
            error!("resolution failed for {url}: {err}");
            ApiError::from(err)
        })?;

    let file_name = generate_file_name(&resolution.title);
    download(
        &state.http_client,
        &state.config,
        &resolution.media_url,
        &file_name,
    )
    .await
    .map_err(|err| {
        error!("download failed for {url}: {err}");
        ApiError::from(err)
    })?;

    info!(
        "conversion finished: {file_name} (quality {:?})",
        resolution.quality
    );

    Ok(Json(ConvertResponse {
        success: true,
        download_url: format!("/downloads/{file_name}"),
        file_name,
        title: resolution.title,
        author: resolution.author,
        quality: resolution.quality,
    }))
}

async fn serve_download(
    State(state): State<AppState>,
    UrlPath(file_name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let path = safe_download_path(&state.config.download_dir, &file_name)?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(FetchError::NotFound.into());
        }
        Err(err) => {
            warn!("could not open {:?}: {err}", path);
            return Err(ApiError::internal("Could not read the requested file."));
        }
    };

    let metadata = file.metadata().await.map_err(|err| {
        warn!("could not stat {:?}: {err}", path);
        ApiError::internal("Could not read the requested file.")
    })?;

    if state.config.delete_after_download {
        // Unlink now; the open handle keeps the bytes available for this stream.
        if let Err(err) = tokio::fs::remove_file(&path).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!("could not remove served file {:?}: {err}", path);
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&file_name))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn cleanup_file(
    State(state): State<AppState>,
    UrlPath(file_name): UrlPath<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let path = safe_download_path(&state.config.download_dir, &file_name)?;

    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!("deleted {file_name} on request");
            Ok(Json(CleanupResponse {
                success: true,
                message: "File deleted.".to_string(),
            }))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Err(FetchError::NotFound.into()),
        Err(err) => {
            warn!("could not delete {:?}: {err}", path);
            Err(ApiError::internal("Could not delete the file."))
        }
    }
}

fn is_valid_source_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    ALLOWED_HOST_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full request URL for this service, with the source URL embedded.
    fn request_url(&self, source_url: &str) -> String;

    /// Extract the best-available media URL from a raw response body.
    fn parse(&self, body: &str) -> Result<Resolution, FetchError>;
}

fn default_providers() -> Vec<Box<dyn Provider>> {
    vec![
        Box::new(TikWm),
        Box::new(SssTik),
        Box::new(SnapTik),
        Box::new(TiklyDown),
    ]
}

async fn resolve(
    client: &reqwest::Client,
    providers: &[Box<dyn Provider>],
    source_url: &str,
) -> Result<Resolution, FetchError> {
    let mut last_error: Option<String> = None;

    for provider in providers {
        debug!("trying provider {}", provider.name());
        match attempt_provider(client, provider.as_ref(), source_url).await {
            Ok(resolution) => {
                info!(
                    "provider {} resolved the video (quality {:?})",
                    provider.name(),
                    resolution.quality
                );
                return Ok(resolution);
            }
            Err(err) => {
                warn!("provider {} failed: {err}", provider.name());
                last_error = Some(err.to_string());
            }
        }
    }

    Err(FetchError::ResolutionFailed(last_error.unwrap_or_else(
        || "all extraction services are unavailable".to_string(),
    )))
}

async fn attempt_provider(
    client: &reqwest::Client,
    provider: &dyn Provider,
    source_url: &str,
) -> Result<Resolution, FetchError> {
    let response = client
        .get(provider.request_url(source_url))
        .header(USER_AGENT, DESKTOP_USER_AGENT)
        .header(ACCEPT, "application/json")
        .header(REFERER, TIKTOK_REFERER)
        .timeout(Duration::from_secs(RESOLVE_TIMEOUT_SECONDS))
        .send()
        .await
        .map_err(|err| FetchError::ProviderUnavailable(err.to_string()))?
        .error_for_status()
        .map_err(|err| FetchError::ProviderUnavailable(err.to_string()))?;

    let body = response
        .text()
        .await
        .map_err(|err| FetchError::ProviderUnavailable(err.to_string()))?;

    provider.parse(&body)
}

struct TikWm;

#[derive(Debug, Deserialize)]
struct TikwmResponse {
    code: i64,
    data: Option<TikwmData>,
}

#[derive(Debug, Deserialize)]
struct TikwmData {
    hdplay: Option<String>,
    play: Option<String>,
    wmplay: Option<String>,
    title: Option<String>,
    author: Option<TikwmAuthor>,
}

#[derive(Debug, Deserialize)]
struct TikwmAuthor {
    unique_id: Option<String>,
}

impl Provider for TikWm {
    fn name(&self) -> &'static str {
        "TikWM"
    }

    fn request_url(&self, source_url: &str) -> String {
        format!(
            "https://www.tikwm.com/api/?url={}&hd=1",
            urlencoding::encode(source_url)
        )
    }

    fn parse(&self, body: &str) -> Result<Resolution, FetchError> {
        let response: TikwmResponse =
            serde_json::from_str(body).map_err(|err| FetchError::ParseFailed(err.to_string()))?;

        let data = match (response.code, response.data) {
            (0, Some(data)) => data,
            _ => {
                return Err(FetchError::ParseFailed(
                    "TikWM reported no usable data".to_string(),
                ));
            }
        };

        // hdplay is the no-watermark HD rendition, wmplay the watermarked fallback.
        let (media_url, quality) = if let Some(url) = present(&data.hdplay) {
            (url, Quality::Hd)
        } else if let Some(url) = present(&data.play) {
            (url, Quality::Standard)
        } else if let Some(url) = present(&data.wmplay) {
            (url, Quality::Standard)
        } else {
            return Err(FetchError::ParseFailed(
                "TikWM response had no media URL".to_string(),
            ));
        };

        let author = data
            .author
            .and_then(|author| present(&author.unique_id))
            .unwrap_or_else(|| DEFAULT_AUTHOR.to_string());

        Ok(Resolution {
            media_url,
            title: present(&data.title).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            author,
            quality,
        })
    }
}

struct SssTik;

#[derive(Debug, Deserialize)]
struct SsstikResponse {
    code: i64,
    data: Option<SsstikData>,
}

#[derive(Debug, Deserialize)]
struct SsstikData {
    play: Option<String>,
    title: Option<String>,
    author: Option<String>,
}

impl Provider for SssTik {
    fn name(&self) -> &'static str {
        "SSSTik"
    }

    fn request_url(&self, source_url: &str) -> String {
        format!(
            "https://ssstik.io/abc?url={}",
            urlencoding::encode(source_url)
        )
    }

    fn parse(&self, body: &str) -> Result<Resolution, FetchError> {
        let response: SsstikResponse =
            serde_json::from_str(body).map_err(|err| FetchError::ParseFailed(err.to_string()))?;

        let data = match (response.code, response.data) {
            (200, Some(data)) => data,
            _ => {
                return Err(FetchError::ParseFailed(
                    "SSSTik reported no usable data".to_string(),
                ));
            }
        };

        let Some(media_url) = present(&data.play) else {
            return Err(FetchError::ParseFailed(
                "SSSTik response had no media URL".to_string(),
            ));
        };

        Ok(Resolution {
            media_url,
            title: present(&data.title).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            author: present(&data.author).unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            quality: Quality::Hd,
        })
    }
}

struct SnapTik;

#[derive(Debug, Deserialize)]
struct SnaptikResponse {
    status: Option<String>,
    data: Option<SnaptikData>,
}

#[derive(Debug, Deserialize)]
struct SnaptikData {
    hd_video_url: Option<String>,
    video_url: Option<String>,
    title: Option<String>,
    author: Option<String>,
}

impl Provider for SnapTik {
    fn name(&self) -> &'static str {
        "SnapTik"
    }

    fn request_url(&self, source_url: &str) -> String {
        format!(
            "https://snaptik.app/abc2.php?url={}",
            urlencoding::encode(source_url)
        )
    }

    fn parse(&self, body: &str) -> Result<Resolution, FetchError> {
        let response: SnaptikResponse =
            serde_json::from_str(body).map_err(|err| FetchError::ParseFailed(err.to_string()))?;

        let data = match (response.status.as_deref(), response.data) {
            (Some("success"), Some(data)) => data,
            _ => {
                return Err(FetchError::ParseFailed(
                    "SnapTik reported no usable data".to_string(),
                ));
            }
        };

        let (media_url, quality) = if let Some(url) = present(&data.hd_video_url) {
            (url, Quality::Hd)
        } else if let Some(url) = present(&data.video_url) {
            (url, Quality::Standard)
        } else {
            return Err(FetchError::ParseFailed(
                "SnapTik response had no media URL".to_string(),
            ));
        };

        Ok(Resolution {
            media_url,
            title: present(&data.title).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            author: present(&data.author).unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            quality,
        })
    }
}

struct TiklyDown;

#[derive(Debug, Deserialize)]
struct TiklydownResponse {
    title: Option<String>,
    author: Option<TiklydownAuthor>,
    video: Option<TiklydownVideo>,
}

#[derive(Debug, Deserialize)]
struct TiklydownAuthor {
    unique_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TiklydownVideo {
    #[serde(rename = "noWatermarkHD")]
    no_watermark_hd: Option<String>,
    #[serde(rename = "noWatermark")]
    no_watermark: Option<String>,
    watermark: Option<String>,
}

impl Provider for TiklyDown {
    fn name(&self) -> &'static str {
        "TiklyDown"
    }

    fn request_url(&self, source_url: &str) -> String {
        format!(
            "https://api.tiklydown.eu.org/api/download?url={}",
            urlencoding::encode(source_url)
        )
    }

    fn parse(&self, body: &str) -> Result<Resolution, FetchError> {
        let response: TiklydownResponse =
            serde_json::from_str(body).map_err(|err| FetchError::ParseFailed(err.to_string()))?;

        let Some(video) = response.video else {
            return Err(FetchError::ParseFailed(
                "TiklyDown reported no video object".to_string(),
            ));
        };

        let (media_url, quality) = if let Some(url) = present(&video.no_watermark_hd) {
            (url, Quality::Hd)
        } else if let Some(url) = present(&video.no_watermark) {
            (url, Quality::Standard)
        } else if let Some(url) = present(&video.watermark) {
            (url, Quality::Standard)
        } else {
            return Err(FetchError::ParseFailed(
                "TiklyDown response had no media URL".to_string(),
            ));
        };

        let author = response
            .author
            .and_then(|author| present(&author.unique_id))
            .unwrap_or_else(|| DEFAULT_AUTHOR.to_string());

        Ok(Resolution {
            media_url,
            title: present(&response.title).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            author,
            quality,
        })
    }
}

/// Streams `media_url` into the downloads directory, enforcing the byte budget
/// both against the declared length and against a running counter.
async fn download(
    client: &reqwest::Client,
    config: &AppConfig,
    media_url: &str,
    file_name: &str,
) -> Result<PathBuf, FetchError> {
    info!("downloading media from {media_url}");

    let mut response = client
        .get(media_url)
        .header(USER_AGENT, DESKTOP_USER_AGENT)
        .header(REFERER, TIKTOK_REFERER)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECONDS))
        .send()
        .await
        .map_err(|err| FetchError::DownloadFailed(err.to_string()))?
        .error_for_status()
        .map_err(|err| FetchError::DownloadFailed(err.to_string()))?;

    if let Some(declared) = response.content_length()
        && declared > config.max_file_bytes
    {
        return Err(FetchError::SizeExceeded);
    }

    // Extraction services are sloppy about content-type, so only warn.
    if let Some(content_type) = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        && !content_type.starts_with("video/")
    {
        warn!("unexpected content-type from media host: {content_type}");
    }

    let path = config.download_dir.join(file_name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| FetchError::WriteFailed(err.to_string()))?;
    let mut written: u64 = 0;

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                drop(file);
                remove_partial_file(&path).await;
                return Err(FetchError::DownloadFailed(err.to_string()));
            }
        };

        written += chunk.len() as u64;
        if written > config.max_file_bytes {
            drop(file);
            remove_partial_file(&path).await;
            return Err(FetchError::SizeExceeded);
        }

        if let Err(err) = file.write_all(&chunk).await {
            drop(file);
            remove_partial_file(&path).await;
            return Err(FetchError::WriteFailed(err.to_string()));
        }
    }

    if let Err(err) = file.flush().await {
        drop(file);
        remove_partial_file(&path).await;
        return Err(FetchError::WriteFailed(err.to_string()));
    }

    info!("download complete: {file_name} ({written} bytes)");
    Ok(path)
}

async fn remove_partial_file(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!("could not remove partial file {:?}: {err}", path);
    }
}

fn generate_file_name(title: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let random_id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}_{timestamp}_{random_id}.mp4", clean_title(title))
}

fn clean_title(title: &str) -> String {
    let mut cleaned = String::new();
    let mut in_whitespace = false;

    for character in title.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '_' | '-') {
            if in_whitespace {
                cleaned.push('_');
                in_whitespace = false;
            }
            cleaned.push(character);
        } else if character.is_whitespace() {
            in_whitespace = true;
        }
    }
    if in_whitespace {
        cleaned.push('_');
    }

    cleaned.truncate(CLEAN_TITLE_MAX_CHARS);

    if cleaned.is_empty() {
        "tiktok_video".to_string()
    } else {
        cleaned
    }
}

fn safe_download_path(download_dir: &Path, file_name: &str) -> Result<PathBuf, FetchError> {
    let trimmed = file_name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(FetchError::InvalidInput("Invalid file name.".to_string()));
    }

    let path = download_dir.join(trimmed);
    if !path.starts_with(download_dir) {
        return Err(FetchError::InvalidInput("Invalid file name.".to_string()));
    }

    Ok(path)
}

fn spawn_retention_sweep(download_dir: PathBuf, ttl: Duration) {
    tokio::spawn(async move {
        // The first tick fires immediately, which doubles as the startup sweep.
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECONDS));
        loop {
            ticker.tick().await;
            sweep_expired_files(&download_dir, ttl).await;
        }
    });
}

async fn sweep_expired_files(download_dir: &Path, ttl: Duration) {
    let mut entries = match tokio::fs::read_dir(download_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!("could not open downloads directory for sweep: {err}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("could not iterate downloads directory: {err}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("could not read metadata of {:?}: {err}", path);
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(err) => {
                warn!("could not read modification time of {:?}: {err}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age <= ttl {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("removed expired file {:?}", path),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove expired file {:?}: {err}", path),
        }
    }
}

fn build_cors_layer() -> Result<Option<CorsLayer>, ApiError> {
    let configured = match std::env::var("ALLOWED_ORIGINS") {
        Ok(value) => value,
        // Unset means same-origin only: no CORS layer at all.
        Err(_) => return Ok(None),
    };

    let origins = configured
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| {
                ApiError::internal(format!("Invalid origin in ALLOWED_ORIGINS: {origin}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if origins.is_empty() {
        return Ok(None);
    }

    info!("CORS allow-list loaded with {} origin(s)", origins.len());

    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([CONTENT_TYPE]),
    ))
}

fn build_content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{file_name}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
}
