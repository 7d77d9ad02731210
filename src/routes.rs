use std::{collections::HashSet, path::Path, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use url::Url;

use crate::{
    config::non_empty,
    error::{ApiError, AppError},
    fetcher::HtmlFetcher,
    filename::build_content_disposition,
    locator::{DebugEntry, MediaLocator},
    post_url::{PostUrl, is_video_host},
    ytdlp::YtDlp,
};

const VIDEO_CONTENT_TYPE: &str = "video/mp4";

#[derive(Clone)]
pub struct AppState {
    pub locator: MediaLocator,
    pub fetcher: HtmlFetcher,
    pub ytdlp: Arc<YtDlp>,
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    url: Option<String>,
}

impl UrlQuery {
    fn required(&self, usage: &str) -> Result<&str, ApiError> {
        self.url
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| ApiError::bad_request(usage))
    }
}

pub fn build_router(state: AppState, public_dir: &Path, cors: Option<CorsLayer>) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/download", get(download))
        .route("/download-youtube", get(download_youtube))
        .route("/debug", get(debug_probe))
        .fallback_service(ServeDir::new(public_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Response, ApiError> {
    let url = query.required("Faltou o parâmetro ?url=")?;

    if is_video_host(url) {
        let location = format!("/download-youtube?url={}", urlencoding::encode(url));
        info!("redirecting {url} to the yt-dlp path");
        return Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response());
    }

    let post = PostUrl::parse(url).map_err(logged("/download"))?;
    let media_url = state
        .locator
        .locate(&post)
        .await
        .map_err(logged("/download"))?
        .ok_or_else(|| logged("/download")(AppError::MediaNotFound(post.as_str().to_string())))?;

    let upstream = state
        .fetcher
        .open_media(&media_url)
        .await
        .map_err(logged("/download"))?;
    let content_length = upstream.content_length();

    let headers = download_headers(&format!("{}.mp4", post.download_stem()), content_length)?;
    Ok((headers, Body::from_stream(upstream.bytes_stream())).into_response())
}

async fn download_youtube(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Response, ApiError> {
    let url = query.required("Use /download-youtube?url=<link do YouTube>")?;

    let download = state.ytdlp.run(url).await.map_err(logged("/download-youtube"))?;

    let headers = download_headers(&download.filename, download.content_length)?;
    Ok((headers, download.body).into_response())
}

async fn debug_probe(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Response, ApiError> {
    let url = query.required("Use /debug?url=<link>")?;
    let post = PostUrl::parse(url).map_err(logged("/debug"))?;

    let report: Vec<DebugEntry> = state.locator.probe(&post).await.map_err(|error| {
        error!("/debug failed for {url}: {error}");
        ApiError::internal("Erro no debug.")
    })?;

    let body = serde_json::to_string_pretty(&report)
        .map_err(|error| ApiError::internal(format!("Erro no debug: {error}")))?;
    Ok((
        [(CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response())
}

fn logged(route: &'static str) -> impl Fn(AppError) -> ApiError {
    move |error| {
        match &error {
            AppError::InvalidInput(_) | AppError::MediaNotFound(_) => {
                warn!("{route}: {error}");
            }
            _ => error!("{route} failed: {error}"),
        }
        ApiError::from(error)
    }
}

fn download_headers(filename: &str, content_length: Option<u64>) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(VIDEO_CONTENT_TYPE));
    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Não foi possível criar o cabeçalho de download."))?,
    );
    Ok(headers)
}

/// CORS for a front-end served from elsewhere. Without configured origins the
/// bundled static page is same-origin and no layer is needed.
pub fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, AppError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let allowed_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                AppError::Config(format!(
                    "invalid origin in ALLOWED_ORIGINS: {origin}; expected values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed_origins.contains(&value))
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
