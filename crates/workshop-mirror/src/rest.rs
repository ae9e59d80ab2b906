//! HTTP surface of the mirror.
//!
//! Archive downloads are served by the [`AcquisitionPipeline`]; every
//! mirrored browsing prefix is forwarded through [`Upstream`]. A few
//! upstream sections that cannot work through a mirror get a fixed stub.

use crate::acquisition::pipeline::{AcquisitionPipeline, Archive};
use crate::acquisition::ContentIdentifier;
use crate::error::{MirrorError, MirrorResult};
use crate::proxy::Upstream;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Path prefixes forwarded to the upstream site.
pub const PROXY_PREFIXES: &[&str] = &["workshop", "app", "public", "sharedfiles"];

/// Upstream sections that need a real session and are not mirrored.
pub const UNSUPPORTED_PREFIXES: &[&str] =
    &["market", "discussions", "my", "id", "account", "profiles"];

/// Characters left unescaped in an RFC 5987 `filename*` value.
const FILENAME_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

pub struct AppState {
    pub pipeline: AcquisitionPipeline,
    pub upstream: Upstream,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

/// Build the axum Router with every route of the mirror.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(root_redirect))
        .route("/health", get(health))
        .route("/api/workshop/:app_id/:item_id", get(download_item))
        .route(
            "/api/collection/:app_id/:collection_id",
            get(download_collection),
        )
        .route("/login/home/", get(cross_login));

    for prefix in UNSUPPORTED_PREFIXES {
        router = router
            .route(&format!("/{prefix}/"), get(unsupported))
            .route(&format!("/{prefix}/*rest"), get(unsupported));
    }
    for prefix in PROXY_PREFIXES {
        router = router
            .route(&format!("/{prefix}/"), any(proxy))
            .route(&format!("/{prefix}/*path"), any(proxy));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until Ctrl-C, then finish in-flight requests and return.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mirror listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

fn parse_id(field: &'static str, raw: &str) -> MirrorResult<u64> {
    raw.parse().map_err(|_| MirrorError::Validation {
        field,
        value: raw.to_string(),
    })
}

/// `attachment` disposition with an ASCII fallback and a UTF-8 `filename*`.
pub fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if ascii == file_name {
        format!("attachment; filename=\"{ascii}\"")
    } else {
        format!(
            "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
            utf8_percent_encode(file_name, FILENAME_SAFE)
        )
    }
}

/// Stream a built archive from disk as an attachment.
async fn send_archive(archive: Archive) -> MirrorResult<Response> {
    let file = tokio::fs::File::open(&archive.path).await?;
    let len = file.metadata().await?.len();
    let disposition = HeaderValue::from_str(&content_disposition(&archive.file_name))
        .map_err(std::io::Error::other)?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

// ── Handlers ────────────────────────────────────────────────────

async fn download_item(
    State(state): State<Arc<AppState>>,
    Path((app_id, item_id)): Path<(String, String)>,
) -> MirrorResult<Response> {
    let app_id = parse_id("App ID", &app_id)?;
    let item_id = parse_id("Workshop ID", &item_id)?;
    let archive = state
        .pipeline
        .item(ContentIdentifier::new(app_id, item_id))
        .await?;
    send_archive(archive).await
}

async fn download_collection(
    State(state): State<Arc<AppState>>,
    Path((app_id, collection_id)): Path<(String, String)>,
) -> MirrorResult<Response> {
    let app_id = parse_id("App ID", &app_id)?;
    let collection_id = parse_id("Collection ID", &collection_id)?;
    let archive = state.pipeline.collection(app_id, collection_id).await?;
    send_archive(archive).await
}

async fn proxy(State(state): State<Arc<AppState>>, req: Request) -> MirrorResult<Response> {
    state.upstream.forward(req).await
}

async fn root_redirect() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/workshop/")],
    )
}

async fn cross_login() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Html("Cross login is not allowed. <a href='/'>Back</a>"),
    )
}

async fn unsupported() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Html("We don't support this page. <a href='/'>Back</a>"),
    )
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
