//! Axum + Askama upload UI and marketplace relay.

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Serialize;
use slc_annotate::{LinkCheckPipeline, RunConfig, RunError, RESULTS_FILE_NAME};
use slc_checker::ApiBase;
use slc_core::RunSummary;
use slc_storage::HttpFetcher;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "slc-web";

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
const DEFAULT_RELAY_TARGET: &str = "https://shopee.vn";

/// Upstream the relay forwards `/api/shopee/*` to.
#[derive(Debug, Clone)]
pub struct RelayState {
    pub target: String,
    pub user_agent: String,
    pub client: reqwest::Client,
}

impl RelayState {
    pub fn new(target: impl Into<String>, user_agent: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            target: target.into().trim_end_matches('/').to_string(),
            user_agent: user_agent.into(),
            client,
        }
    }

    pub fn from_config(config: &RunConfig) -> anyhow::Result<Self> {
        let target =
            std::env::var("SLC_RELAY_TARGET").unwrap_or_else(|_| DEFAULT_RELAY_TARGET.to_string());
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(target, config.user_agent.clone(), fetcher.client().clone()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<LinkCheckPipeline>,
    pub relay: Arc<RelayState>,
    /// Parent of every per-upload run token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: LinkCheckPipeline, relay: RelayState) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            relay: Arc::new(relay),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &RunConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            LinkCheckPipeline::from_config(config)?,
            RelayState::from_config(config)?,
        ))
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    rate_min_ms: u128,
    rate_max_ms: u128,
    api_base: String,
    results_file_name: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct ProxyErrorBody {
    error: &'static str,
    details: String,
}

pub fn app(state: AppState) -> Router {
    let relay = state.relay.clone();
    Router::new()
        .route("/", get(index_handler))
        .route("/check", post(check_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .merge(relay_app(relay))
}

/// `/health` plus the relay, without the upload UI.
pub fn relay_app(relay: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/shopee/{*path}", any(relay_handler))
        .with_state(relay)
}

fn port_from_env(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| port_from_env("SLC_WEB_PORT", 8000));
    let state = AppState::from_config(&RunConfig::from_env())?;
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "upload ui listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

pub async fn serve_relay_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| port_from_env("SLC_RELAY_PORT", 3001));
    let relay = RelayState::from_config(&RunConfig::from_env())?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, target = %relay.target, "relay listening");
    axum::serve(listener, relay_app(Arc::new(relay)))
        .with_graceful_shutdown(shutdown_signal(CancellationToken::new()))
        .await?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, cancelling in-flight runs");
    token.cancel();
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let (min, max) = state.pipeline.limiter().window();
    let api_base = match &state.pipeline.checker().config().api_base {
        ApiBase::Marketplace => "https://shopee.{locale}".to_string(),
        ApiBase::Custom(base) => base.clone(),
    };
    render_html(IndexTemplate {
        rate_min_ms: min.as_millis(),
        rate_max_ms: max.as_millis(),
        api_base,
        results_file_name: RESULTS_FILE_NAME,
    })
}

async fn check_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes);
                    break;
                }
                Err(err) => return bad_request(err.body_text()),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => return bad_request(err.body_text()),
        }
    }

    let Some(bytes) = upload.filter(|b| !b.is_empty()) else {
        return bad_request("multipart field `file` with an .xlsx workbook is required".to_string());
    };

    info!(bytes = bytes.len(), "workbook uploaded");
    match state
        .pipeline
        .run_workbook(&bytes, state.shutdown.child_token())
        .await
    {
        Ok(output) => workbook_response(output.workbook, &output.summary),
        Err(RunError::DocumentParse(err)) => {
            warn!(error = %err, "rejected upload");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Could not read the uploaded file as an .xlsx workbook: {err}"),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "link check run failed");
            server_error(anyhow::Error::new(err))
        }
    }
}

fn workbook_response(workbook: Vec<u8>, summary: &RunSummary) -> Response {
    let mut response = (StatusCode::OK, workbook).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(XLSX_CONTENT_TYPE));
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{RESULTS_FILE_NAME}\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    let counts = [
        ("x-slc-run-id", summary.run_id.to_string()),
        ("x-slc-total-rows", summary.total_rows.to_string()),
        ("x-slc-marketplace-links", summary.marketplace_links.to_string()),
        ("x-slc-live-links", summary.live_links.to_string()),
        ("x-slc-missing-links", summary.missing_links.to_string()),
    ];
    for (name, value) in counts {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        message: "relay is running",
    })
}

async fn relay_handler(
    State(relay): State<Arc<RelayState>>,
    AxumPath(path): AxumPath<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut target = format!("{}/{}", relay.target, path.trim_start_matches('/'));
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut request = relay
        .client
        .request(method, &target)
        .header(header::USER_AGENT, relay.user_agent.as_str())
        .header(header::ACCEPT, "*/*")
        .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
        .header("X-Shopee-Language", "en")
        .header("X-Requested-With", "XMLHttpRequest")
        .header("X-API-SOURCE", "pc")
        .header(header::PRAGMA, "no-cache")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        request = request.header(header::CONTENT_TYPE, content_type.clone());
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => return proxy_error(&target, err),
    };
    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = (status, bytes).into_response();
            if let Some(content_type) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(err) => proxy_error(&target, err),
    }
}

fn proxy_error(target: &str, err: reqwest::Error) -> Response {
    error!(url = target, error = %err, "relay request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ProxyErrorBody {
            error: "Proxy error",
            details: err.to_string(),
        }),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
