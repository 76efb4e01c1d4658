//! Invoice OCR API Server
//!
//! REST API that accepts invoice uploads (PDF/image) and returns structured
//! invoice data extracted by the cloud parsing service.
//! Uses the shared invoice_ocr_rs library for all processing logic.

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use invoice_ocr_rs::{
    config::AppConfig,
    dispatch::{Dispatcher, HttpTransport},
    error::Error,
    multipart::{self, RequestContext, UploadedFile},
    workflow::Workflow,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

struct AppState {
    workflow: Workflow<HttpTransport>,
    dev_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let api_key = config.api_key.clone();
    let has_api_key = api_key.is_some();

    let transport = HttpTransport::new(config.service.clone())?;
    let dispatcher = Dispatcher::new(transport, &config.service);
    let workflow = Workflow::new(dispatcher, config.poll.clone(), config.max_concurrency);

    let state = Arc::new(AppState {
        workflow,
        dev_mode: config.dev_mode,
    });

    let app = build_router(state, api_key);

    println!("🚀 Invoice OCR API");
    println!("📡 Listening on http://{}/process-invoice", config.bind_addr);
    if has_api_key {
        println!("🔐 API Key authentication enabled");
    } else {
        println!("⚠️  No API_KEY set - running without authentication");
    }
    println!("\n⚙️  Configuration:");
    println!("   • Parse service: {}", config.service.base_url);
    println!(
        "   • Fallback address: {}",
        config
            .service
            .fallback_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("   • Max concurrency: {}", config.max_concurrency);
    println!(
        "   • Poll: every {:?}, up to {} attempts",
        config.poll.interval, config.poll.max_attempts
    );
    println!("📝 POST your invoices here!");

    let listener = TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, api_key: Option<String>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(
            "/process-invoice",
            post(process_invoice).options(preflight_ok),
        )
        .route("/health", get(health_check))
        .layer(middleware::from_fn(move |req, next| {
            let key = api_key.clone();
            api_key_middleware(req, next, key)
        }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cross-origin preflights are answered by the CORS layer; plain OPTIONS
/// probes (no Origin header) land here and get a 200 instead of a 405.
async fn preflight_ok() -> StatusCode {
    StatusCode::OK
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "llama_cloud_services": if std::env::var("LLAMA_CLOUD_API_KEY").is_ok() {
                "available"
            } else {
                "missing_api_key"
            }
        }
    }))
}

/// API key authentication middleware
async fn api_key_middleware(
    req: Request,
    next: Next,
    expected_key: Option<String>,
) -> Result<Response, StatusCode> {
    // Skip auth for health check
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    // If no API key configured, allow all requests
    let Some(expected) = expected_key else {
        return Ok(next.run(req).await);
    };

    let provided_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());

    match provided_key {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// API handler for invoice processing. Accepts either a multipart body or a
/// JSON batch (`{ "files": [{ name, data, type }] }`).
async fn process_invoice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let files = match gather_files(&headers, &body) {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(error = %err.detailed_message(), stage = "extract", "rejecting request");
            return error_response(&err, state.dev_mode);
        }
    };

    if files.len() == 1 {
        let file = &files[0];
        match state.workflow.process(file).await {
            Ok(data) => Json(json!({
                "status": "success",
                "message": "Invoice processed successfully",
                "data": data,
            }))
            .into_response(),
            Err(err) => {
                tracing::error!(
                    filename = %file.filename,
                    stage = "dispatch",
                    error = %err.detailed_message(),
                    "invoice processing failed"
                );
                error_response(&err, state.dev_mode)
            }
        }
    } else {
        let report = state.workflow.process_batch(files).await;
        let status = report.status_code();
        let overall = if status == StatusCode::OK {
            "success"
        } else if status == StatusCode::MULTI_STATUS {
            "partial"
        } else {
            "error"
        };
        (
            status,
            Json(json!({
                "status": overall,
                "data": { "results": report.results },
            })),
        )
            .into_response()
    }
}

/// Decode the inbound body into files: JSON batch, multipart, or -- when no
/// boundary can be determined -- the lossy whole-body fallback.
fn gather_files(headers: &HeaderMap, body: &Bytes) -> invoice_ocr_rs::Result<Vec<UploadedFile>> {
    if body.is_empty() {
        return Err(Error::malformed("empty request body"));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let ctx = RequestContext::new(body.to_vec(), false, content_type)?;

    match ctx.content_type.as_deref() {
        Some(ct) if ct.to_ascii_lowercase().starts_with("application/json") => {
            multipart::decode_json_batch(&ctx.body)
        }
        Some(ct) if multipart::extract_boundary(ct).is_ok() => multipart::extract_files(&ctx),
        _ => {
            tracing::warn!("no multipart boundary, treating whole body as the upload (best effort)");
            Ok(vec![multipart::extract_file_lossy(&ctx)?])
        }
    }
}

fn error_response(err: &Error, dev_mode: bool) -> Response {
    let mut body = json!({
        "status": "error",
        "message": err.user_message(),
    });
    if dev_mode {
        body["detail"] = json!(err.detailed_message());
    }
    (err.status_code(), Json(body)).into_response()
}
