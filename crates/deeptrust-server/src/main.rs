//! The edge HTTP handler: accepts a base64 media payload, runs the
//! analysis pipeline, and maps engine failures onto the response status
//! contract (400 invalid input, 402/429 upstream passthrough, 500
//! otherwise).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use deeptrust_contracts::schema::{AnalysisResult, MediaType};
use deeptrust_engine::{
    is_missing_credential, upstream_status, AnalysisEngine, AnalysisRequest, EngineOptions,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "deeptrust-server", version, about = "DeepTrust analysis edge service")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen_addr: String,
    /// Provider to analyze with; defaults to whichever one has a key
    /// configured, falling back to the offline dryrun provider.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Receipts and the audit trail are written here when set.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Result cache file; omit to disable caching.
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    log_to_stderr: bool,
}

/// The engine is shared, not serialized: `analyze` takes `&self`, so a
/// slow upstream call on one request never blocks the others.
#[derive(Clone)]
struct AppState {
    engine: Arc<AnalysisEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr);

    info!(listen_addr = %args.listen_addr, "deeptrust server starting");
    let engine = AnalysisEngine::new(EngineOptions {
        out_dir: args.out_dir.clone(),
        cache_path: args.cache.clone(),
        default_provider: args.provider.clone(),
        default_model: args.model.clone(),
        ..EngineOptions::default()
    });
    let state = AppState {
        engine: Arc::new(engine),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request));

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "deeptrust server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;
    info!("deeptrust server shutting down");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeBody {
    #[serde(default, alias = "mediaBase64")]
    image_base64: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ErrorBody {
    error: String,
}

async fn analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<AnalysisResult>, (StatusCode, Json<ErrorBody>)> {
    let request = validate_body(body).map_err(|message| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: message }),
        )
    })?;

    let media_type = request.media_type;
    let engine = Arc::clone(&state.engine);
    let outcome = tokio::task::spawn_blocking(move || engine.analyze(&request))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "analysis task panicked");
            internal_error_tuple()
        })?;

    match outcome {
        Ok(result) => {
            tracing::info!(
                media_type = %media_type.as_str(),
                trust_score = result.trust_score,
                cached = result.cached,
                "analysis served"
            );
            Ok(Json(result))
        }
        Err(err) => {
            tracing::warn!(error = format!("{err:#}"), "analysis failed");
            Err(error_response(&err))
        }
    }
}

fn validate_body(body: AnalyzeBody) -> Result<AnalysisRequest, String> {
    let media_base64 = body
        .image_base64
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "imageBase64 is required".to_string())?;
    let media_type = match body.media_type.as_deref() {
        None => MediaType::Image,
        Some(raw) => MediaType::parse(raw)
            .ok_or_else(|| "mediaType must be one of image, video, audio".to_string())?,
    };
    Ok(AnalysisRequest {
        media_base64,
        media_type,
        provider: body.provider,
        model: body.model,
    })
}

fn error_response(err: &anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    if let Some(status) = upstream_status(err) {
        match status {
            429 => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody {
                        error: "upstream rate limit exceeded, try again shortly".to_string(),
                    }),
                )
            }
            402 => {
                return (
                    StatusCode::PAYMENT_REQUIRED,
                    Json(ErrorBody {
                        error: "upstream quota exhausted".to_string(),
                    }),
                )
            }
            _ => return internal_error_tuple(),
        }
    }
    if is_missing_credential(err) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "server is not configured with an API key".to_string(),
            }),
        );
    }
    internal_error_tuple()
}

fn internal_error_tuple() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "analysis failed".to_string(),
        }),
    )
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    let status = response.status();
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        "http request"
    );
    response
}

fn init_tracing(log_to_stderr: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
