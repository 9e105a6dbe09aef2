use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use askcampus::{init_tracing, ConfigArgs, GeneratedAnswer, RagError, RagPipeline};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "askcampus-api",
    about = "HTTP chat endpoint answering questions from the askcampus index"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "ASKCAMPUS_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Seconds a single /chat request may take end to end.
    #[arg(long, env = "ASKCAMPUS_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(alias = "message")]
    query: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    sources: Vec<ChatSource>,
}

#[derive(Debug, Serialize)]
struct ChatSource {
    score: f32,
    title: String,
    url: String,
}

impl From<GeneratedAnswer> for ChatResponse {
    fn from(answer: GeneratedAnswer) -> Self {
        Self {
            response: answer.answer,
            sources: answer
                .sources
                .into_iter()
                .map(|source| ChatSource {
                    score: source.score,
                    title: source.title,
                    url: source.url,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ApiCli::parse();
    let config = cli.config.build_config();
    let pipeline = RagPipeline::from_config(config)?;
    match pipeline.load() {
        Ok(()) => {}
        Err(RagError::IndexNotReady) => {
            warn!("no index has been built yet; /chat will fail until askcampus-index runs")
        }
        Err(err) => return Err(err).context("failed to load index"),
    }
    let state = AppState {
        pipeline: Arc::new(pipeline),
        request_timeout: Duration::from_secs(cli.request_timeout_secs.max(1)),
    };

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, "askcampus-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app(state))
        .await
        .context("server shutdown")?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/chat", post(chat_handler))
        .with_state(state)
}

async fn root() -> Json<StatusBody> {
    Json(StatusBody {
        status: "API is running",
    })
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorBody>)> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "query text must not be empty",
        ));
    }
    let pipeline = state.pipeline.clone();
    // The blocking task keeps running after a timeout; its result is dropped.
    let task = tokio::task::spawn_blocking(move || pipeline.answer(&query));
    let answer = match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(Ok(answer))) => answer,
        Ok(Ok(Err(err))) => {
            error!(error = %err, "chat request failed");
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
        }
        Ok(Err(join_err)) => {
            error!(error = %join_err, "answer task panicked");
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("answer task failed: {join_err}"),
            ));
        }
        Err(_) => {
            warn!(timeout_secs = state.request_timeout.as_secs(), "chat request timed out");
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request timed out",
            ));
        }
    };
    Ok(Json(ChatResponse::from(answer)))
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}
