//! HTTP API over the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/sessions` | Start a session, returns `{ "session_id": ... }` |
//! | `POST`   | `/sessions/{id}/ask` | Ask `{ "question": ... }`; returns the turn outcome |
//! | `GET`    | `/sessions/{id}/history` | Session transcript |
//! | `DELETE` | `/sessions/{id}` | End the session and discard its history |
//!
//! Sessions are started with `POST /sessions`; every other session route
//! answers 404 for an id the server does not know.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_argument", "message": "question must not be empty" } }
//! ```
//!
//! Codes are the engine's error codes plus `not_found`. A client that
//! disconnects mid-turn drops the turn; nothing is recorded for it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use hybrid_query_core::error::EngineError;
use hybrid_query_core::history::Transcript;

use crate::config::Config;
use crate::engine::{build_engine, Engine, TurnOutcome};
use crate::session::CancellationToken;

/// Build the engine from config and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let (engine, schema) = build_engine(config).await?;
    let refresher = schema.spawn_refresher();

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("hybrid query server listening on http://{}", config.server.bind);
    tracing::info!(bind = %config.server.bind, "server started");

    let result = axum::serve(listener, router(Arc::new(engine))).await;
    refresher.abort();
    result?;
    Ok(())
}

/// The API routes with permissive CORS.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions", post(handle_create_session))
        .route("/sessions/{id}", axum::routing::delete(handle_end_session))
        .route("/sessions/{id}/ask", post(handle_ask))
        .route("/sessions/{id}/history", get(handle_history))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            EngineError::QueryRejected(_) | EngineError::QueryUnparseable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            EngineError::RetrievalUnavailable(_)
            | EngineError::EmbeddingUnavailable(_)
            | EngineError::GenerationUnavailable(_)
            | EngineError::SynthesisUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionCreated {
    session_id: String,
}

async fn handle_create_session(State(engine): State<Arc<Engine>>) -> (StatusCode, Json<SessionCreated>) {
    let session_id = engine.create_session();
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

async fn handle_end_session(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if engine.end_session(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no session with id: {}", id)))
    }
}

async fn handle_history(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<Transcript>, AppError> {
    engine
        .history(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("no session with id: {}", id)))
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    if engine.sessions().get(&id).is_none() {
        return Err(not_found(format!("no session with id: {}", id)));
    }
    let cancel = CancellationToken::new();
    let outcome = engine.ask(&id, &req.question, &cancel).await?;
    Ok(Json(outcome))
}
