use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Method;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    ApiError, BatchAnalysis, BatchRequest, BatchState, BatchStatus, BatchStatusReport,
    EngineConfig, ErrorCode, ProgressEvent, ShadowVectorProfile, SimulationResult, Speaker,
    Timeline, VulnerabilityAxis, SCHEMA_VERSION_V1,
};
use relational_core::profile::{shared_top_axes, validate_pair, validate_profile};
use relational_core::{
    BatchAnalyzer, BatchError, CancelHandle, ProfileError, ProgressSink,
    RelationalMonteCarloRunner,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{BatchOutcome, EngineApi, PersistedBatchSummary, PersistenceError};

const DEFAULT_LIST_LIMIT: usize = 200;
const MAX_LIST_LIMIT: usize = 5000;
const MAX_BATCH_SIZE: usize = 10_000;
const STREAM_CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_SQLITE_PATH: &str = "relational_runs.sqlite";

include!("error.rs");
include!("state.rs");
include!("routes/control.rs");
include!("routes/query.rs");
include!("routes/inspect.rs");
include!("routes/stream.rs");
include!("util.rs");

/// Serve the batch API on `addr`, persisting to `sqlite_path` or the default store.
pub async fn serve(
    addr: SocketAddr,
    config: EngineConfig,
    sqlite_path: Option<String>,
) -> Result<(), ServerError> {
    let sqlite_path = sqlite_path
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(default_sqlite_path);

    let mut engine = EngineApi::from_config(config)?;
    engine.attach_sqlite_store(&sqlite_path)?;
    let app = router(AppState::new(engine));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, sqlite = %sqlite_path, "server.listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/batches", post(create_batch).get(list_batches))
        .route(
            "/api/v1/batches/{batch_id}",
            get(get_batch_status).delete(delete_batch),
        )
        .route("/api/v1/batches/{batch_id}/result", get(get_batch_result))
        .route("/api/v1/batches/{batch_id}/analysis", get(get_batch_analysis))
        .route("/api/v1/batches/{batch_id}/cancel", post(cancel_batch))
        .route(
            "/api/v1/batches/{batch_id}/timelines/{index}",
            get(get_timeline),
        )
        .route("/api/v1/batches/{batch_id}/stream", get(stream_batch))
        .route("/api/v1/profiles/validate", post(validate_profiles))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests;
