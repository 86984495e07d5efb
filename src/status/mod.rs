use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use crate::db::lifecycle::LifecycleState;
use crate::db::models::{ClosingOdds, LineObservation, MatchResult, StoredEvent, TickSummary};
use crate::db::Database;
use crate::error::TickError;

/// Consecutive failed ticks after which `/health` reports degraded.
const DEGRADED_AFTER: u32 = 3;
/// Consecutive failed ticks after which `/health` answers 503.
const UNAVAILABLE_AFTER: u32 = 10;

/// Latest loop health, shared between the pollers and the status server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Health {
    pub last_tick: Option<i64>,
    pub last_success: Option<i64>,
    pub last_summary: Option<TickSummary>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_ticks: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Health>>,
}

impl StatusBoard {
    pub async fn record_success(&self, summary: &TickSummary) {
        let mut h = self.inner.write().await;
        h.last_tick = Some(summary.tick);
        h.last_success = Some(summary.tick);
        h.last_summary = Some(summary.clone());
        h.consecutive_failures = 0;
        h.total_ticks += 1;
    }

    pub async fn record_failure(&self, err: &TickError) {
        let mut h = self.inner.write().await;
        h.last_tick = Some(err.tick);
        h.last_error = Some(err.to_string());
        h.consecutive_failures += 1;
        h.total_ticks += 1;
        h.total_failures += 1;
    }

    pub async fn snapshot(&self) -> Health {
        self.inner.read().await.clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub board: StatusBoard,
}

/// Build the status router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", get(events_handler))
        .route("/api/events/:id", get(event_detail_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.board.snapshot().await;
    let (status, code) = match health.consecutive_failures {
        n if n >= UNAVAILABLE_AFTER => ("failing", StatusCode::SERVICE_UNAVAILABLE),
        n if n >= DEGRADED_AFTER => ("degraded", StatusCode::OK),
        _ => ("ok", StatusCode::OK),
    };
    (
        code,
        Json(serde_json::json!({
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
            "health": health,
        })),
    )
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    state: Option<String>,
    limit: Option<i64>,
}

/// GET /api/events?state=active&limit=100
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let filter = q
        .state
        .as_deref()
        .map(str::parse::<LifecycleState>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let limit = q.limit.unwrap_or(200).clamp(1, 1000);
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || db.list_events(filter, limit))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// One event with its current odds, closing odds and result, if any.
#[derive(Debug, Serialize)]
struct EventDetail {
    event: StoredEvent,
    odds: Vec<LineObservation>,
    closing_odds: Vec<ClosingOdds>,
    history_rows: i64,
    result: Option<MatchResult>,
}

/// GET /api/events/:id
async fn event_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.clone();
    let detail = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<EventDetail>> {
        let Some(event) = db.get_event(match_id)? else {
            return Ok(None);
        };
        Ok(Some(EventDetail {
            event,
            odds: db.current_odds(match_id)?,
            closing_odds: db.closing_odds(match_id)?,
            history_rows: db.history_len(Some(match_id))?,
            result: db.match_result(match_id)?,
        }))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    detail
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("match {} not found", match_id)))
}
