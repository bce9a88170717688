// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Five endpoints, all under no path prefix: status, start, stop, a config
// patch, and a paginated history read. No auth middleware — the control
// surface is assumed to sit behind a private network boundary, not a
// public one; no bearer-token extractor carries over from the prior
// iteration of this surface.
// Every response is the same `{success, message?, data?}` envelope.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::engine::Engine;

/// Uniform response envelope for every endpoint.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

fn err_envelope(message: impl Into<String>) -> Envelope<()> {
    Envelope {
        success: false,
        message: Some(message.into()),
        data: None,
    }
}

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/bot/status", get(status))
        .route("/bot/start", post(start))
        .route("/bot/stop", post(stop))
        .route("/bot/config", patch(patch_config))
        .route("/bot/history", get(history))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// GET /bot/status
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    state: crate::state_store::State,
    config: crate::config::Config,
    logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    balances: Option<rust_decimal::Decimal>,
}

/// Never 500s on empty state; a failed balance read degrades to `None`
/// rather than failing the whole response.
async fn status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let response = StatusResponse {
        state: engine.state(),
        config: engine.config(),
        logs: engine.recent_logs(),
        balances: engine.current_balance().await,
    };
    Json(Envelope::ok(response))
}

// =============================================================================
// POST /bot/start, POST /bot/stop
// =============================================================================

async fn start(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.start();
    info!("bot started via API");
    Json(Envelope::ok_with_message((), "engine started"))
}

async fn stop(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.stop();
    info!("bot stopped via API");
    Json(Envelope::ok_with_message((), "engine stopped"))
}

// =============================================================================
// PATCH /bot/config
// =============================================================================

async fn patch_config(
    State(engine): State<Arc<Engine>>,
    Json(patch): Json<serde_json::Value>,
) -> Result<impl IntoResponse, (StatusCode, Json<Envelope<()>>)> {
    match engine.apply_config_patch(&patch) {
        Ok(merged) => Ok(Json(Envelope::ok(merged))),
        Err(err) => {
            warn!(error = %err, "config patch rejected");
            Err((StatusCode::BAD_REQUEST, Json(err_envelope(err.to_string()))))
        }
    }
}

// =============================================================================
// GET /bot/history?page&pageSize
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(rename = "pageSize", default)]
    page_size: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    rows: Vec<crate::state_store::TradeHistoryRow>,
    page: usize,
    page_size: usize,
    total_trades: u64,
    total_pnl: rust_decimal::Decimal,
    win_rate: f64,
}

const DEFAULT_PAGE_SIZE: usize = 20;

async fn history(State(engine): State<Arc<Engine>>, Query(query): Query<HistoryQuery>) -> impl IntoResponse {
    let page = query.page.unwrap_or(0);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 500);

    let (rows, aggregates) = engine.history_page(page, page_size);
    Json(Envelope::ok(HistoryResponse {
        rows,
        page,
        page_size,
        total_trades: aggregates.total_trades,
        total_pnl: aggregates.total_pnl,
        win_rate: aggregates.win_rate,
    }))
}
