//! Control and event server
//!
//! Thin boundary over the engine and ledger: strategy CRUD with request
//! validation, lifecycle commands, and a WebSocket stream of engine
//! events. Engine outcomes map to JSON responses without losing detail;
//! a busy ledger maps to a retryable 503.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{error, info};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::engine::GridEngine;
use crate::errors::{EngineError, EngineResult};
use crate::ledger::{Ledger, NewStrategy, StrategyStatus};
use crate::notifier::EventBroadcaster;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GridEngine>,
    pub ledger: Arc<Ledger>,
    pub broadcaster: EventBroadcaster,
}

#[derive(Debug)]
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::StrategyNotFound(_) | EngineError::OrderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::InvalidConfig(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::WrongStrategyStatus { .. } => StatusCode::BAD_REQUEST,
            EngineError::StoreBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/strategies", post(create_strategy).get(list_strategies))
        .route(
            "/api/strategies/:id",
            get(get_strategy).put(update_strategy).delete(delete_strategy),
        )
        .route("/api/orders", get(list_orders))
        .route("/api/strategies/:id/start", post(start_strategy))
        .route("/api/strategies/:id/pause", post(pause_strategy))
        .route("/api/strategies/:id/stop", post(stop_strategy))
        .route("/api/strategies/:id/status", get(strategy_status))
        .route("/api/strategies/:id/stats", get(strategy_stats))
        .route("/api/strategies/:id/orders", get(strategy_orders))
        .route("/api/strategies/:id/trades", get(strategy_trades))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(state: AppState, host: &str, port: u16) -> EngineResult<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| EngineError::InvalidConfig(format!("invalid server address: {}", e)))?;

    info!("Control server running on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))
}

/// The venue quotes whole prices; a sub-tick grid step would collapse
/// adjacent rungs onto the same price.
fn validate_step(new: &NewStrategy) -> EngineResult<()> {
    let step = (new.upper_price - new.lower_price) / new.grid_count as f64;
    if step < 1.0 {
        return Err(EngineError::InvalidConfig(format!(
            "grid step too small ({:.2}); widen the band or reduce the grid count",
            step
        )));
    }
    Ok(())
}

async fn create_strategy(
    State(state): State<AppState>,
    Json(new): Json<NewStrategy>,
) -> ApiResult {
    new.validate()?;
    validate_step(&new)?;

    let id = state.ledger.write(|s| s.create_strategy(new)).await?;
    let strategy = state.ledger.read(|s| s.strategy(id).cloned()).await?;
    Ok(Json(json!({ "success": true, "strategy": strategy })))
}

async fn list_strategies(State(state): State<AppState>) -> ApiResult {
    let mut items = state
        .ledger
        .read(|s| s.strategies().cloned().collect::<Vec<_>>())
        .await;
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(json!({ "items": items })))
}

async fn get_strategy(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    let strategy = state.ledger.read(|s| s.strategy(id).cloned()).await?;
    Ok(Json(json!({ "strategy": strategy })))
}

/// Reconfigure a strategy that has not started yet
async fn update_strategy(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(new): Json<NewStrategy>,
) -> ApiResult {
    new.validate()?;
    validate_step(&new)?;

    state.ledger.write(|s| s.update_strategy(id, new)).await?;
    let strategy = state.ledger.read(|s| s.strategy(id).cloned()).await?;
    Ok(Json(json!({ "success": true, "strategy": strategy })))
}

async fn list_orders(State(state): State<AppState>) -> ApiResult {
    let orders = state
        .ledger
        .read(|s| s.orders().into_iter().cloned().collect::<Vec<_>>())
        .await;
    Ok(Json(json!({ "items": orders })))
}

async fn delete_strategy(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state.ledger.write(|s| s.delete_strategy(id)).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

/// Flip to RUNNING, then hand the ladder build to the engine in the
/// background; the response does not wait for order placement.
async fn start_strategy(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state
        .ledger
        .write(|s| s.strategy_mut(id)?.set_status(StrategyStatus::Running))
        .await?;

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.start_strategy(id).await {
            error!("Starting strategy {} failed: {}", id, e);
        }
    });

    Ok(Json(json!({
        "success": true,
        "message": "strategy started, ladder construction in progress",
        "status": StrategyStatus::Running,
        "strategy_id": id,
    })))
}

/// Pause stops new ladder construction only; in-flight fill detection
/// keeps running, and fills arriving while paused are discarded by the
/// engine's status guard.
async fn pause_strategy(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state
        .ledger
        .write(|s| s.strategy_mut(id)?.set_status(StrategyStatus::Paused))
        .await?;
    Ok(Json(json!({ "success": true, "status": StrategyStatus::Paused })))
}

async fn stop_strategy(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    // Cancel the ladder first, then flip the status
    let report = state.engine.stop_strategy(id).await?;
    state
        .ledger
        .write(|s| s.strategy_mut(id)?.set_status(StrategyStatus::Stopped))
        .await?;

    Ok(Json(json!({
        "success": true,
        "status": StrategyStatus::Stopped,
        "cancelled_orders": report.cancelled_orders,
    })))
}

async fn strategy_status(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state.ledger.read(|s| s.strategy(id).map(|_| ())).await?;
    Ok(Json(json!({ "run": state.engine.strategy_status(id) })))
}

async fn strategy_stats(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    let (status, total_profit, total_trades) = state
        .ledger
        .read(|s| {
            let strategy = s.strategy(id)?;
            Ok::<_, EngineError>((strategy.status, strategy.total_profit, strategy.total_trades))
        })
        .await?;
    Ok(Json(json!({
        "strategy_id": id,
        "status": status,
        "total_profit": total_profit,
        "total_trades": total_trades,
    })))
}

async fn strategy_orders(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state.ledger.read(|s| s.strategy(id).map(|_| ())).await?;
    let orders = state
        .ledger
        .read(|s| {
            s.orders_for(id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        })
        .await;
    Ok(Json(json!({ "items": orders })))
}

async fn strategy_trades(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    state.ledger.read(|s| s.strategy(id).map(|_| ())).await?;
    let trades = state
        .ledger
        .read(|s| {
            s.trades_for(id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        })
        .await;
    Ok(Json(json!({ "items": trades })))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let broadcaster = state.broadcaster.clone();
    ws.on_upgrade(move |socket| stream_events(socket, broadcaster))
}

/// Forward engine events to one subscriber until it disconnects. A slow
/// subscriber that lags simply misses the overwritten events.
async fn stream_events(mut socket: WebSocket, broadcaster: EventBroadcaster) {
    let mut events = broadcaster.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                info!("Event subscriber lagged, skipped {} events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
