/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

mod command;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use std::time::Duration;

use crate::orchestrator::{ControlContext, TickReport};
use crate::ui_commands::UiCommandQueue;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything an HTTP handler needs (§6 "Command API for external callers").
/// Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub ctx: ControlContext,
    pub ui_queue: Arc<UiCommandQueue>,
    last_tick: Arc<RwLock<Option<TickReport>>>,
}

impl AppState {
    pub fn new(ctx: ControlContext, ui_queue: Arc<UiCommandQueue>) -> Self {
        AppState {
            ctx,
            ui_queue,
            last_tick: Arc::new(RwLock::new(None)),
        }
    }

    /// Called by the tick scheduler in `main` after every `orchestrator::tick`
    /// (§7 "aggregate per-tick report", exposed read-only per §A "Aggregate
    /// tick report model").
    pub async fn record_tick(&self, report: TickReport) {
        *self.last_tick.write().await = Some(report);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/equipment/{id}/command", post(command::submit_command))
        .route("/api/equipment/{id}/state", get(command::get_equipment_state))
        .route(
            "/api/equipment/{id}/status/{job_id}",
            get(command::get_job_status),
        )
        .route("/api/tick/last", get(last_tick))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn last_tick(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<Option<TickReport>> {
    Json(state.last_tick.read().await.clone())
}

/// Binds and serves the Command API (§6); returns a future the caller spawns
/// alongside the tick scheduler, mirroring the teacher's `api::init_server`
/// shape of "build router, bind, hand back a task to spawn".
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Command API listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
