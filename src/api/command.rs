/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::control::Value;
use crate::error::ControlError;
use crate::ui_commands::{JobStatus, UiCommand};

/// `POST /api/equipment/{id}/command` body (§6 "Command API for external
/// callers").
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    pub job_id: String,
}

/// Enqueues onto the UI queue and returns immediately with a job id; the
/// three-step apply sequence (§4.10) runs asynchronously.
pub async fn submit_command(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandAccepted>, ControlError> {
    let equipment = state.ctx.documents.get_equipment(&equipment_id).await?;
    let command = UiCommand {
        equipment_id,
        location_id: equipment.location_id,
        user_id: request.user_id,
        user_name: request.user_name,
        command: request.command,
        settings: request.settings,
        priority: request.priority,
        enqueued_at: Utc::now(),
    };
    let job_id = state.ui_queue.enqueue(command).await;
    Ok(Json(CommandAccepted { job_id }))
}

#[derive(Debug, Serialize)]
pub struct EquipmentStateResponse {
    pub last_modified_at: Option<chrono::DateTime<Utc>>,
    pub last_modified_by: Option<String>,
    pub settings: HashMap<String, Value>,
    pub command: Option<String>,
}

/// `GET /api/equipment/{id}/state`.
pub async fn get_equipment_state(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
) -> Json<EquipmentStateResponse> {
    let ui_state = state.ctx.state.get_ui_state(&equipment_id).await;
    Json(EquipmentStateResponse {
        last_modified_at: ui_state.last_modified_at,
        last_modified_by: ui_state.last_modified_by,
        settings: ui_state.settings,
        command: ui_state.command,
    })
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
}

/// `GET /api/equipment/{id}/status/{jobId}`.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path((_equipment_id, job_id)): Path<(String, String)>,
) -> Result<Json<JobStatusResponse>, ControlError> {
    let record = state
        .ui_queue
        .status(&job_id)
        .await
        .ok_or_else(|| ControlError::NotFound {
            msg: format!("no job with id {job_id}"),
        })?;
    Ok(Json(JobStatusResponse {
        status: record.status,
        progress: record.progress,
        message: record.message,
    }))
}
