/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

pub mod location_worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::equipment::{Equipment, EquipmentId};
use crate::gateway::documents::DocumentStore;
use crate::gateway::timeseries::TimeSeriesGateway;
use crate::leadlag::GroupManager;
use crate::state_store::StateStore;

/// Replaces the teacher's process-wide mutable singletons (§9 "Global queue
/// and PID maps"): every collaborator a worker needs is threaded through
/// here rather than reached for as a global.
#[derive(Clone)]
pub struct ControlContext {
    pub documents: Arc<DocumentStore>,
    pub timeseries: Arc<TimeSeriesGateway>,
    pub state: Arc<StateStore>,
    pub groups: Arc<GroupManager>,
    pub settings: OrchestratorSettings,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub initial_batch_size: usize,
    pub per_location_concurrency: usize,
    pub algorithm_deadline: Duration,
    pub tick_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            initial_batch_size: 3,
            per_location_concurrency: 4,
            algorithm_deadline: Duration::from_secs(5),
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EquipmentTickStatus {
    pub id: EquipmentId,
    pub status: &'static str,
    pub error: Option<String>,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub success: bool,
    pub per_equipment: Vec<EquipmentTickStatus>,
    pub queued_count: usize,
    pub immediate_count: usize,
    pub elapsed_ms: u64,
}

/// C8: runs one tick over the working set (§4.8). `tick` is invoked on a
/// fixed cadence by `main`; it never panics out -- every per-equipment
/// failure is recorded in the returned [`TickReport`] and the tick continues.
pub async fn tick(ctx: &ControlContext) -> TickReport {
    let started = Instant::now();
    let working_set = match build_working_set(ctx).await {
        Ok(set) => set,
        Err(err) => {
            warn!("failed to build working set for this tick: {err}");
            return TickReport {
                success: false,
                per_equipment: vec![],
                queued_count: 0,
                immediate_count: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    let ordered = sort_boilers_and_lead_first(working_set);
    let batch_size = ctx.settings.initial_batch_size.min(ordered.len());
    let (immediate, queued) = ordered.split_at(batch_size);

    info!(
        "tick: {} immediate, {} queued (of {} total)",
        immediate.len(),
        queued.len(),
        immediate.len() + queued.len()
    );

    let semaphore = Arc::new(Semaphore::new(ctx.settings.per_location_concurrency.max(1)));
    let mut handles = Vec::with_capacity(immediate.len());
    for equipment in immediate {
        let ctx = ctx.clone();
        let equipment = equipment.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            run_one(&ctx, &equipment).await
        }));
    }

    let mut per_equipment = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(status) => per_equipment.push(status),
            Err(join_err) => warn!("equipment control task panicked: {join_err}"),
        }
    }

    for equipment in queued {
        let ctx = ctx.clone();
        let equipment = equipment.clone();
        let semaphore = Arc::clone(&semaphore);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let _ = run_one(&ctx, &equipment).await;
        });
    }

    TickReport {
        success: true,
        per_equipment,
        queued_count: queued.len(),
        immediate_count: immediate.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

async fn run_one(ctx: &ControlContext, equipment: &Equipment) -> EquipmentTickStatus {
    let started = Instant::now();
    let gate = ctx.state.lock_equipment(&equipment.id).await;
    let _guard = gate.lock().await;

    let outcome = timeout(
        ctx.settings.algorithm_deadline,
        location_worker::process_equipment(ctx, equipment),
    )
    .await;

    let (status, error) = match outcome {
        Ok(Ok(())) => ("ok", None),
        Ok(Err(err)) => ("failed", Some(err.to_string())),
        Err(_) => ("timeout", Some("algorithm deadline exceeded".to_string())),
    };

    EquipmentTickStatus {
        id: equipment.id.clone(),
        status,
        error,
        processing_ms: started.elapsed().as_millis() as u64,
    }
}

/// Union of doc-store `controlEnabled=true` equipment and equipment whose
/// most-recent metrics carry `customLogicEnabled=true` (§4.8 step 1).
async fn build_working_set(ctx: &ControlContext) -> Result<Vec<Equipment>, crate::error::ControlError> {
    let all = ctx.documents.list_equipment().await?;
    let mut working_set = Vec::new();
    let mut seen: HashMap<EquipmentId, ()> = HashMap::new();

    for equipment in all {
        if equipment.control_enabled {
            seen.insert(equipment.id.clone(), ());
            working_set.push(equipment);
        }
    }

    for equipment_id in ctx.timeseries.custom_logic_enabled_equipment().await.unwrap_or_default() {
        if seen.contains_key(&equipment_id) {
            continue;
        }
        if let Ok(equipment) = ctx.documents.get_equipment(&equipment_id).await {
            seen.insert(equipment_id, ());
            working_set.push(equipment);
        }
    }

    Ok(working_set)
}

/// Boilers first; within non-boilers, lead before lag; stable otherwise
/// (§4.8 step 2). Lead status here is the document-store's `isLead`
/// override; the authoritative group-resolved lead is consulted per
/// equipment inside the worker, not during sort (sorting is a cheap,
/// synchronous pass over already-fetched records).
fn sort_boilers_and_lead_first(mut equipment: Vec<Equipment>) -> Vec<Equipment> {
    equipment.sort_by_key(|e| (!e.kind.is_boiler(), !e.is_lead.unwrap_or(false)));
    equipment
}

pub fn now_utc() -> chrono::DateTime<Utc> {
    Utc::now()
}
