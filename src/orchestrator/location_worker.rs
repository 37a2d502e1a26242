/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use rand::Rng;

use crate::algorithms::{self, eastern_now, AlgorithmInput, AlgorithmState, LeadLagInput};
use crate::control::{CommandSource, NeuralCommand, Value};
use crate::equipment::Equipment;
use crate::error::ControlError;
use crate::metrics::{self, MetricsSnapshot};
use crate::orchestrator::{now_utc, ControlContext};
use crate::state_store::{PidKey, StageState};

const METRICS_WINDOW: Duration = Duration::from_secs(5 * 60);
const UI_COMMAND_WINDOW: Duration = Duration::from_secs(24 * 3600);
const SUPPLY_SAFETY_LIMIT: f64 = 170.0;

/// C9 step 1-6: looks up the algorithm, assembles inputs from C1+C2+C3+C7,
/// invokes the algorithm, extracts/validates commands, and writes results
/// back.
pub async fn process_equipment(ctx: &ControlContext, equipment: &Equipment) -> Result<(), ControlError> {
    let algorithm = algorithms::for_kind(equipment.kind);

    let raw_metrics = ctx
        .timeseries
        .query_recent("Locations", &equipment.id, &equipment.location_id, METRICS_WINDOW)
        .await?;
    let raw_fields = flatten_rows(raw_metrics);
    let snapshot = metrics::normalize(&raw_fields);

    let mut settings = doc_store_settings(equipment);
    let ui_overrides = ctx
        .timeseries
        .read_ui_commands(&equipment.id, UI_COMMAND_WINDOW)
        .await
        .unwrap_or_default();
    settings.extend(ui_overrides);

    let control_temp = select_control_temp(equipment, &snapshot, &settings);

    let resolution = ctx.groups.resolve(&equipment.id).await.unwrap_or(crate::leadlag::Resolution {
        group_id: None,
        is_lead: true,
        lag_ids: vec![],
    });

    let mut lead_healthy = true;
    if let Some(group_id) = &resolution.group_id {
        if ctx.groups.health_check_due(group_id, now_utc()).await {
            let health = ctx.groups.check_health(&snapshot, Some(SUPPLY_SAFETY_LIMIT), true);
            lead_healthy = matches!(health, crate::leadlag::HealthResult::Ok);
            if resolution.is_lead {
                if let Ok(group) = ctx.documents.get_group(group_id).await {
                    if let Ok(Some(updated)) = ctx.groups.maybe_failover(&group, health, &resolution.lag_ids).await {
                        ctx.documents.invalidate_group(&updated.id).await;
                    }
                }
            }
        }
        if ctx.groups.rotation_check_due(group_id, now_utc()).await {
            if let Ok(group) = ctx.documents.get_group(group_id).await {
                if let Ok(Some(updated)) = ctx.groups.maybe_rotate(&group, now_utc()).await {
                    ctx.documents.invalidate_group(&updated.id).await;
                }
            }
        }
    }

    let loop_names = loop_names_for(equipment.kind);
    let mut pid = HashMap::new();
    for loop_name in loop_names {
        let key = PidKey::new(&equipment.location_id, &equipment.id, loop_name);
        pid.insert(loop_name.to_string(), ctx.state.get_pid_state(&key).await);
    }
    let hysteresis_key = PidKey::new(&equipment.location_id, &equipment.id, "hysteresis");
    let hysteresis = ctx.state.get_hysteresis_state(&hysteresis_key).await;
    let mut stage_state = ctx.state.get_stage_state(&equipment.id).await;
    if equipment.kind == crate::equipment::EquipmentKind::Geothermal && stage_state.rotation_offset.is_none() {
        stage_state.rotation_offset = Some(rand::thread_rng().gen_range(0..4u8));
    }
    settings
        .entry("rotationOffset".to_string())
        .or_insert_with(|| Value::Number(f64::from(stage_state.rotation_offset.unwrap_or(0))));

    let state = AlgorithmState {
        pid,
        hysteresis,
        stage: stage_state.stage,
        stage_entered_at: stage_state.stage_entered_at,
    };

    let input = AlgorithmInput {
        metrics: &snapshot,
        settings: &settings,
        control_temp,
        state,
        lead_lag: LeadLagInput {
            is_lead: resolution.is_lead,
            lead_healthy,
        },
        now: eastern_now(now_utc()),
        dt_seconds: ctx.settings.tick_interval.as_secs_f64(),
    };

    let output = algorithm.run(input);
    let commands = algorithms::extract(equipment.kind, output.results);

    let mut batch = Vec::with_capacity(commands.len());
    for (command_name, value) in &commands {
        batch.push(NeuralCommand::new(
            equipment.id.clone(),
            equipment.location_id.clone(),
            equipment.kind,
            command_name.clone(),
            value.clone(),
            CommandSource::Autonomous,
        ));
    }
    ctx.timeseries.write_commands(&batch).await?;

    for (loop_name, pid_state) in output.state.pid {
        let key = PidKey::new(&equipment.location_id, &equipment.id, loop_name);
        ctx.state.set_pid_state(key, pid_state).await;
    }
    ctx.state
        .set_hysteresis_state(hysteresis_key, output.state.hysteresis)
        .await;
    ctx.state
        .set_stage_state(
            equipment.id.clone(),
            StageState {
                stage: output.state.stage,
                stage_entered_at: output.state.stage_entered_at,
                rotation_offset: stage_state.rotation_offset,
            },
        )
        .await;

    debug!(
        "equipment {} ({:?}): wrote {} command(s)",
        equipment.id,
        equipment.kind,
        commands.len()
    );
    Ok(())
}

fn doc_store_settings(equipment: &Equipment) -> HashMap<String, Value> {
    // the document store's per-equipment `controls{}` map is merged in here;
    // callers without a richer document-store schema fall back to defaults
    // baked into each algorithm.
    let mut settings = HashMap::new();
    if let Some(system) = &equipment.system {
        settings.insert("system".to_string(), Value::Text(system.clone()));
    }
    settings
}

fn flatten_rows(rows: Vec<HashMap<String, serde_json::Value>>) -> HashMap<String, String> {
    let mut flattened = HashMap::new();
    if let Some(row) = rows.into_iter().next() {
        for (key, value) in row {
            let as_string = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            flattened.insert(key, as_string);
        }
    }
    flattened
}

/// Kind-specific control-temperature selector (§4.9 step 2): water-supply
/// for boilers, outdoor for pumps/chillers, room-or-supply for fan coils
/// per `temperatureSource`, loop for geothermal.
fn select_control_temp(
    equipment: &Equipment,
    metrics: &MetricsSnapshot,
    settings: &HashMap<String, Value>,
) -> f64 {
    use crate::equipment::EquipmentKind::*;
    match equipment.kind {
        BoilerComfort | BoilerDomestic => metrics
            .get_f64(metrics::WATER_SUPPLY_TEMPERATURE)
            .unwrap_or(0.0),
        PumpCw | PumpHw | Chiller => metrics.get_f64(metrics::OUTDOOR_TEMPERATURE).unwrap_or(55.0),
        FanCoil => {
            let source = match settings.get("temperatureSource") {
                Some(Value::Text(s)) => s.as_str(),
                _ => "room",
            };
            if source == "supply" {
                metrics.get_f64(metrics::SUPPLY_TEMPERATURE).unwrap_or(72.0)
            } else {
                metrics.get_f64(metrics::ROOM_TEMPERATURE).unwrap_or(72.0)
            }
        }
        AirHandler | SteamBundle => metrics.get_f64(metrics::SUPPLY_TEMPERATURE).unwrap_or(72.0),
        Geothermal => settings
            .get("loopTemp")
            .and_then(Value::as_f64)
            .or_else(|| metrics.get_f64(metrics::SUPPLY_TEMPERATURE))
            .unwrap_or(45.0),
    }
}

fn loop_names_for(kind: crate::equipment::EquipmentKind) -> &'static [&'static str] {
    use crate::equipment::EquipmentKind::*;
    match kind {
        FanCoil => &["heating", "cooling"],
        AirHandler => &["heating", "cooling", "damper"],
        SteamBundle => &["supply"],
        BoilerComfort | BoilerDomestic | PumpCw | PumpHw | Chiller | Geothermal => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipment::{Equipment, EquipmentKind};

    fn equipment(kind: EquipmentKind) -> Equipment {
        Equipment {
            id: "eq-1".to_string(),
            kind,
            location_id: "4".to_string(),
            name: "Test".to_string(),
            system: None,
            control_enabled: true,
            group_id: None,
            is_lead: None,
        }
    }

    #[test]
    fn boiler_control_temp_uses_water_supply() {
        let mut metrics = MetricsSnapshot::default();
        metrics
            .fields
            .insert(crate::metrics::WATER_SUPPLY_TEMPERATURE.to_string(), Value::Number(140.0));
        let settings = HashMap::new();
        let temp = select_control_temp(&equipment(EquipmentKind::BoilerComfort), &metrics, &settings);
        assert_eq!(temp, 140.0);
    }

    #[test]
    fn fan_coil_uses_supply_when_configured() {
        let mut metrics = MetricsSnapshot::default();
        metrics
            .fields
            .insert(crate::metrics::SUPPLY_TEMPERATURE.to_string(), Value::Number(68.0));
        let mut settings = HashMap::new();
        settings.insert("temperatureSource".to_string(), Value::Text("supply".to_string()));
        let temp = select_control_temp(&equipment(EquipmentKind::FanCoil), &metrics, &settings);
        assert_eq!(temp, 68.0);
    }
}
