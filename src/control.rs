/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::equipment::{EquipmentId, EquipmentKind, LocationId};

/// A single command value, as produced by an [`crate::algorithms::Algorithm`]
/// before extraction against the allow-list (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    /// Serializes to the uniform string representation the time-series
    /// column requires (§3 "Neural command record", §6 wire constraint).
    pub fn to_wire_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Text(s) => s.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.parse().ok(),
        }
    }
}

/// Free-form results handed back by an algorithm, keyed by field name. The
/// extractor (§4.5, §9 "heterogeneous result fields") maps these down to the
/// allow-listed command set for the equipment's kind.
pub type AlgorithmResult = HashMap<String, Value>;

/// The source that produced a command, carried through to the emitted record
/// so the autonomous loop and UI-override path can be told apart downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSource {
    Autonomous,
    UiCommand,
}

impl CommandSource {
    pub fn factory_name(self) -> &'static str {
        match self {
            CommandSource::Autonomous => "equipment-control-orchestrator",
            CommandSource::UiCommand => "ui-command",
        }
    }
}

/// What the core emits to the time-series store (§3 "Neural command record",
/// §6 "Emitted record format"). `value` is always serialized as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralCommand {
    pub equipment_id: EquipmentId,
    pub location_id: LocationId,
    pub equipment_kind: EquipmentKind,
    pub command_name: String,
    pub value: Value,
    pub source: CommandSource,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl NeuralCommand {
    pub fn new(
        equipment_id: EquipmentId,
        location_id: LocationId,
        equipment_kind: EquipmentKind,
        command_name: impl Into<String>,
        value: Value,
        source: CommandSource,
    ) -> Self {
        NeuralCommand {
            equipment_id,
            location_id,
            equipment_kind,
            command_name: command_name.into(),
            value,
            source,
            status: "active",
            timestamp: Utc::now(),
        }
    }
}

/// Validates and clamps a command value against the invariants in §3(3):
/// actuator positions in `[0,100]`, temperature setpoints in `[50,200]`°F.
/// Out-of-range numeric values are clamped and flagged via the returned bool
/// rather than rejected (§7 `BadInput` is "repaired locally").
pub fn clamp_for_command(kind: EquipmentKind, command_name: &str, value: Value) -> (Value, bool) {
    let Value::Number(n) = value else {
        return (value, false);
    };
    let (lo, hi) = match clamp_range(kind, command_name) {
        Some(range) => range,
        None => return (Value::Number(n), false),
    };
    let clamped = n.clamp(lo, hi);
    (Value::Number(clamped), (clamped - n).abs() > f64::EPSILON)
}

fn clamp_range(kind: EquipmentKind, command_name: &str) -> Option<(f64, f64)> {
    const POSITION: (f64, f64) = (0.0, 100.0);
    const SETPOINT: (f64, f64) = (50.0, 200.0);
    const COOLING_SETPOINT: (f64, f64) = (35.0, 200.0);
    match command_name {
        "heatingValvePosition"
        | "coolingValvePosition"
        | "outdoorDamperPosition"
        | "primaryValvePosition"
        | "secondaryValvePosition"
        | "pumpSpeed" => Some(POSITION),
        "temperatureSetpoint" | "waterTempSetpoint" | "supplyAirTempSetpoint" => Some(SETPOINT),
        // Chilled-water and geothermal loop setpoints run well under the
        // heating-oriented 50°F floor (chiller default 44°F, geothermal 45°F).
        "chillerSetpoint" | "targetSetpoint" => Some(COOLING_SETPOINT),
        // Reported loop temperature, not a setpoint or actuator -- never clamped.
        "loopTemp" => None,
        _ => {
            let _ = kind;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_actuator_position_above_range() {
        let (v, flagged) = clamp_for_command(
            EquipmentKind::FanCoil,
            "heatingValvePosition",
            Value::Number(140.0),
        );
        assert_eq!(v, Value::Number(100.0));
        assert!(flagged);
    }

    #[test]
    fn clamps_setpoint_below_range() {
        let (v, flagged) = clamp_for_command(
            EquipmentKind::BoilerComfort,
            "waterTempSetpoint",
            Value::Number(10.0),
        );
        assert_eq!(v, Value::Number(50.0));
        assert!(flagged);
    }

    #[test]
    fn leaves_in_range_values_untouched() {
        let (v, flagged) = clamp_for_command(
            EquipmentKind::FanCoil,
            "coolingValvePosition",
            Value::Number(55.0),
        );
        assert_eq!(v, Value::Number(55.0));
        assert!(!flagged);
    }

    #[test]
    fn chiller_setpoint_below_fifty_is_not_raised() {
        let (v, flagged) = clamp_for_command(
            EquipmentKind::Chiller,
            "chillerSetpoint",
            Value::Number(44.0),
        );
        assert_eq!(v, Value::Number(44.0));
        assert!(!flagged);
    }

    #[test]
    fn geothermal_target_setpoint_below_fifty_is_not_raised() {
        let (v, flagged) = clamp_for_command(
            EquipmentKind::Geothermal,
            "targetSetpoint",
            Value::Number(45.0),
        );
        assert_eq!(v, Value::Number(45.0));
        assert!(!flagged);
    }

    #[test]
    fn loop_temp_is_never_clamped() {
        let (v, flagged) = clamp_for_command(EquipmentKind::Geothermal, "loopTemp", Value::Number(46.0));
        assert_eq!(v, Value::Number(46.0));
        assert!(!flagged);
    }

    #[test]
    fn wire_string_is_uniform() {
        assert_eq!(Value::Bool(true).to_wire_string(), "true");
        assert_eq!(Value::Number(42.0).to_wire_string(), "42");
        assert_eq!(Value::Number(41.5).to_wire_string(), "41.5");
    }
}
