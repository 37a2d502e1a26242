/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::control::Value;

/// Canonical field names (§3 "Metrics snapshot").
pub const ROOM_TEMPERATURE: &str = "roomTemperature";
pub const SUPPLY_TEMPERATURE: &str = "supplyTemperature";
pub const RETURN_TEMPERATURE: &str = "returnTemperature";
pub const MIXED_AIR_TEMPERATURE: &str = "mixedAirTemperature";
pub const OUTDOOR_TEMPERATURE: &str = "outdoorTemperature";
pub const WATER_SUPPLY_TEMPERATURE: &str = "waterSupplyTemperature";
pub const WATER_RETURN_TEMPERATURE: &str = "waterReturnTemperature";
pub const SETPOINT: &str = "setpoint";
pub const ZONE_TEMPERATURES: &str = "zoneTemperatures";

/// A snapshot built fresh every tick from the most-recent samples within a
/// 5-minute window (fallback 60 minutes), keyed by canonical field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub fields: HashMap<String, Value>,
    pub zone_temperatures: HashMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        match self.fields.get(field) {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Some(Value::Number(n)) => Some(*n != 0.0),
            None => None,
        }
    }
}

/// Ordered alias lists per canonical field (§4.7). The first matching alias
/// found in the raw row wins.
fn alias_candidates(canonical: &str) -> &'static [&'static str] {
    match canonical {
        ROOM_TEMPERATURE => &["RoomTemp", "RoomTemperature", "Room", "ZoneTemp", "SpaceTemp"],
        SUPPLY_TEMPERATURE => &["Supply", "SAT", "SupplyAirTemp", "SupplyTemp", "DischargeTemp"],
        RETURN_TEMPERATURE => &["Return", "RAT", "ReturnAirTemp", "ReturnTemp"],
        MIXED_AIR_TEMPERATURE => &["MAT", "MixedAir", "MixedAirTemp"],
        OUTDOOR_TEMPERATURE => &["Outdoor", "OAT", "OutdoorAirTemp", "OutdoorTemp", "OutsideTemp"],
        WATER_SUPPLY_TEMPERATURE => &["H2OSupply", "WaterSupply", "HWS", "BoilerSupplyTemp"],
        WATER_RETURN_TEMPERATURE => &["H2OReturn", "WaterReturn", "HWR", "BoilerReturnTemp"],
        SETPOINT => &["Setpoint", "SP", "TempSetpoint", "TargetTemp"],
        _ => &[],
    }
}

const CANONICAL_FIELDS: &[&str] = &[
    ROOM_TEMPERATURE,
    SUPPLY_TEMPERATURE,
    RETURN_TEMPERATURE,
    MIXED_AIR_TEMPERATURE,
    OUTDOOR_TEMPERATURE,
    WATER_SUPPLY_TEMPERATURE,
    WATER_RETURN_TEMPERATURE,
    SETPOINT,
];

/// Area prefixes recognized as zone sensors when the field doesn't already
/// match a standard alias (§4.7 "secondary pass").
const ZONE_PREFIXES: &[&str] = &[
    "Zone", "Room", "Office", "Lobby", "Conference", "Suite", "Floor", "Area",
];

/// Coerces a raw string into a typed [`Value`]: numeric strings become
/// numbers, `"true"`/`"false"` become booleans, everything else stays text.
fn coerce(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Value::Number(n);
    }
    Value::Text(raw.to_string())
}

/// Maps a heterogeneous raw field map onto the canonical schema (§4.7).
/// Round-trip invariant (§8): every canonical temperature present under any
/// recognized alias survives; unknown `*Temp`/`*Temperature` fields with a
/// recognized area prefix land in `zoneTemperatures`.
pub fn normalize(raw: &HashMap<String, String>) -> MetricsSnapshot {
    let mut fields = HashMap::new();
    let mut consumed: Vec<&str> = Vec::new();

    for &canonical in CANONICAL_FIELDS {
        if let Some(raw_value) = raw.get(canonical) {
            fields.insert(canonical.to_string(), coerce(raw_value));
            consumed.push(canonical);
            continue;
        }
        for alias in alias_candidates(canonical) {
            if let Some(raw_value) = raw.get(*alias) {
                fields.insert(canonical.to_string(), coerce(raw_value));
                consumed.push(alias);
                break;
            }
        }
    }

    let mut zone_temperatures = HashMap::new();
    for (key, raw_value) in raw {
        if consumed.contains(&key.as_str()) {
            continue;
        }
        let is_temp_field = key.ends_with("Temp") || key.ends_with("Temperature");
        if !is_temp_field {
            continue;
        }
        let has_zone_prefix = ZONE_PREFIXES.iter().any(|p| key.starts_with(p));
        if !has_zone_prefix {
            continue;
        }
        if let Value::Number(n) = coerce(raw_value) {
            zone_temperatures.insert(key.clone(), n);
        }
    }

    MetricsSnapshot {
        fields,
        zone_temperatures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_aliases() {
        let mut raw = HashMap::new();
        raw.insert("SAT".to_string(), "140.5".to_string());
        raw.insert("OAT".to_string(), "32".to_string());
        let snapshot = normalize(&raw);
        assert_eq!(snapshot.get_f64(SUPPLY_TEMPERATURE), Some(140.5));
        assert_eq!(snapshot.get_f64(OUTDOOR_TEMPERATURE), Some(32.0));
    }

    #[test]
    fn round_trips_every_canonical_alias() {
        let mut raw = HashMap::new();
        for &canonical in CANONICAL_FIELDS {
            let alias = alias_candidates(canonical)
                .first()
                .copied()
                .unwrap_or(canonical);
            raw.insert(alias.to_string(), "99".to_string());
        }
        let snapshot = normalize(&raw);
        for &canonical in CANONICAL_FIELDS {
            assert_eq!(snapshot.get_f64(canonical), Some(99.0), "{canonical}");
        }
    }

    #[test]
    fn unrecognized_temp_field_with_zone_prefix_becomes_zone_sensor() {
        let mut raw = HashMap::new();
        raw.insert("ConferenceRoomATemp".to_string(), "71.2".to_string());
        let snapshot = normalize(&raw);
        assert_eq!(
            snapshot.zone_temperatures.get("ConferenceRoomATemp"),
            Some(&71.2)
        );
    }

    #[test]
    fn coerces_booleans_and_numbers() {
        let mut raw = HashMap::new();
        raw.insert("customLogicEnabled".to_string(), "true".to_string());
        let snapshot = normalize(&raw);
        let _ = snapshot;
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("12.5"), Value::Number(12.5));
        assert_eq!(coerce("auto"), Value::Text("auto".to_string()));
    }
}
