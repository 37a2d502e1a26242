/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

pub mod air_handler;
pub mod boiler;
pub mod chiller;
pub mod fan_coil;
pub mod geothermal;
pub mod pump;
pub mod steam_bundle;

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

use crate::control::{clamp_for_command, AlgorithmResult, Value};
use crate::equipment::{allow_list, EquipmentKind};
use crate::metrics::MetricsSnapshot;
use crate::pid::PidState;
use crate::state_store::HysteresisState;

/// Per-(equipment, loop) PID state plus the single on/off hysteresis flag an
/// algorithm may need, bundled for a single invocation (§4.3, §4.5).
#[derive(Debug, Clone, Default)]
pub struct AlgorithmState {
    pub pid: HashMap<String, PidState>,
    pub hysteresis: HysteresisState,
    /// Active stage count, used only by the geothermal algorithm; kept here
    /// rather than as a one-off state family so C3's state map stays uniform.
    pub stage: u8,
    pub stage_entered_at: Option<DateTime<chrono::Utc>>,
}

/// What the Lead/Lag & Group Manager resolved for this equipment, handed to
/// algorithms that embed their own lead/lag logic (§9 "strategy composition").
#[derive(Debug, Clone, Default)]
pub struct LeadLagInput {
    pub is_lead: bool,
    pub lead_healthy: bool,
}

/// Everything a pure algorithm needs (§4.5): metrics, merged settings
/// (document-store config + UI overrides), the kind-specific control
/// temperature, and persisted state. No I/O is performed inside `run`.
pub struct AlgorithmInput<'a> {
    pub metrics: &'a MetricsSnapshot,
    pub settings: &'a HashMap<String, Value>,
    pub control_temp: f64,
    pub state: AlgorithmState,
    pub lead_lag: LeadLagInput,
    pub now: DateTime<Tz>,
    pub dt_seconds: f64,
}

pub struct AlgorithmOutput {
    pub results: AlgorithmResult,
    pub state: AlgorithmState,
}

/// One pure function per equipment kind (§4.5). Implementations must never
/// perform I/O; all inputs are pre-assembled by the per-location worker.
pub trait Algorithm: Send + Sync {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput;
}

pub fn for_kind(kind: EquipmentKind) -> &'static dyn Algorithm {
    match kind {
        EquipmentKind::FanCoil => &fan_coil::FanCoil,
        EquipmentKind::BoilerComfort => &boiler::Boiler {
            variant: boiler::Variant::Comfort,
        },
        EquipmentKind::BoilerDomestic => &boiler::Boiler {
            variant: boiler::Variant::Domestic,
        },
        EquipmentKind::PumpCw => &pump::Pump {
            variant: pump::Variant::Cw,
        },
        EquipmentKind::PumpHw => &pump::Pump {
            variant: pump::Variant::Hw,
        },
        EquipmentKind::Chiller => &chiller::Chiller,
        EquipmentKind::AirHandler => &air_handler::AirHandler,
        EquipmentKind::SteamBundle => &steam_bundle::SteamBundle,
        EquipmentKind::Geothermal => &geothermal::Geothermal,
    }
}

/// Maps an algorithm's free-form result map down to the kind's allow-listed
/// commands (§4.5, §4.9 step 4, §9 "heterogeneous result fields"); clamps
/// numeric values per §3(3).
pub fn extract(kind: EquipmentKind, raw: AlgorithmResult) -> AlgorithmResult {
    let allowed = allow_list(kind);
    let mut out = AlgorithmResult::with_capacity(raw.len());
    for (name, value) in raw {
        if !allowed.contains(&name.as_str()) {
            continue;
        }
        let (clamped, _flagged) = clamp_for_command(kind, &name, value);
        out.insert(name, clamped);
    }
    out
}

pub(crate) fn setting_f64(settings: &HashMap<String, Value>, key: &str, default: f64) -> f64 {
    settings.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub(crate) fn setting_bool(settings: &HashMap<String, Value>, key: &str, default: bool) -> bool {
    match settings.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Text(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => *n != 0.0,
        None => default,
    }
}

pub(crate) fn setting_str<'a>(settings: &'a HashMap<String, Value>, key: &str, default: &'a str) -> &'a str {
    match settings.get(key) {
        Some(Value::Text(s)) => s.as_str(),
        _ => default,
    }
}

/// Evaluates a fixed weekday occupancy window (06:00-18:00 local) in the
/// site's local time zone, per §9 "avoid naive UTC comparisons". A location
/// can force always-occupied via `alwaysOccupied` for 24/7 spaces.
pub fn is_occupied(settings: &HashMap<String, Value>, now: DateTime<Tz>) -> bool {
    if setting_bool(settings, "alwaysOccupied", false) {
        return true;
    }
    if now.weekday() == Weekday::Sat || now.weekday() == Weekday::Sun {
        return false;
    }
    let start = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
    let end = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
    let time = now.time();
    time >= start && time < end && now.hour() < 24
}

pub fn eastern_now(now: DateTime<chrono::Utc>) -> DateTime<Tz> {
    now.with_timezone(&New_York)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_drops_unlisted_commands() {
        let mut raw = AlgorithmResult::new();
        raw.insert("firing".to_string(), Value::Number(1.0));
        raw.insert("notAllowed".to_string(), Value::Bool(true));
        let extracted = extract(EquipmentKind::BoilerComfort, raw);
        assert!(extracted.contains_key("firing"));
        assert!(!extracted.contains_key("notAllowed"));
    }

    #[test]
    fn occupancy_respects_weekday_window() {
        use chrono::TimeZone;
        let settings = HashMap::new();
        let weekday_open = New_York.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap();
        let weekday_closed = New_York.with_ymd_and_hms(2026, 7, 27, 22, 0, 0).unwrap();
        let weekend = New_York.with_ymd_and_hms(2026, 7, 25, 9, 0, 0).unwrap();
        assert!(is_occupied(&settings, weekday_open));
        assert!(!is_occupied(&settings, weekday_closed));
        assert!(!is_occupied(&settings, weekend));
    }

    #[test]
    fn always_occupied_override_ignores_schedule() {
        use chrono::TimeZone;
        let mut settings = HashMap::new();
        settings.insert("alwaysOccupied".to_string(), Value::Bool(true));
        let weekend = New_York.with_ymd_and_hms(2026, 7, 25, 2, 0, 0).unwrap();
        assert!(is_occupied(&settings, weekend));
    }
}
