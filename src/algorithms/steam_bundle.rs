/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{setting_bool, setting_f64, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};
use crate::pid::{pid, PidParams};

const HIGH_TEMP_SAFETY: f64 = 165.0;

/// §4.5.6. OAR curve for the supply-water setpoint, a pump-dependency gate,
/// a high-temp safety cutoff, and two valves staged off one PID output:
/// primary takes the first `primaryValveRatio`, secondary modulates the
/// remainder.
pub struct SteamBundle;

impl Algorithm for SteamBundle {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp,
            mut state,
            dt_seconds,
            ..
        } = input;

        let setpoint = oar_setpoint(settings);
        let pump_amps = setting_f64(settings, "dependentPumpAmps", 1.0);
        let pump_running = setting_bool(settings, "dependentPumpRunning", true);
        let pump_ok = pump_amps > 0.5 || pump_running;
        let over_safety = control_temp >= HIGH_TEMP_SAFETY;
        let unit_enable = pump_ok && !over_safety;

        let mut results = AlgorithmResult::new();
        results.insert("unitEnable".to_string(), Value::Bool(unit_enable));
        results.insert("temperatureSetpoint".to_string(), Value::Number(setpoint));

        if !unit_enable {
            results.insert("primaryValvePosition".to_string(), Value::Number(0.0));
            results.insert("secondaryValvePosition".to_string(), Value::Number(0.0));
            return AlgorithmOutput { results, state };
        }

        let params = PidParams {
            reverse_acting: true,
            ..PidParams::default()
        };
        let loop_state = state.pid.get("supply").copied().unwrap_or_default();
        let (out, next) = pid(control_temp, setpoint, &params, dt_seconds, loop_state);
        state.pid.insert("supply".to_string(), next);

        let primary_ratio = setting_f64(settings, "primaryValveRatio", 0.6).clamp(0.0, 1.0);
        let primary_span = 100.0 * primary_ratio;
        let primary_position = out.output.min(primary_span);
        let secondary_position = if out.output > primary_span {
            ((out.output - primary_span) / (100.0 - primary_span).max(f64::EPSILON) * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        results.insert("primaryValvePosition".to_string(), Value::Number(primary_position));
        results.insert("secondaryValvePosition".to_string(), Value::Number(secondary_position));

        AlgorithmOutput { results, state }
    }
}

fn oar_setpoint(settings: &std::collections::HashMap<String, Value>) -> f64 {
    let min_oat = setting_f64(settings, "minOAT", 20.0);
    let max_oat = setting_f64(settings, "maxOAT", 65.0);
    let min_supply = setting_f64(settings, "minSupply", 120.0);
    let max_supply = setting_f64(settings, "maxSupply", 220.0);
    let outdoor = setting_f64(settings, "outdoorTemperature", min_oat);

    if outdoor >= max_oat {
        return min_supply;
    }
    if outdoor <= min_oat {
        return max_supply;
    }
    let fraction = (outdoor - min_oat) / (max_oat - min_oat);
    max_supply - fraction * (max_supply - min_supply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    #[test]
    fn high_temp_safety_disables_unit() {
        let settings = HashMap::new();
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 170.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = SteamBundle.run(input);
        assert_eq!(out.results.get("unitEnable"), Some(&Value::Bool(false)));
        assert_eq!(out.results.get("primaryValvePosition"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn pump_dependency_gate_blocks_when_pump_off() {
        let mut settings = HashMap::new();
        settings.insert("dependentPumpAmps".to_string(), Value::Number(0.1));
        settings.insert("dependentPumpRunning".to_string(), Value::Bool(false));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 150.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = SteamBundle.run(input);
        assert_eq!(out.results.get("unitEnable"), Some(&Value::Bool(false)));
    }

    #[test]
    fn secondary_valve_modulates_only_past_primary_span() {
        let mut settings = HashMap::new();
        settings.insert("primaryValveRatio".to_string(), Value::Number(0.5));
        settings.insert("minOAT".to_string(), Value::Number(20.0));
        settings.insert("maxOAT".to_string(), Value::Number(65.0));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 100.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = SteamBundle.run(input);
        let primary = out.results.get("primaryValvePosition").unwrap().as_f64().unwrap();
        assert!(primary <= 50.0 + f64::EPSILON);
    }
}
