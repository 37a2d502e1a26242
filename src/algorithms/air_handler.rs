/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{setting_bool, setting_f64, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};
use crate::metrics::MIXED_AIR_TEMPERATURE;
use crate::pid::{pid, PidParams};

const DEFAULT_FREEZESTAT_THRESHOLD: f64 = 38.0;

/// §4.5.5. OAR-derived supply-air setpoint, heating/cooling PID loops,
/// economizer-aware outdoor-damper PID, freezestat override.
pub struct AirHandler;

impl Algorithm for AirHandler {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            metrics,
            settings,
            control_temp,
            mut state,
            dt_seconds,
            ..
        } = input;

        let unit_enable = setting_bool(settings, "unitEnable", true);
        let setpoint = oar_setpoint(settings);

        let mut results = AlgorithmResult::new();
        results.insert("fanEnabled".to_string(), Value::Bool(unit_enable));
        results.insert(
            "fanSpeed".to_string(),
            Value::Text(if unit_enable { "high" } else { "off" }.to_string()),
        );
        results.insert("supplyAirTempSetpoint".to_string(), Value::Number(setpoint));

        if !unit_enable {
            results.insert("heatingValvePosition".to_string(), Value::Number(0.0));
            results.insert("coolingValvePosition".to_string(), Value::Number(0.0));
            results.insert("outdoorDamperPosition".to_string(), Value::Number(0.0));
            return AlgorithmOutput { results, state };
        }

        let heating_params = PidParams {
            reverse_acting: true,
            ..PidParams::default()
        };
        let heating_state = state.pid.get("heating").copied().unwrap_or_default();
        let (heating_out, heating_next) = pid(control_temp, setpoint, &heating_params, dt_seconds, heating_state);
        state.pid.insert("heating".to_string(), heating_next);

        let cooling_params = PidParams::default();
        let cooling_state = state.pid.get("cooling").copied().unwrap_or_default();
        let (cooling_out, cooling_next) = pid(control_temp, setpoint, &cooling_params, dt_seconds, cooling_state);
        state.pid.insert("cooling".to_string(), cooling_next);

        let outdoor = setting_f64(settings, "outdoorTemperature", 60.0);
        let return_temp = setting_f64(settings, "returnTemperature", 72.0);
        let min_damper_position = setting_f64(settings, "minDamperPosition", 10.0);
        let cooling_demanded = cooling_out.output > 0.0;
        let economizer_available = outdoor < return_temp && cooling_demanded;

        let damper_position = if economizer_available {
            let damper_params = PidParams {
                output_min: min_damper_position,
                ..PidParams::default()
            };
            let damper_state = state.pid.get("damper").copied().unwrap_or_default();
            let (out, next) = pid(control_temp, setpoint, &damper_params, dt_seconds, damper_state);
            state.pid.insert("damper".to_string(), next);
            out.output
        } else {
            min_damper_position
        };

        let freezestat_threshold = setting_f64(settings, "freezestatThreshold", DEFAULT_FREEZESTAT_THRESHOLD);
        let mixed_air = metrics.get_f64(MIXED_AIR_TEMPERATURE);
        let freezestat_tripped = mixed_air.is_some_and(|t| t < freezestat_threshold);

        let (heating_position, cooling_position, final_damper) = if freezestat_tripped {
            (100.0, 0.0, 0.0)
        } else {
            (heating_out.output, cooling_out.output, damper_position)
        };

        results.insert("heatingValvePosition".to_string(), Value::Number(heating_position));
        results.insert("coolingValvePosition".to_string(), Value::Number(cooling_position));
        results.insert("outdoorDamperPosition".to_string(), Value::Number(final_damper));
        if freezestat_tripped {
            results.insert("freezestat".to_string(), Value::Bool(true));
        }

        AlgorithmOutput { results, state }
    }
}

fn oar_setpoint(settings: &std::collections::HashMap<String, Value>) -> f64 {
    let min_oat = setting_f64(settings, "minOAT", 30.0);
    let max_oat = setting_f64(settings, "maxOAT", 75.0);
    let min_supply = setting_f64(settings, "minSupply", 55.0);
    let max_supply = setting_f64(settings, "maxSupply", 105.0);
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
    use crate::control::Value;
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    #[test]
    fn freezestat_forces_heating_open_and_damper_closed() {
        let settings = HashMap::new();
        let mut metrics = MetricsSnapshot::default();
        metrics
            .fields
            .insert(MIXED_AIR_TEMPERATURE.to_string(), Value::Number(30.0));
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 55.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = AirHandler.run(input);
        assert_eq!(out.results.get("heatingValvePosition"), Some(&Value::Number(100.0)));
        assert_eq!(out.results.get("outdoorDamperPosition"), Some(&Value::Number(0.0)));
        assert_eq!(out.results.get("freezestat"), Some(&Value::Bool(true)));
    }

    #[test]
    fn disabled_unit_zeroes_all_actuators() {
        let mut settings = HashMap::new();
        settings.insert("unitEnable".to_string(), Value::Bool(false));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 72.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = AirHandler.run(input);
        assert_eq!(out.results.get("fanEnabled"), Some(&Value::Bool(false)));
        assert_eq!(out.results.get("heatingValvePosition"), Some(&Value::Number(0.0)));
    }
}
