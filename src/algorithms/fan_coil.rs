/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{is_occupied, setting_bool, setting_f64, setting_str, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};
use crate::pid::{pid, PidParams};

/// §4.5.1. Room-or-supply temperature source, manual/auto actuators, two PID
/// loops (heating reverse-acting, cooling direct-acting), fan gated on
/// enable + occupancy.
pub struct FanCoil;

impl Algorithm for FanCoil {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp,
            mut state,
            now,
            dt_seconds,
            ..
        } = input;

        let unit_enable = setting_bool(settings, "unitEnable", true);
        let mode = setting_str(settings, "mode", "auto");
        let setpoint = setting_f64(settings, "setpoint", 72.0);
        let occupied = is_occupied(settings, now);
        let fan_enabled = unit_enable && occupied;

        let mut results = AlgorithmResult::new();
        results.insert("unitEnable".to_string(), Value::Bool(unit_enable));
        results.insert("fanEnabled".to_string(), Value::Bool(fan_enabled));
        results.insert(
            "fanSpeed".to_string(),
            Value::Text(fan_speed_for(fan_enabled, settings).to_string()),
        );
        results.insert("temperatureSetpoint".to_string(), Value::Number(setpoint));

        if !unit_enable {
            results.insert("heatingValvePosition".to_string(), Value::Number(0.0));
            results.insert("coolingValvePosition".to_string(), Value::Number(0.0));
            results.insert("outdoorDamperPosition".to_string(), Value::Number(0.0));
            return AlgorithmOutput { results, state };
        }

        let heating_manual = setting_str(settings, "heatingValveMode", "auto") == "manual";
        let heating_position = if heating_manual {
            setting_f64(settings, "heatingValvePosition", 0.0)
        } else if mode == "cooling" {
            0.0
        } else {
            let params = PidParams {
                reverse_acting: true,
                ..PidParams::default()
            };
            let loop_state = state.pid.get("heating").copied().unwrap_or_default();
            let (out, next) = pid(control_temp, setpoint, &params, dt_seconds, loop_state);
            state.pid.insert("heating".to_string(), next);
            out.output
        };

        let cooling_manual = setting_str(settings, "coolingValveMode", "auto") == "manual";
        let cooling_position = if cooling_manual {
            setting_f64(settings, "coolingValvePosition", 0.0)
        } else if mode == "heating" {
            0.0
        } else {
            let params = PidParams {
                reverse_acting: false,
                ..PidParams::default()
            };
            let loop_state = state.pid.get("cooling").copied().unwrap_or_default();
            let (out, next) = pid(control_temp, setpoint, &params, dt_seconds, loop_state);
            state.pid.insert("cooling".to_string(), next);
            out.output
        };

        let damper_manual = setting_str(settings, "outdoorDamperMode", "auto") == "manual";
        let damper_position = if damper_manual {
            setting_f64(settings, "outdoorDamperPosition", 0.0)
        } else {
            0.0
        };

        results.insert("heatingValvePosition".to_string(), Value::Number(heating_position));
        results.insert("coolingValvePosition".to_string(), Value::Number(cooling_position));
        results.insert("outdoorDamperPosition".to_string(), Value::Number(damper_position));

        AlgorithmOutput { results, state }
    }
}

fn fan_speed_for<'a>(fan_enabled: bool, settings: &'a std::collections::HashMap<String, Value>) -> &'a str {
    if !fan_enabled {
        return "off";
    }
    setting_str(settings, "fanSpeedSetting", "medium")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    fn weekday_occupied_now() -> chrono::DateTime<chrono_tz::Tz> {
        use chrono::TimeZone;
        chrono_tz::America::New_York
            .with_ymd_and_hms(2026, 7, 27, 9, 0, 0)
            .unwrap()
    }

    #[test]
    fn disabled_unit_forces_all_positions_to_zero() {
        let mut settings = HashMap::new();
        settings.insert("unitEnable".to_string(), Value::Bool(false));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 68.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: weekday_occupied_now(),
            dt_seconds: 60.0,
        };
        let out = FanCoil.run(input);
        assert_eq!(out.results.get("heatingValvePosition"), Some(&Value::Number(0.0)));
        assert_eq!(out.results.get("fanEnabled"), Some(&Value::Bool(false)));
    }

    #[test]
    fn cold_room_in_heating_mode_opens_heating_valve() {
        let mut settings = HashMap::new();
        settings.insert("mode".to_string(), Value::Text("heating".to_string()));
        settings.insert("setpoint".to_string(), Value::Number(72.0));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 60.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = FanCoil.run(input);
        let heating = out.results.get("heatingValvePosition").unwrap().as_f64().unwrap();
        assert!(heating > 0.0);
        assert_eq!(out.results.get("coolingValvePosition"), Some(&Value::Number(0.0)));
    }
}
