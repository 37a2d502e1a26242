/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{setting_bool, setting_f64, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};

/// §4.5.4. Outdoor lockout, fixed setpoint, two-stage enable, CW pump
/// enable; lead/lag mirrors the pump rules (lead always runs subject to
/// lockout, lag only on lead failure).
pub struct Chiller;

impl Algorithm for Chiller {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp,
            state,
            lead_lag,
            ..
        } = input;

        let lockout_temp = setting_f64(settings, "lockoutTemperature", 55.0);
        let locked_out = control_temp < lockout_temp;
        let setpoint = setting_f64(settings, "setpoint", 44.0);

        let should_run = !locked_out;
        let runs_this_tick = if lead_lag.is_lead {
            should_run
        } else {
            should_run && !lead_lag.lead_healthy
        };

        let stage2_threshold = setting_f64(settings, "stage2LoadThreshold", 80.0);
        let load_estimate = setting_f64(settings, "loadEstimatePercent", 0.0);
        let stage1 = runs_this_tick;
        let stage2 = runs_this_tick && load_estimate >= stage2_threshold;

        let mut results = AlgorithmResult::new();
        results.insert("chillerEnable".to_string(), Value::Bool(runs_this_tick));
        results.insert("chillerSetpoint".to_string(), Value::Number(setpoint));
        results.insert("stage1Enabled".to_string(), Value::Bool(stage1));
        results.insert("stage2Enabled".to_string(), Value::Bool(stage2));
        results.insert(
            "cwPumpEnable".to_string(),
            Value::Bool(runs_this_tick || setting_bool(settings, "cwPumpAlwaysOn", false)),
        );

        AlgorithmOutput { results, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    #[test]
    fn locks_out_below_threshold() {
        let mut settings = HashMap::new();
        settings.insert("lockoutTemperature".to_string(), Value::Number(55.0));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 50.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput {
                is_lead: true,
                lead_healthy: true,
            },
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = Chiller.run(input);
        assert_eq!(out.results.get("chillerEnable"), Some(&Value::Bool(false)));
    }

    #[test]
    fn stage2_engages_above_load_threshold() {
        let mut settings = HashMap::new();
        settings.insert("lockoutTemperature".to_string(), Value::Number(55.0));
        settings.insert("loadEstimatePercent".to_string(), Value::Number(90.0));
        let metrics = MetricsSnapshot::default();
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 70.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput {
                is_lead: true,
                lead_healthy: true,
            },
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = Chiller.run(input);
        assert_eq!(out.results.get("stage2Enabled"), Some(&Value::Bool(true)));
    }
}
