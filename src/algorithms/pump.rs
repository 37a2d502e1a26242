/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{setting_bool, setting_f64, setting_str, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Cw,
    Hw,
}

/// §4.5.3. Outdoor/supply/space source selection; per-kind hysteresis
/// thresholds; lockouts; lead-always-runs / lag-on-failure.
pub struct Pump {
    pub variant: Variant,
}

impl Algorithm for Pump {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp,
            mut state,
            lead_lag,
            ..
        } = input;

        let source = setting_str(settings, "operationSource", "outdoor");
        let exempt = setting_bool(settings, "lockoutExempt", false);

        let locked_out = if exempt {
            false
        } else {
            match self.variant {
                Variant::Cw => control_temp < 45.0,
                Variant::Hw => control_temp > 75.0,
            }
        };

        let is_on = if source == "outdoor" {
            hysteresis_on(self.variant, control_temp, state.hysteresis.is_on)
        } else {
            // supply/space-source selection: run whenever the selected temperature
            // reading is available and the pump isn't locked out; the specific
            // setpoint logic for those sources lives in the caller's controlTemp
            // selection (§4.9 step 2).
            !locked_out
        };
        state.hysteresis.is_on = is_on;

        let should_run = is_on && !locked_out;
        let runs_this_tick = if lead_lag.is_lead {
            should_run
        } else {
            // lag only runs if the lead has failed (§4.5.3)
            should_run && !lead_lag.lead_healthy
        };

        let mut results = AlgorithmResult::new();
        results.insert("pumpEnable".to_string(), Value::Bool(runs_this_tick));
        results.insert(
            "pumpSpeed".to_string(),
            Value::Number(if runs_this_tick {
                setting_f64(settings, "pumpSpeed", 100.0)
            } else {
                0.0
            }),
        );
        results.insert("isLead".to_string(), Value::Bool(lead_lag.is_lead));
        results.insert(
            "leadLagStatus".to_string(),
            Value::Text(
                if lead_lag.is_lead {
                    "lead"
                } else if runs_this_tick {
                    "lag-active"
                } else {
                    "lag-standby"
                }
                .to_string(),
            ),
        );

        AlgorithmOutput { results, state }
    }
}

/// CW turns on at >=37.5°F, off at <=36°F; HW turns on at <=74°F, off at
/// >=75°F (§4.5.3, §8 scenarios 3-4).
fn hysteresis_on(variant: Variant, outdoor: f64, currently_on: bool) -> bool {
    match variant {
        Variant::Cw => {
            if outdoor >= 37.5 {
                true
            } else if outdoor <= 36.0 {
                false
            } else {
                currently_on
            }
        }
        Variant::Hw => {
            if outdoor <= 74.0 {
                true
            } else if outdoor >= 75.0 {
                false
            } else {
                currently_on
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cw_hysteresis_seed_scenario() {
        assert!(hysteresis_on(Variant::Cw, 37.5, false));
        assert!(hysteresis_on(Variant::Cw, 37.0, true));
        assert!(!hysteresis_on(Variant::Cw, 36.0, true));
    }

    #[test]
    fn hw_hysteresis_seed_scenario() {
        assert!(hysteresis_on(Variant::Hw, 74.0, false));
        assert!(!hysteresis_on(Variant::Hw, 75.0, true));
    }

    #[test]
    fn cw_lockout_below_45() {
        use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
        use crate::metrics::MetricsSnapshot;
        use std::collections::HashMap;

        let settings = HashMap::new();
        let metrics = MetricsSnapshot::default();
        let pump = Pump { variant: Variant::Cw };
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 40.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput {
                is_lead: true,
                lead_healthy: true,
            },
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = pump.run(input);
        assert_eq!(out.results.get("pumpEnable"), Some(&Value::Bool(false)));
    }

    #[test]
    fn lag_stays_standby_while_lead_healthy() {
        use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
        use crate::metrics::MetricsSnapshot;
        use std::collections::HashMap;

        let settings = HashMap::new();
        let metrics = MetricsSnapshot::default();
        let pump = Pump { variant: Variant::Cw };
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: 38.0,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput {
                is_lead: false,
                lead_healthy: true,
            },
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        let out = pump.run(input);
        assert_eq!(out.results.get("pumpEnable"), Some(&Value::Bool(false)));
    }
}
