/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use crate::algorithms::{setting_bool, setting_f64, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};

const DOMESTIC_DEFAULT_SETPOINT: f64 = 135.0;
const DOMESTIC_DEADBAND: f64 = 5.0;
const DOMESTIC_HIGH_LIMIT: f64 = 170.0;
const COMFORT_DEADBAND: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Comfort,
    Domestic,
}

/// §4.5.2. Domestic runs a fixed deadband year-round; comfort runs an OAR
/// curve feeding the same deadband logic. Each variant is self-contained
/// (§9 "reframe as strategy composition") -- neither reads the other's state.
pub struct Boiler {
    pub variant: Variant,
}

impl Algorithm for Boiler {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp,
            state,
            lead_lag,
            ..
        } = input;

        let (setpoint, enabled) = match self.variant {
            Variant::Domestic => {
                let sp = setting_f64(settings, "setpoint", DOMESTIC_DEFAULT_SETPOINT);
                (sp, true)
            }
            Variant::Comfort => comfort_setpoint(settings),
        };

        let mut results = AlgorithmResult::new();

        let high_limit = match self.variant {
            Variant::Domestic => DOMESTIC_HIGH_LIMIT,
            Variant::Comfort => setting_f64(settings, "highLimit", DOMESTIC_HIGH_LIMIT),
        };
        let over_high_limit = control_temp >= high_limit;

        let unit_enable = enabled && !over_high_limit;
        let deadband = match self.variant {
            Variant::Domestic => DOMESTIC_DEADBAND,
            Variant::Comfort => setting_f64(settings, "deadband", COMFORT_DEADBAND),
        };
        let firing = unit_enable && control_temp < (setpoint - deadband);

        results.insert("unitEnable".to_string(), Value::Bool(unit_enable));
        results.insert("firing".to_string(), Value::Number(if firing { 1.0 } else { 0.0 }));
        results.insert("waterTempSetpoint".to_string(), Value::Number(setpoint));
        results.insert(
            "isLead".to_string(),
            Value::Bool(setting_bool(settings, "isLead", lead_lag.is_lead)),
        );

        AlgorithmOutput { results, state }
    }
}

/// OAR curve (§4.5.2): linearly interpolate between `(minOAT, maxSupply)` and
/// `(maxOAT, minSupply)`; disabled at/above `maxOAT`. Honors a location's
/// already-decided override (`oarSetpoint`/`leadLagReason`) instead of
/// recomputing, per the design note on deferring to location-specific
/// decisions.
fn comfort_setpoint(settings: &std::collections::HashMap<String, Value>) -> (f64, bool) {
    if let Some(v) = settings.get("oarSetpoint").and_then(Value::as_f64) {
        return (v, true);
    }
    if settings.contains_key("leadLagReason") {
        let fallback = setting_f64(settings, "maxSupply", 155.0);
        return (fallback, true);
    }

    let min_oat = setting_f64(settings, "minOAT", 30.0);
    let max_oat = setting_f64(settings, "maxOAT", 75.0);
    let min_supply = setting_f64(settings, "minSupply", 80.0);
    let max_supply = setting_f64(settings, "maxSupply", 155.0);
    let outdoor = setting_f64(settings, "outdoorTemperature", min_oat);

    if outdoor >= max_oat {
        return (max_supply, false);
    }
    if outdoor <= min_oat {
        return (max_supply, true);
    }
    let fraction = (outdoor - min_oat) / (max_oat - min_oat);
    let setpoint = max_supply - fraction * (max_supply - min_supply);
    (setpoint, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    fn input<'a>(
        settings: &'a HashMap<String, Value>,
        metrics: &'a MetricsSnapshot,
        control_temp: f64,
    ) -> AlgorithmInput<'a> {
        AlgorithmInput {
            metrics,
            settings,
            control_temp,
            state: AlgorithmState::default(),
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        }
    }

    #[test]
    fn comfort_oar_seed_scenario() {
        let mut settings = HashMap::new();
        settings.insert("minOAT".to_string(), Value::Number(30.0));
        settings.insert("maxOAT".to_string(), Value::Number(75.0));
        settings.insert("minSupply".to_string(), Value::Number(80.0));
        settings.insert("maxSupply".to_string(), Value::Number(155.0));
        settings.insert("outdoorTemperature".to_string(), Value::Number(30.0));
        let metrics = MetricsSnapshot::default();
        let boiler = Boiler { variant: Variant::Comfort };
        let out = boiler.run(input(&settings, &metrics, 140.0));
        assert_eq!(out.results.get("waterTempSetpoint"), Some(&Value::Number(155.0)));
        assert_eq!(out.results.get("firing"), Some(&Value::Number(1.0)));
        assert_eq!(out.results.get("unitEnable"), Some(&Value::Bool(true)));
    }

    #[test]
    fn comfort_lockout_above_max_oat() {
        let mut settings = HashMap::new();
        settings.insert("maxOAT".to_string(), Value::Number(75.0));
        settings.insert("outdoorTemperature".to_string(), Value::Number(80.0));
        let metrics = MetricsSnapshot::default();
        let boiler = Boiler { variant: Variant::Comfort };
        let out = boiler.run(input(&settings, &metrics, 140.0));
        assert_eq!(out.results.get("unitEnable"), Some(&Value::Bool(false)));
        assert_eq!(out.results.get("firing"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn domestic_high_limit_cutoff() {
        let settings = HashMap::new();
        let metrics = MetricsSnapshot::default();
        let boiler = Boiler { variant: Variant::Domestic };
        let out = boiler.run(input(&settings, &metrics, 171.0));
        assert_eq!(out.results.get("unitEnable"), Some(&Value::Bool(false)));
    }

    #[test]
    fn location_override_defers_to_settings() {
        let mut settings = HashMap::new();
        settings.insert("oarSetpoint".to_string(), Value::Number(150.0));
        let metrics = MetricsSnapshot::default();
        let boiler = Boiler { variant: Variant::Comfort };
        let out = boiler.run(input(&settings, &metrics, 120.0));
        assert_eq!(out.results.get("waterTempSetpoint"), Some(&Value::Number(150.0)));
    }
}
