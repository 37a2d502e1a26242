/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use chrono::Utc;

use crate::algorithms::{setting_f64, Algorithm, AlgorithmInput, AlgorithmOutput};
use crate::control::{AlgorithmResult, Value};

const DEFAULT_DEADBAND: f64 = 1.75;
const DEFAULT_STAGE_INCREMENT: f64 = 2.0;
const MIN_RUNTIME: chrono::Duration = chrono::Duration::seconds(180);
const MAX_STAGES: u8 = 4;

/// §4.5.7. Four-stage hysteresis around a loop-temperature setpoint, with a
/// configurable deadband and stage increment, a 180s minimum runtime per
/// stage, and year-round operation (at least one stage always active). The
/// random start-stage rotation (§4.5.7 "equalize wear") is computed once by
/// the caller and carried in `rotation_offset`, keeping this function pure.
pub struct Geothermal;

impl Algorithm for Geothermal {
    fn run(&self, input: AlgorithmInput) -> AlgorithmOutput {
        let AlgorithmInput {
            settings,
            control_temp: loop_temp,
            mut state,
            now,
            ..
        } = input;

        let setpoint = setting_f64(settings, "setpoint", 45.0);
        let deadband = setting_f64(settings, "deadband", DEFAULT_DEADBAND);
        let stage_increment = setting_f64(settings, "stageIncrement", DEFAULT_STAGE_INCREMENT);
        let rotation_offset = setting_f64(settings, "rotationOffset", 0.0) as u8 % MAX_STAGES;

        let now_utc = now.with_timezone(&Utc);
        let runtime_elapsed = state
            .stage_entered_at
            .is_none_or(|entered| now_utc - entered >= MIN_RUNTIME);

        let mut active_stages = state.stage.max(1).min(MAX_STAGES);
        if state.stage == 0 {
            active_stages = 1;
        }

        if runtime_elapsed {
            let increase_threshold = setpoint + deadband + f64::from(active_stages) * stage_increment;
            let decrease_threshold = setpoint + deadband + f64::from(active_stages.saturating_sub(2)) * stage_increment;

            if loop_temp > increase_threshold && active_stages < MAX_STAGES {
                active_stages += 1;
                state.stage_entered_at = Some(now_utc);
            } else if active_stages > 1 && loop_temp < decrease_threshold {
                active_stages -= 1;
                state.stage_entered_at = Some(now_utc);
            }
        }
        if state.stage_entered_at.is_none() {
            state.stage_entered_at = Some(now_utc);
        }
        state.stage = active_stages;

        let mut results = AlgorithmResult::new();
        for physical in 1..=MAX_STAGES {
            let logical = ((u16::from(physical) + u16::from(rotation_offset) - 1) % u16::from(MAX_STAGES)) + 1;
            let enabled = logical as u8 <= active_stages;
            results.insert(format!("stage{physical}Enabled"), Value::Bool(enabled));
        }
        results.insert("targetSetpoint".to_string(), Value::Number(setpoint));
        results.insert("loopTemp".to_string(), Value::Number(loop_temp));

        AlgorithmOutput { results, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{eastern_now, AlgorithmState, LeadLagInput};
    use crate::metrics::MetricsSnapshot;
    use std::collections::HashMap;

    fn run_once(loop_temp: f64, state: AlgorithmState, elapsed_secs: i64) -> AlgorithmOutput {
        let mut settings = HashMap::new();
        settings.insert("setpoint".to_string(), Value::Number(45.0));
        settings.insert("deadband".to_string(), Value::Number(1.75));
        settings.insert("stageIncrement".to_string(), Value::Number(2.0));
        let metrics = MetricsSnapshot::default();
        let mut state = state;
        if let Some(entered) = state.stage_entered_at {
            state.stage_entered_at = Some(entered - chrono::Duration::seconds(elapsed_secs));
        }
        let input = AlgorithmInput {
            metrics: &metrics,
            settings: &settings,
            control_temp: loop_temp,
            state,
            lead_lag: LeadLagInput::default(),
            now: eastern_now(chrono::Utc::now()),
            dt_seconds: 60.0,
        };
        Geothermal.run(input)
    }

    #[test]
    fn staging_progresses_through_seed_readings() {
        let mut state = AlgorithmState::default();
        for (reading, expected) in [(47.0, 1u8), (49.0, 2), (51.0, 3), (53.0, 4)] {
            let out = run_once(reading, state.clone(), 200);
            assert_eq!(out.state.stage, expected, "reading {reading}");
            state = out.state;
        }
    }

    #[test]
    fn minimum_runtime_blocks_immediate_restage() {
        let mut state = AlgorithmState::default();
        let first = run_once(47.0, state.clone(), 200);
        state = first.state;
        assert_eq!(state.stage, 1);
        let second = run_once(60.0, state, 10);
        assert_eq!(second.state.stage, 1, "should not restage before min runtime elapses");
    }

    #[test]
    fn stages_fall_back_down_over_successive_ticks() {
        let mut state = AlgorithmState::default();
        for reading in [47.0, 49.0, 51.0, 53.0] {
            state = run_once(reading, state.clone(), 200).state;
        }
        assert_eq!(state.stage, 4);
        for _ in 0..3 {
            state = run_once(46.0, state.clone(), 200).state;
        }
        assert_eq!(state.stage, 1);
    }
}
