/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use serde::{Deserialize, Serialize};

/// Tuning and limits for a single PID loop (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output_min: f64,
    pub output_max: f64,
    /// Reverse-acting loops negate the error (e.g. heating valves: more
    /// output as the input falls further below setpoint).
    pub reverse_acting: bool,
    pub max_integral: f64,
    pub enabled: bool,
}

impl Default for PidParams {
    fn default() -> Self {
        PidParams {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            output_min: 0.0,
            output_max: 100.0,
            reverse_acting: false,
            max_integral: 100.0,
            enabled: true,
        }
    }
}

/// Persistent PID state for a single `(equipment, loop)` pair (§3). Monotonic
/// mutation by the algorithm; persists across ticks in the state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidState {
    pub integral: f64,
    pub previous_error: f64,
    pub last_output: f64,
}

/// The per-component output of one PID evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidOutput {
    pub output: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// Evaluates one PID step (§4.4). Pure function over `(input, setpoint,
/// params, dt, state)`: the caller owns persistence of the returned state.
///
/// When `enabled` is false the output is forced to zero and the input state
/// is returned unchanged -- the loop does not accumulate integral while
/// disabled.
pub fn pid(
    input: f64,
    setpoint: f64,
    params: &PidParams,
    dt: f64,
    state: PidState,
) -> (PidOutput, PidState) {
    if !params.enabled {
        return (
            PidOutput {
                output: 0.0,
                p: 0.0,
                i: 0.0,
                d: 0.0,
            },
            state,
        );
    }

    let raw_error = setpoint - input;
    let error = if params.reverse_acting {
        -raw_error
    } else {
        raw_error
    };

    let integral = (state.integral + error * dt).clamp(-params.max_integral, params.max_integral);
    let derivative = if dt > 0.0 {
        (error - state.previous_error) / dt
    } else {
        0.0
    };

    let p_term = params.kp * error;
    let i_term = params.ki * integral;
    let d_term = params.kd * derivative;
    let output = (p_term + i_term + d_term).clamp(params.output_min, params.output_max);

    let new_state = PidState {
        integral,
        previous_error: error,
        last_output: output,
    };
    (
        PidOutput {
            output,
            p: p_term,
            i: i_term,
            d: d_term,
        },
        new_state,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PidParams {
        PidParams {
            kp: 2.0,
            ki: 0.5,
            kd: 0.1,
            output_min: 0.0,
            output_max: 100.0,
            reverse_acting: false,
            max_integral: 50.0,
            enabled: true,
        }
    }

    #[test]
    fn direct_acting_positive_error_increases_output() {
        let (out, _state) = pid(60.0, 70.0, &params(), 1.0, PidState::default());
        assert!(out.output > 0.0);
    }

    #[test]
    fn reverse_acting_negates_error() {
        let mut p = params();
        p.reverse_acting = true;
        let (direct, _) = pid(60.0, 70.0, &params(), 1.0, PidState::default());
        let (reverse, _) = pid(60.0, 70.0, &p, 1.0, PidState::default());
        assert_eq!(direct.p, -reverse.p);
    }

    #[test]
    fn integral_clamps_to_max_integral() {
        let p = params();
        let mut state = PidState::default();
        for _ in 0..1000 {
            let (_out, next) = pid(0.0, 1000.0, &p, 1.0, state);
            state = next;
        }
        assert!(state.integral <= p.max_integral + f64::EPSILON);
        assert!(state.integral >= -p.max_integral - f64::EPSILON);
    }

    #[test]
    fn output_clamps_to_limits() {
        let p = params();
        let (out, _) = pid(-1000.0, 1000.0, &p, 1.0, PidState::default());
        assert_eq!(out.output, p.output_max);
    }

    #[test]
    fn disabled_loop_outputs_zero_and_freezes_state() {
        let mut p = params();
        p.enabled = false;
        let seed = PidState {
            integral: 5.0,
            previous_error: 1.0,
            last_output: 10.0,
        };
        let (out, state) = pid(60.0, 70.0, &p, 1.0, seed);
        assert_eq!(out.output, 0.0);
        assert_eq!(state, seed);
    }
}
