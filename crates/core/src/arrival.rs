//! Arrival confirmation state machine.
//!
//! Deciding that the user has reached a maneuver needs two independent kinds
//! of evidence: sustained proximity (consecutive in-radius samples) and real
//! displacement since the last advance. A lone GPS spike inside the radius
//! supplies neither; stationary drift inside the radius supplies only the
//! first. The transitions are pure so they can be exercised without clocks
//! or networking.

use serde::Serialize;

/// Parameters of the transition function.
#[derive(Debug, Clone, Copy)]
pub struct ArrivalRules {
    pub arrival_threshold_m: f64,
    pub required_confirmations: u32,
}

/// One observation of the current step.
#[derive(Debug, Clone, Copy)]
pub struct ArrivalSample {
    /// Distance from the latest fix to the step's maneuver location.
    pub distance_m: f64,
    /// At least one movement event since the last advance.
    pub moved_since_advance: bool,
    /// The minimum interval since the last advance has elapsed.
    pub dwell_elapsed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ArrivalPhase {
    Approaching,
    Confirming { confirmations: u32 },
    /// Transient: the tracker consumes it and moves to the next step.
    Advance,
    RouteComplete,
}

impl ArrivalPhase {
    pub fn confirmations(&self) -> u32 {
        match self {
            ArrivalPhase::Confirming { confirmations } => *confirmations,
            _ => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArrivalPhase::RouteComplete)
    }
}

/// Applies one sample to the current phase.
pub fn transition(phase: ArrivalPhase, sample: ArrivalSample, rules: &ArrivalRules) -> ArrivalPhase {
    match phase {
        ArrivalPhase::RouteComplete => ArrivalPhase::RouteComplete,
        // A stale Advance behaves like a fresh step.
        ArrivalPhase::Advance | ArrivalPhase::Approaching | ArrivalPhase::Confirming { .. } => {
            if sample.distance_m > rules.arrival_threshold_m {
                return ArrivalPhase::Approaching;
            }

            let confirmations = phase.confirmations().saturating_add(1);
            if confirmations >= rules.required_confirmations
                && sample.moved_since_advance
                && sample.dwell_elapsed
            {
                ArrivalPhase::Advance
            } else {
                ArrivalPhase::Confirming { confirmations }
            }
        }
    }
}
