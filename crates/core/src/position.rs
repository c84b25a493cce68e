use crate::config::NavigationConfig;
use crate::geo::LatLng;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw GPS fix as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub position: LatLng,
    /// Reported accuracy radius in meters.
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(lat: f64, lng: f64, accuracy_m: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            position: LatLng::new(lat, lng),
            accuracy_m,
            timestamp,
        }
    }
}

/// Emitted when an accepted fix moved at least the effective threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementEvent {
    pub distance_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOutcome {
    /// First fix of the session; accepted without a movement event.
    Bootstrap,
    Accepted(MovementEvent),
    /// Below the effective threshold. The fix is still usable for
    /// distance-to-waypoint checks but is not evidence of movement.
    Rejected { distance_m: f64, threshold_m: f64 },
}

impl FilterOutcome {
    pub fn movement(&self) -> Option<MovementEvent> {
        match self {
            FilterOutcome::Accepted(event) => Some(*event),
            _ => None,
        }
    }
}

/// Per-session position state. Only [`PositionFilter::apply`] mutates it.
#[derive(Debug, Default, Clone)]
pub struct PositionFilter {
    last_accepted: Option<LatLng>,
    last_accepted_at: Option<DateTime<Utc>>,
    last_accuracy_m: Option<f64>,
    last_fix: Option<PositionFix>,
}

impl PositionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, fix: PositionFix, config: &NavigationConfig) -> FilterOutcome {
        self.last_fix = Some(fix);
        self.last_accuracy_m = Some(fix.accuracy_m);

        let Some(anchor) = self.last_accepted else {
            self.accept(fix);
            return FilterOutcome::Bootstrap;
        };

        let distance_m = anchor.distance_to(&fix.position);
        let threshold_m = effective_threshold(fix.accuracy_m, config);

        if distance_m >= threshold_m {
            self.accept(fix);
            FilterOutcome::Accepted(MovementEvent { distance_m })
        } else {
            tracing::debug!(
                "Discarding fix as jitter: moved {:.1}m (threshold {:.1}m)",
                distance_m,
                threshold_m
            );
            FilterOutcome::Rejected {
                distance_m,
                threshold_m,
            }
        }
    }

    fn accept(&mut self, fix: PositionFix) {
        self.last_accepted = Some(fix.position);
        self.last_accepted_at = Some(fix.timestamp);
    }

    pub fn last_accepted(&self) -> Option<LatLng> {
        self.last_accepted
    }

    pub fn last_accepted_at(&self) -> Option<DateTime<Utc>> {
        self.last_accepted_at
    }

    pub fn last_accuracy_m(&self) -> Option<f64> {
        self.last_accuracy_m
    }

    /// The most recent raw fix, accepted or not.
    pub fn last_fix(&self) -> Option<PositionFix> {
        self.last_fix
    }
}

/// Movement threshold for a fix with the given accuracy radius.
pub fn effective_threshold(accuracy_m: f64, config: &NavigationConfig) -> f64 {
    if accuracy_m.is_finite() && accuracy_m > config.degraded_accuracy_m {
        config
            .movement_threshold_m
            .max(accuracy_m + config.accuracy_margin_m)
    } else {
        config.movement_threshold_m
    }
}
