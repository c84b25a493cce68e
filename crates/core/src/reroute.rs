use crate::config::NavigationConfig;
use crate::geo::{LatLng, distance_to_polyline_m};
use crate::route::RouteProgress;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RerouteDecision {
    OnRoute,
    /// Off the route, but not for long enough yet or an attempt is blocked.
    OffRoute { deviation_m: f64 },
    /// Request a new route now. The monitor counts the attempt as in flight
    /// until [`RerouteMonitor::finish`] is called.
    Trigger { deviation_m: f64 },
}

/// How far a position is from the route, and whether that is off-route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    pub distance_m: f64,
    pub off_route: bool,
}

/// Measures deviation from the route polyline.
///
/// Uses the route geometry when there is one, else the chain of remaining
/// maneuver locations. With fewer than two points the distance to the
/// current maneuver is compared with the wider waypoint search radius.
pub fn deviation(progress: &RouteProgress, position: LatLng, config: &NavigationConfig) -> Option<Deviation> {
    if progress.is_complete() {
        return None;
    }

    let geometry = &progress.route().geometry;
    let polyline = if geometry.len() >= 2 {
        geometry.clone()
    } else {
        progress.remaining_waypoints()
    };

    if polyline.len() >= 2 {
        let distance_m = distance_to_polyline_m(position, &polyline)?;
        return Some(Deviation {
            distance_m,
            off_route: distance_m > config.off_route_distance_m,
        });
    }

    let step = progress.current_step()?;
    let distance_m = position.distance_to(&step.location);
    Some(Deviation {
        distance_m,
        off_route: distance_m > config.waypoint_search_radius_m,
    })
}

/// Per-session reroute bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct RerouteMonitor {
    off_route_since: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

impl RerouteMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn off_route_since(&self) -> Option<DateTime<Utc>> {
        self.off_route_since
    }

    pub fn evaluate(
        &mut self,
        progress: &RouteProgress,
        position: LatLng,
        now: DateTime<Utc>,
        config: &NavigationConfig,
    ) -> RerouteDecision {
        let Some(dev) = deviation(progress, position, config) else {
            self.off_route_since = None;
            return RerouteDecision::OnRoute;
        };

        if !dev.off_route {
            if self.off_route_since.take().is_some() {
                tracing::debug!("Back on route ({:.1}m from path)", dev.distance_m);
            }
            return RerouteDecision::OnRoute;
        }

        let since = *self.off_route_since.get_or_insert(now);
        let sustained = elapsed_at_least(since, now, config.reroute_dwell);
        let cooled_down = self
            .last_attempt_at
            .is_none_or(|last| elapsed_at_least(last, now, config.reroute_cooldown));

        if sustained && cooled_down && !self.in_flight {
            self.in_flight = true;
            self.last_attempt_at = Some(now);
            tracing::info!(
                "Off route by {:.1}m for {}s; requesting a new route",
                dev.distance_m,
                now.signed_duration_since(since).num_seconds()
            );
            RerouteDecision::Trigger {
                deviation_m: dev.distance_m,
            }
        } else {
            RerouteDecision::OffRoute {
                deviation_m: dev.distance_m,
            }
        }
    }

    /// Claims the in-flight slot for a client-requested reroute.
    pub fn begin_manual(&mut self, now: DateTime<Utc>) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        self.last_attempt_at = Some(now);
        true
    }

    /// Releases the in-flight slot after an attempt, successful or not.
    pub fn finish(&mut self, succeeded: bool) {
        self.in_flight = false;
        if succeeded {
            self.off_route_since = None;
        }
    }

    /// Forgets deviation history when a fresh route is installed.
    pub fn reset_for_new_route(&mut self) {
        self.off_route_since = None;
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, min: Duration) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .map(|elapsed| elapsed >= min)
        .unwrap_or(false)
}
