//! Engine tunables.
//!
//! Every threshold the navigation engine applies lives here so the service
//! layer can override it from the environment. The defaults are the values
//! observed to suppress GPS jitter for pedestrians without delaying genuine
//! step changes.

use std::time::Duration;

/// Minimum displacement between accepted fixes that counts as real movement.
pub const DEFAULT_MOVEMENT_THRESHOLD_M: f64 = 8.0;
/// Fixes reporting an accuracy radius above this are treated as degraded.
pub const DEFAULT_DEGRADED_ACCURACY_M: f64 = 20.0;
/// Added to a degraded fix's accuracy radius to form its movement threshold.
pub const DEFAULT_ACCURACY_MARGIN_M: f64 = 5.0;
/// Distance to a maneuver location that counts as "at" the waypoint.
pub const DEFAULT_ARRIVAL_THRESHOLD_M: f64 = 25.0;
pub const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 2;
/// Average walking stride used to turn meters into a step count.
pub const DEFAULT_STRIDE_LENGTH_M: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct NavigationConfig {
    pub movement_threshold_m: f64,
    pub degraded_accuracy_m: f64,
    pub accuracy_margin_m: f64,
    pub arrival_threshold_m: f64,
    pub required_confirmations: u32,
    /// Minimum time between two step advances.
    pub min_advance_interval: Duration,
    pub stride_length_m: f64,
    pub refiner_timeout: Duration,
    pub routing_timeout: Duration,
    /// Deviation from the route polyline that counts as off-route.
    pub off_route_distance_m: f64,
    /// Used instead of the polyline when the route has fewer than two points.
    pub waypoint_search_radius_m: f64,
    /// How long the user must stay off-route before a reroute is requested.
    pub reroute_dwell: Duration,
    pub reroute_cooldown: Duration,
    /// TTL applied to vision signals that do not carry their own.
    pub vision_ttl: Duration,
    pub session_idle_ttl: Duration,
    /// Upper bound on cached instructions per session.
    pub instruction_cache_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: DEFAULT_MOVEMENT_THRESHOLD_M,
            degraded_accuracy_m: DEFAULT_DEGRADED_ACCURACY_M,
            accuracy_margin_m: DEFAULT_ACCURACY_MARGIN_M,
            arrival_threshold_m: DEFAULT_ARRIVAL_THRESHOLD_M,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            min_advance_interval: Duration::from_secs(8),
            stride_length_m: DEFAULT_STRIDE_LENGTH_M,
            refiner_timeout: Duration::from_secs(3),
            routing_timeout: Duration::from_secs(10),
            off_route_distance_m: 40.0,
            waypoint_search_radius_m: 100.0,
            reroute_dwell: Duration::from_secs(10),
            reroute_cooldown: Duration::from_secs(30),
            vision_ttl: Duration::from_secs(5),
            session_idle_ttl: Duration::from_secs(30 * 60),
            instruction_cache_capacity: 32,
            event_channel_capacity: 64,
        }
    }
}
