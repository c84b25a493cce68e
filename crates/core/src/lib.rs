pub mod arrival;
pub mod config;
pub mod error;
pub mod geo;
pub mod navigator;
pub mod position;
pub mod refiner;
pub mod registry;
pub mod reroute;
pub mod route;
pub mod routing;
pub mod synthesizer;
pub mod vision;

pub use config::NavigationConfig;
pub use error::{NavError, NavResult};
pub use geo::LatLng;
pub use navigator::Navigator;

use serde::Serialize;

/// Events a session pushes to its subscribers.
///
/// Clients may either poll for instructions or listen to this stream and
/// poll only when something changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavEvent {
    /// The tracker moved on to step `index`.
    StepAdvanced { index: usize, instruction: String },
    /// The last maneuver was confirmed.
    RouteComplete,
    /// A new route replaced the old one and tracking restarted at step 0.
    Rerouted { steps: usize, summary: String },
    /// A reroute attempt failed; the previous route stays active.
    RerouteFailed { reason: String },
}
