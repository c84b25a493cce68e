use crate::arrival::{self, ArrivalPhase, ArrivalRules, ArrivalSample};
use crate::config::NavigationConfig;
use crate::geo::LatLng;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverKind {
    Depart,
    Arrive,
    Turn,
    EndOfRoad,
    Continue,
    NewName,
    Notification,
    Fork,
    Merge,
    Roundabout,
    UTurn,
    Other(String),
}

impl ManeuverKind {
    /// Parses an OSRM maneuver type such as `"end of road"`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "depart" => ManeuverKind::Depart,
            "arrive" => ManeuverKind::Arrive,
            "turn" => ManeuverKind::Turn,
            "end of road" => ManeuverKind::EndOfRoad,
            "continue" => ManeuverKind::Continue,
            "new name" => ManeuverKind::NewName,
            "notification" => ManeuverKind::Notification,
            "fork" => ManeuverKind::Fork,
            "merge" => ManeuverKind::Merge,
            "roundabout" | "rotary" | "roundabout turn" => ManeuverKind::Roundabout,
            "u-turn" | "uturn" => ManeuverKind::UTurn,
            other => ManeuverKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverModifier {
    Left,
    Right,
    SlightLeft,
    SlightRight,
    SharpLeft,
    SharpRight,
    Straight,
    UTurn,
}

impl ManeuverModifier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "slight left" => Some(Self::SlightLeft),
            "slight right" => Some(Self::SlightRight),
            "sharp left" => Some(Self::SharpLeft),
            "sharp right" => Some(Self::SharpRight),
            "straight" => Some(Self::Straight),
            "uturn" | "u-turn" => Some(Self::UTurn),
            _ => None,
        }
    }

    fn words(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::SlightLeft => "slight left",
            Self::SlightRight => "slight right",
            Self::SharpLeft => "sharp left",
            Self::SharpRight => "sharp right",
            Self::Straight => "straight",
            Self::UTurn => "around",
        }
    }

    fn is_plain_side(&self) -> bool {
        matches!(self, Self::Left | Self::Right)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maneuver {
    pub kind: ManeuverKind,
    pub modifier: Option<ManeuverModifier>,
    /// Roundabout exit number, when the maneuver has one.
    pub exit: Option<u32>,
}

impl Maneuver {
    pub fn new(kind: ManeuverKind, modifier: Option<ManeuverModifier>) -> Self {
        Self {
            kind,
            modifier,
            exit: None,
        }
    }

    /// Short imperative phrase for this maneuver, e.g. "Turn left onto Main Street".
    pub fn describe(&self, street: Option<&str>) -> String {
        let street = street.map(str::trim).filter(|s| !s.is_empty());
        let onto = street.map(|s| format!(" onto {s}")).unwrap_or_default();
        let modifier = self.modifier;

        match &self.kind {
            ManeuverKind::Depart => match street {
                Some(s) => format!("Start on {s}"),
                None => "Start and go straight".to_string(),
            },
            ManeuverKind::Arrive => match modifier {
                Some(ManeuverModifier::Left) => "You have arrived on the left".to_string(),
                Some(ManeuverModifier::Right) => "You have arrived on the right".to_string(),
                _ => "You have arrived".to_string(),
            },
            ManeuverKind::Turn | ManeuverKind::EndOfRoad => match modifier {
                Some(ManeuverModifier::SlightLeft) => format!("Turn slightly left{onto}"),
                Some(ManeuverModifier::SlightRight) => format!("Turn slightly right{onto}"),
                Some(ManeuverModifier::SharpLeft) => format!("Turn sharply left{onto}"),
                Some(ManeuverModifier::SharpRight) => format!("Turn sharply right{onto}"),
                Some(m) if m.is_plain_side() => format!("Turn {}{onto}", m.words()),
                Some(ManeuverModifier::UTurn) => "Make a U-turn and continue".to_string(),
                _ => format!("Turn{onto}"),
            },
            ManeuverKind::Continue | ManeuverKind::NewName | ManeuverKind::Notification => {
                format!("Continue straight{onto}")
            }
            ManeuverKind::Fork => match modifier {
                Some(m) if m.is_plain_side() => format!("Keep {}{onto}", m.words()),
                _ => format!("Keep to the main path{onto}"),
            },
            ManeuverKind::Merge => match modifier {
                Some(m) if m.is_plain_side() => format!("Merge {}{onto}", m.words()),
                _ => format!("Merge{onto}"),
            },
            ManeuverKind::Roundabout => match (self.exit, modifier) {
                (Some(exit), _) => {
                    format!("At the roundabout, take the {} exit{onto}", ordinal(exit))
                }
                (None, Some(m)) => format!("At the roundabout, go {}{onto}", m.words()),
                (None, None) => format!("At the roundabout, proceed straight{onto}"),
            },
            ManeuverKind::UTurn => "Make a U-turn and continue".to_string(),
            ManeuverKind::Other(_) => format!("Continue{onto}"),
        }
    }
}

fn ordinal(n: u32) -> String {
    let suffix = if (11..=13).contains(&(n % 100)) {
        "th"
    } else {
        match n % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        }
    };
    format!("{n}{suffix}")
}

/// One upcoming maneuver and the walk leading to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub index: usize,
    pub maneuver: Maneuver,
    pub street_name: Option<String>,
    /// Distance from the start of this step to its maneuver.
    pub distance_m: f64,
    pub duration_s: f64,
    pub location: LatLng,
}

impl RouteStep {
    pub fn instruction(&self) -> String {
        self.maneuver.describe(self.street_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub steps: Vec<RouteStep>,
    /// Full route polyline; may be empty if the provider returned none.
    pub geometry: Vec<LatLng>,
    pub distance_m: f64,
    pub duration_s: f64,
}

impl Route {
    pub fn new(steps: Vec<RouteStep>, geometry: Vec<LatLng>, distance_m: f64, duration_s: f64) -> Self {
        Self {
            steps,
            geometry,
            distance_m,
            duration_s,
        }
    }

    /// Spoken summary, e.g. "The route is 850 meters and will take approximately 11 minutes".
    pub fn summary(&self) -> String {
        let distance = if self.distance_m < 1000.0 {
            format!("{} meters", self.distance_m.max(0.0) as u64)
        } else {
            format!("{:.1} kilometers", self.distance_m / 1000.0)
        };

        let minutes = (self.duration_s.max(0.0) / 60.0) as u64;
        let duration = if minutes < 60 {
            format!("{minutes} minutes")
        } else {
            let hours = minutes / 60;
            let plural = if hours > 1 { "s" } else { "" };
            format!("{hours} hour{plural} and {} minutes", minutes % 60)
        };

        format!("The route is {distance} and will take approximately {duration}")
    }
}

/// Result of feeding one fix to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Unchanged,
    Advanced { index: usize },
    Completed,
}

/// Progress along an installed route.
///
/// The step index only ever grows. Replacing the route means building a new
/// `RouteProgress`.
#[derive(Debug, Clone)]
pub struct RouteProgress {
    route: Route,
    index: usize,
    phase: ArrivalPhase,
    moved_since_advance: bool,
    last_advance_at: Option<DateTime<Utc>>,
}

impl RouteProgress {
    pub fn new(route: Route) -> Self {
        let phase = if route.steps.is_empty() {
            ArrivalPhase::RouteComplete
        } else {
            ArrivalPhase::Approaching
        };
        Self {
            route,
            index: 0,
            phase,
            moved_since_advance: false,
            last_advance_at: None,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn phase(&self) -> ArrivalPhase {
        self.phase
    }

    pub fn confirmations(&self) -> u32 {
        self.phase.confirmations()
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn current_step(&self) -> Option<&RouteStep> {
        if self.is_complete() {
            None
        } else {
            self.route.steps.get(self.index)
        }
    }

    /// Maneuver locations from the current step onward.
    pub fn remaining_waypoints(&self) -> Vec<LatLng> {
        self.route
            .steps
            .iter()
            .skip(self.index)
            .map(|s| s.location)
            .collect()
    }

    /// Distance to the current maneuver from `from`, or the step's own
    /// length when no position is known.
    pub fn remaining_distance_m(&self, from: Option<LatLng>) -> f64 {
        match (self.current_step(), from) {
            (Some(step), Some(position)) => position.distance_to(&step.location),
            (Some(step), None) => step.distance_m,
            (None, _) => 0.0,
        }
    }

    /// Evaluates one filtered fix. `moved` is true when the filter emitted a
    /// movement event for it.
    pub fn observe(
        &mut self,
        position: LatLng,
        moved: bool,
        at: DateTime<Utc>,
        config: &NavigationConfig,
    ) -> StepOutcome {
        let Some(location) = self.current_step().map(|s| s.location) else {
            return StepOutcome::Unchanged;
        };

        if moved {
            self.moved_since_advance = true;
        }

        let distance_m = position.distance_to(&location);
        let dwell_elapsed = match self.last_advance_at {
            None => true,
            Some(last) => at
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed >= config.min_advance_interval)
                .unwrap_or(false),
        };

        let rules = ArrivalRules {
            arrival_threshold_m: config.arrival_threshold_m,
            required_confirmations: config.required_confirmations,
        };
        let sample = ArrivalSample {
            distance_m,
            moved_since_advance: self.moved_since_advance,
            dwell_elapsed,
        };

        let next = arrival::transition(self.phase, sample, &rules);
        tracing::debug!(
            "Step {} at {:.1}m: {:?} -> {:?}",
            self.index,
            distance_m,
            self.phase,
            next
        );

        if next != ArrivalPhase::Advance {
            self.phase = next;
            return StepOutcome::Unchanged;
        }

        self.advance(at)
    }

    /// Moves past the current step without waiting for arrival, as when the
    /// walker confirms the maneuver themselves. No-op once complete.
    pub fn skip_step(&mut self, at: DateTime<Utc>) -> StepOutcome {
        if self.is_complete() {
            return StepOutcome::Unchanged;
        }
        tracing::info!("Step {} skipped on request", self.index);
        self.advance(at)
    }

    fn advance(&mut self, at: DateTime<Utc>) -> StepOutcome {
        self.index += 1;
        self.moved_since_advance = false;
        self.last_advance_at = Some(at);

        if self.index >= self.route.steps.len() {
            self.index = self.route.steps.len();
            self.phase = ArrivalPhase::RouteComplete;
            tracing::info!("Route complete after {} steps", self.route.steps.len());
            StepOutcome::Completed
        } else {
            self.phase = ArrivalPhase::Approaching;
            tracing::info!("Advanced to step {}", self.index);
            StepOutcome::Advanced { index: self.index }
        }
    }
}
