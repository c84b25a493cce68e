use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Direction the vision collaborator suggests to get around an obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heading {
    Left,
    SlightLeft,
    Straight,
    SlightRight,
    Right,
    Stop,
}

impl Heading {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(['-', '_'], " ").as_str() {
            "left" => Some(Self::Left),
            "slight left" | "slightly left" => Some(Self::SlightLeft),
            "straight" | "forward" | "ahead" => Some(Self::Straight),
            "slight right" | "slightly right" => Some(Self::SlightRight),
            "right" => Some(Self::Right),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// Phrase used in avoidance instructions, e.g. "Move slightly left".
    pub fn avoidance_phrase(&self) -> &'static str {
        match self {
            Self::Left => "Move left",
            Self::SlightLeft => "Move slightly left",
            Self::Straight => "Slow down",
            Self::SlightRight => "Move slightly right",
            Self::Right => "Move right",
            Self::Stop => "Stop",
        }
    }

    fn as_key(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::SlightLeft => "slight_left",
            Self::Straight => "straight",
            Self::SlightRight => "slight_right",
            Self::Right => "right",
            Self::Stop => "stop",
        }
    }
}

/// A perishable observation from the vision collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionSignal {
    /// Obstacle names in detection order. Empty means the path is clear.
    pub hazards: Vec<String>,
    pub heading: Option<Heading>,
    pub sign_text: Option<String>,
    pub received_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl VisionSignal {
    pub fn new(
        hazards: Vec<String>,
        heading: Option<Heading>,
        sign_text: Option<String>,
        received_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let hazards = hazards
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        let sign_text = sign_text
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            hazards,
            heading,
            sign_text,
            received_at,
            ttl,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.received_at).to_std() {
            Ok(age) => age >= self.ttl,
            // Received "in the future" relative to `now`: still fresh.
            Err(_) => false,
        }
    }

    /// The signal if still fresh at `now`.
    pub fn fresh(&self, now: DateTime<Utc>) -> Option<&VisionSignal> {
        (!self.is_stale(now)).then_some(self)
    }

    pub fn fingerprint(&self) -> HazardFingerprint {
        HazardFingerprint::of(&self.hazards, self.heading)
    }
}

/// Order-insensitive identity of a hazard set, used in instruction cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HazardFingerprint(String);

impl HazardFingerprint {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(hazards: &[String], heading: Option<Heading>) -> Self {
        let mut names: Vec<String> = hazards
            .iter()
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if names.is_empty() {
            return Self::empty();
        }
        names.sort();
        names.dedup();

        let mut key = names.join("|");
        if let Some(heading) = heading {
            key.push('@');
            key.push_str(heading.as_key());
        }
        Self(key)
    }

    /// Fingerprint of whatever is still fresh in `signal` at `now`.
    pub fn current(signal: Option<&VisionSignal>, now: DateTime<Utc>) -> Self {
        signal
            .and_then(|s| s.fresh(now))
            .map(VisionSignal::fingerprint)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
