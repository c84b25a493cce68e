//! Turns route progress and the latest vision signal into one spoken
//! instruction.
//!
//! Every instruction carries a distance and a step count. Text coming back
//! from the refiner is only used if it passes [`check_grounding`]; anything
//! else (an error, a timeout, an ungrounded sentence) is replaced by the
//! deterministic template from [`fallback_text`]. Results are cached per
//! `(step index, hazard fingerprint)` so repeated polls read back the same
//! sentence.

use crate::error::NavError;
use crate::geo::LatLng;
use crate::refiner::Refiner;
use crate::route::{ManeuverKind, RouteProgress};
use crate::vision::{HazardFingerprint, Heading, VisionSignal};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static FIGURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s*(meters?|metres?|m|steps?)\b").expect("figure pattern is valid")
});

static VISUAL_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(see|sees|seeing|look|looks|looking|watch|watching)\b")
        .expect("visual verb pattern is valid")
});

static SENTENCE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+\S").expect("sentence break pattern is valid"));

/// Everything the refiner and the template may draw on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionContext {
    pub step_index: usize,
    /// Maneuver phrase, e.g. "Turn left onto Elm Street".
    pub maneuver: String,
    pub distance_m: u32,
    pub steps: u32,
    /// Fresh hazards in detection order.
    pub hazards: Vec<String>,
    pub heading: Option<Heading>,
    pub sign_text: Option<String>,
    pub route_complete: bool,
    /// False while no fix has arrived and distances come from step lengths.
    pub location_known: bool,
}

impl InstructionContext {
    pub fn build(
        progress: &RouteProgress,
        position: Option<LatLng>,
        vision: Option<&VisionSignal>,
        now: DateTime<Utc>,
        stride_length_m: f64,
    ) -> Self {
        let remaining = progress.remaining_distance_m(position).max(0.0);
        let (maneuver, route_complete) = match progress.current_step() {
            Some(step) if step.maneuver.kind == ManeuverKind::Arrive => {
                ("arrive at your destination".to_string(), false)
            }
            Some(step) => (step.instruction(), false),
            None => ("You have arrived at your destination".to_string(), true),
        };

        let fresh = vision.and_then(|v| v.fresh(now));
        let hazards = fresh.map(|v| v.hazards.clone()).unwrap_or_default();
        // A heading is only meaningful for steering around something.
        let heading = fresh.and_then(|v| v.heading).filter(|_| !hazards.is_empty());
        let sign_text = fresh.and_then(|v| v.sign_text.clone());

        Self {
            step_index: progress.index(),
            maneuver,
            distance_m: remaining.round() as u32,
            steps: steps_for(remaining, stride_length_m),
            hazards,
            heading,
            sign_text,
            route_complete,
            location_known: position.is_some(),
        }
    }
}

/// Step estimate for walking `meters` with the given stride.
pub fn steps_for(meters: f64, stride_length_m: f64) -> u32 {
    if stride_length_m <= 0.0 || !meters.is_finite() {
        return 0;
    }
    (meters.max(0.0) / stride_length_m).floor() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionSource {
    Refined,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionResult {
    pub text: String,
    pub distance_m: u32,
    pub steps: u32,
    pub source: InstructionSource,
    pub step_index: usize,
    pub route_complete: bool,
    pub location_known: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    Timeout,
    Error(String),
    Ungrounded,
    /// The step or hazards kept changing while refinement was in flight.
    Contended,
}

/// Outcome of one refinement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Refinement {
    Refined(String),
    Fallback { text: String, reason: FallbackReason },
}

impl Refinement {
    pub fn fallback(context: &InstructionContext, reason: FallbackReason) -> Self {
        Refinement::Fallback {
            text: fallback_text(context),
            reason,
        }
    }

    pub fn into_result(self, context: &InstructionContext) -> InstructionResult {
        let (text, source) = match self {
            Refinement::Refined(text) => (text, InstructionSource::Refined),
            Refinement::Fallback { text, .. } => (text, InstructionSource::Fallback),
        };
        InstructionResult {
            text,
            distance_m: context.distance_m,
            steps: context.steps,
            source,
            step_index: context.step_index,
            route_complete: context.route_complete,
            location_known: context.location_known,
        }
    }
}

/// Why a refined sentence was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingError {
    Empty,
    MultipleSentences,
    MissingFigure,
    VisualVerb,
    ObstacleNotFirst,
}

/// Accepts `text` only if it is safe to speak for `context`.
pub fn check_grounding(text: &str, context: &InstructionContext) -> Result<(), GroundingError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(GroundingError::Empty);
    }
    if text.contains('\n') || SENTENCE_BREAK_RE.is_match(text) {
        return Err(GroundingError::MultipleSentences);
    }
    let Some(first_figure) = FIGURE_RE.find(text) else {
        return Err(GroundingError::MissingFigure);
    };
    if VISUAL_VERB_RE.is_match(text) {
        return Err(GroundingError::VisualVerb);
    }

    if !context.hazards.is_empty() {
        let lead = text[..first_figure.start()].to_lowercase();
        let named = lead.contains("obstacle")
            || context
                .hazards
                .iter()
                .any(|h| lead.contains(&h.to_lowercase()));
        if !named {
            return Err(GroundingError::ObstacleNotFirst);
        }
    }
    Ok(())
}

/// Deterministic instruction used whenever refinement is unavailable.
pub fn fallback_text(context: &InstructionContext) -> String {
    if context.route_complete {
        return "You have arrived at your destination, 0 meters, 0 steps remaining.".to_string();
    }

    let maneuver = lowercase_first(&context.maneuver);
    let mut text = if context.hazards.is_empty() {
        format!(
            "Walk {} steps, about {} meters, then {maneuver}",
            context.steps, context.distance_m
        )
    } else {
        let avoid = context
            .heading
            .map(|h| h.avoidance_phrase())
            .unwrap_or("Slow down");
        format!(
            "Obstacle ahead: {}, {}, then walk {} steps, about {} meters, and {maneuver}",
            context.hazards.join(" and "),
            lowercase_first(avoid),
            context.steps,
            context.distance_m
        )
    };

    if let Some(sign) = &context.sign_text {
        text.push_str(&format!(", near the sign reading {sign}"));
    }
    text.push('.');
    text
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub step_index: usize,
    pub fingerprint: HazardFingerprint,
}

/// Bounded per-session instruction cache.
#[derive(Debug)]
pub struct InstructionCache {
    entries: HashMap<CacheKey, InstructionResult>,
    order: VecDeque<CacheKey>,
    capacity: usize,
}

impl InstructionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&InstructionResult> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, result: InstructionResult) {
        if self.entries.insert(key.clone(), result).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drops entries for `index` and every earlier step.
    pub fn invalidate_index(&mut self, index: usize) {
        self.entries.retain(|k, _| k.step_index > index);
        self.order.retain(|k| k.step_index > index);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of the locked lookup phase of a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Hit(InstructionResult),
    Miss {
        key: CacheKey,
        context: InstructionContext,
    },
}

/// Instruction synthesis split into lock-friendly phases: [`prepare`] and
/// [`commit`] run under the session lock, [`refine`] runs without it.
///
/// [`prepare`]: InstructionSynthesizer::prepare
/// [`commit`]: InstructionSynthesizer::commit
/// [`refine`]: InstructionSynthesizer::refine
#[derive(Clone)]
pub struct InstructionSynthesizer {
    refiner: Arc<dyn Refiner>,
    timeout: Duration,
    stride_length_m: f64,
}

impl InstructionSynthesizer {
    pub fn new(refiner: Arc<dyn Refiner>, timeout: Duration, stride_length_m: f64) -> Self {
        Self {
            refiner,
            timeout,
            stride_length_m,
        }
    }

    pub fn key(
        progress: &RouteProgress,
        vision: Option<&VisionSignal>,
        now: DateTime<Utc>,
    ) -> CacheKey {
        CacheKey {
            step_index: progress.index(),
            fingerprint: HazardFingerprint::current(vision, now),
        }
    }

    pub fn prepare(
        &self,
        cache: &mut InstructionCache,
        progress: &RouteProgress,
        position: Option<LatLng>,
        vision: Option<&VisionSignal>,
        now: DateTime<Utc>,
    ) -> Prepared {
        let key = Self::key(progress, vision, now);
        if let Some(hit) = cache.get(&key) {
            return Prepared::Hit(hit.clone());
        }

        let context = InstructionContext::build(progress, position, vision, now, self.stride_length_m);
        if context.route_complete {
            // Arrival needs no refinement.
            let result = InstructionResult {
                text: fallback_text(&context),
                distance_m: 0,
                steps: 0,
                source: InstructionSource::Fallback,
                step_index: context.step_index,
                route_complete: true,
                location_known: context.location_known,
            };
            cache.insert(key, result.clone());
            return Prepared::Hit(result);
        }

        Prepared::Miss { key, context }
    }

    /// Calls the refiner with a bounded timeout and validates its answer.
    pub async fn refine(&self, context: &InstructionContext) -> Refinement {
        match tokio::time::timeout(self.timeout, self.refiner.refine(context)).await {
            Err(_) => {
                tracing::warn!(
                    "Refinement timed out after {:?} for step {}; using template",
                    self.timeout,
                    context.step_index
                );
                Refinement::fallback(context, FallbackReason::Timeout)
            }
            Ok(Err(e)) => {
                let err = NavError::RefinementUnavailable(e.to_string());
                tracing::warn!("{}; using template", err);
                Refinement::fallback(context, FallbackReason::Error(e.to_string()))
            }
            Ok(Ok(text)) => match check_grounding(&text, context) {
                Ok(()) => Refinement::Refined(text.trim().to_string()),
                Err(why) => {
                    tracing::warn!("Refined text rejected ({:?}): {:?}", why, text);
                    Refinement::fallback(context, FallbackReason::Ungrounded)
                }
            },
        }
    }

    /// Stores the outcome under `key`, unless a concurrent poll already did.
    pub fn commit(
        &self,
        cache: &mut InstructionCache,
        key: CacheKey,
        context: &InstructionContext,
        refinement: Refinement,
    ) -> InstructionResult {
        if let Some(existing) = cache.get(&key) {
            return existing.clone();
        }
        let result = refinement.into_result(context);
        cache.insert(key, result.clone());
        result
    }

    /// Single-owner synthesis for callers that hold the state exclusively.
    pub async fn synthesize(
        &self,
        cache: &mut InstructionCache,
        progress: &RouteProgress,
        position: Option<LatLng>,
        vision: Option<&VisionSignal>,
        now: DateTime<Utc>,
    ) -> InstructionResult {
        match self.prepare(cache, progress, position, vision, now) {
            Prepared::Hit(result) => result,
            Prepared::Miss { key, context } => {
                let refinement = self.refine(&context).await;
                self.commit(cache, key, &context, refinement)
            }
        }
    }
}
