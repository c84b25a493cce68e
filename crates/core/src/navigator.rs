use crate::NavEvent;
use crate::arrival::ArrivalPhase;
use crate::config::NavigationConfig;
use crate::error::{NavError, NavResult};
use crate::geo::LatLng;
use crate::position::{FilterOutcome, PositionFix};
use crate::refiner::Refiner;
use crate::registry::{SessionRegistry, SessionSlot};
use crate::reroute::RerouteDecision;
use crate::route::{Route, StepOutcome};
use crate::routing::RouteProvider;
use crate::synthesizer::{
    FallbackReason, InstructionResult, InstructionSynthesizer, Prepared, Refinement,
};
use crate::vision::{Heading, VisionSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Refinement is retried at most this many times when the cache key moves
/// underneath it; the last attempt commits the template under the lock.
const MAX_SYNTHESIS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub summary: String,
    pub distance_m: f64,
    pub duration_s: f64,
    pub total_steps: usize,
    pub first_instruction: Option<String>,
}

impl RouteSummary {
    fn of(route: &Route) -> Self {
        Self {
            summary: route.summary(),
            distance_m: route.distance_m,
            duration_s: route.duration_s,
            total_steps: route.steps.len(),
            first_instruction: route.steps.first().map(|s| s.instruction()),
        }
    }
}

/// What a position update did to the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionUpdate {
    /// False when the fix was discarded as jitter.
    pub accepted: bool,
    pub moved_m: Option<f64>,
    pub step_index: Option<usize>,
    pub advanced: bool,
    pub route_complete: bool,
    pub rerouted: bool,
    /// Non-fatal problem, e.g. a failed reroute.
    pub warning: Option<String>,
}

/// Result of a client-requested step advance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepUpdate {
    /// False once the route is already complete.
    pub advanced: bool,
    pub step_index: usize,
    pub route_complete: bool,
    pub current_maneuver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VisionUpdate {
    #[serde(default)]
    pub hazards: Vec<String>,
    #[serde(default)]
    pub heading: Option<Heading>,
    #[serde(default)]
    pub sign_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub navigating: bool,
    pub step_index: Option<usize>,
    pub total_steps: usize,
    pub phase: Option<ArrivalPhase>,
    pub confirmations: u32,
    pub route_complete: bool,
    pub current_maneuver: Option<String>,
    pub remaining_distance_m: Option<f64>,
    pub destination: Option<LatLng>,
    pub last_position: Option<LatLng>,
    pub last_accuracy_m: Option<f64>,
    pub hazards: Vec<String>,
    pub reroute_in_flight: bool,
}

/// Client-facing navigation engine.
///
/// Each operation locates the caller's session in the registry and works on
/// it under its own lock. Routing and refinement calls run with the lock
/// released; their results are only committed if the session is still open
/// and its route has not been replaced meanwhile.
pub struct Navigator {
    registry: SessionRegistry,
    router: Arc<dyn RouteProvider>,
    synthesizer: InstructionSynthesizer,
    config: NavigationConfig,
}

impl Navigator {
    pub fn new(
        router: Arc<dyn RouteProvider>,
        refiner: Arc<dyn Refiner>,
        config: NavigationConfig,
    ) -> Self {
        let synthesizer =
            InstructionSynthesizer::new(refiner, config.refiner_timeout, config.stride_length_m);
        Self {
            registry: SessionRegistry::new(config.clone()),
            router,
            synthesizer,
            config,
        }
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Fetches a route and installs it as the session's active route.
    ///
    /// Without an explicit `origin` the session's last fix is used.
    pub async fn start_navigation(
        &self,
        id: &str,
        origin: Option<LatLng>,
        destination: LatLng,
        now: DateTime<Utc>,
    ) -> NavResult<RouteSummary> {
        if !destination.is_valid() {
            return Err(NavError::InvalidInput("destination is not a valid coordinate".into()));
        }
        if origin.is_some_and(|o| !o.is_valid()) {
            return Err(NavError::InvalidInput("origin is not a valid coordinate".into()));
        }

        let slot = self.registry.create_or_get(id, now).await;
        let origin = match origin {
            Some(origin) => origin,
            None => slot
                .lock()
                .await?
                .filter
                .last_fix()
                .map(|f| f.position)
                .ok_or(NavError::LocationUnavailable)?,
        };

        let route = fetch_route(
            self.router.as_ref(),
            origin,
            destination,
            self.config.routing_timeout,
        )
        .await?;
        let summary = RouteSummary::of(&route);

        let mut session = slot.lock().await?;
        session.install_route(route, destination);
        tracing::info!(
            "Session {} navigating: {} ({} steps)",
            id,
            summary.summary,
            summary.total_steps
        );
        Ok(summary)
    }

    /// Applies one raw fix. `now` is the server receive time and only feeds
    /// the idle clock; filtering, dwell and rerouting run on `fix.timestamp`.
    pub async fn post_position(
        &self,
        id: &str,
        fix: PositionFix,
        now: DateTime<Utc>,
    ) -> NavResult<PositionUpdate> {
        if !fix.position.is_valid() || !fix.accuracy_m.is_finite() || fix.accuracy_m < 0.0 {
            return Err(NavError::InvalidInput("position fix is out of range".into()));
        }

        let slot = self.registry.get(id).await?;
        slot.touch(now);

        let (mut update, pending_reroute) = {
            let mut guard = slot.lock().await?;
            let session = &mut *guard;

            let outcome = session.filter.apply(fix, &self.config);
            let moved = outcome.movement();
            let mut update = PositionUpdate {
                accepted: !matches!(outcome, FilterOutcome::Rejected { .. }),
                moved_m: moved.map(|m| m.distance_m),
                ..Default::default()
            };
            let mut pending_reroute = None;

            if let Some(progress) = session.progress.as_mut() {
                match progress.observe(fix.position, moved.is_some(), fix.timestamp, &self.config) {
                    StepOutcome::Advanced { index } => {
                        session.cache.invalidate_index(index);
                        update.advanced = true;
                        slot.emit(NavEvent::StepAdvanced {
                            index,
                            instruction: progress
                                .current_step()
                                .map(|s| s.instruction())
                                .unwrap_or_default(),
                        });
                    }
                    StepOutcome::Completed => {
                        session.cache.invalidate_index(progress.index());
                        update.advanced = true;
                        slot.emit(NavEvent::RouteComplete);
                    }
                    StepOutcome::Unchanged => {}
                }
                update.step_index = Some(progress.index());
                update.route_complete = progress.is_complete();

                let decision =
                    session
                        .reroute
                        .evaluate(progress, fix.position, fix.timestamp, &self.config);
                if let RerouteDecision::Trigger { .. } = decision {
                    match session.destination {
                        Some(destination) => {
                            pending_reroute = Some((destination, session.route_epoch));
                        }
                        None => session.reroute.finish(false),
                    }
                }
            }
            (update, pending_reroute)
        };

        if let Some((destination, epoch)) = pending_reroute {
            match self.spawn_reroute(&slot, fix.position, destination, epoch).await {
                Ok(summary) => {
                    update.rerouted = true;
                    update.step_index = Some(0);
                    update.route_complete = summary.total_steps == 0;
                }
                Err(e @ NavError::SessionNotFound(_)) => return Err(e),
                Err(e) => update.warning = Some(e.to_string()),
            }
        }

        Ok(update)
    }

    pub async fn post_vision(
        &self,
        id: &str,
        update: VisionUpdate,
        now: DateTime<Utc>,
    ) -> NavResult<()> {
        let slot = self.registry.get(id).await?;
        slot.touch(now);
        let signal = VisionSignal::new(
            update.hazards,
            update.heading,
            update.sign_text,
            now,
            self.config.vision_ttl,
        );
        tracing::debug!(
            "Session {} vision: {} hazard(s), heading {:?}",
            id,
            signal.hazards.len(),
            signal.heading
        );
        slot.lock().await?.vision = Some(signal);
        Ok(())
    }

    /// Current instruction for the session. Same text while neither the
    /// step nor the fresh hazard set changes.
    pub async fn poll_instruction(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> NavResult<InstructionResult> {
        let slot = self.registry.get(id).await?;
        slot.touch(now);

        let mut attempt = 1;
        loop {
            let (key, context, epoch) = {
                let mut guard = slot.lock().await?;
                let session = &mut *guard;
                let progress = session
                    .progress
                    .as_ref()
                    .ok_or_else(|| NavError::RouteUnavailable("no active route".into()))?;
                let position = session.filter.last_fix().map(|f| f.position);

                match self.synthesizer.prepare(
                    &mut session.cache,
                    progress,
                    position,
                    session.vision.as_ref(),
                    now,
                ) {
                    Prepared::Hit(mut result) => {
                        // Entries may predate the first fix.
                        result.location_known = position.is_some();
                        return Ok(result);
                    }
                    Prepared::Miss { key, context } if attempt >= MAX_SYNTHESIS_ATTEMPTS => {
                        tracing::debug!("Session {} gave up refining after {} attempts", id, attempt);
                        let refinement = Refinement::fallback(&context, FallbackReason::Contended);
                        return Ok(self
                            .synthesizer
                            .commit(&mut session.cache, key, &context, refinement));
                    }
                    Prepared::Miss { key, context } => (key, context, session.route_epoch),
                }
            };

            let refinement = self.synthesizer.refine(&context).await;

            let mut guard = slot.lock().await?;
            let session = &mut *guard;
            if session.route_epoch == epoch {
                if let Some(progress) = session.progress.as_ref() {
                    let current = InstructionSynthesizer::key(progress, session.vision.as_ref(), now);
                    if current == key {
                        let mut result =
                            self.synthesizer
                                .commit(&mut session.cache, key, &context, refinement);
                        result.location_known = session.filter.last_fix().is_some();
                        return Ok(result);
                    }
                }
            }

            tracing::debug!("Session {} instruction went stale during refinement; retrying", id);
            attempt += 1;
        }
    }

    /// Client-requested reroute from the last fix to the destination.
    pub async fn reroute(&self, id: &str, now: DateTime<Utc>) -> NavResult<RouteSummary> {
        let slot = self.registry.get(id).await?;
        slot.touch(now);

        let (origin, destination, epoch) = {
            let mut session = slot.lock().await?;
            let origin = session
                .filter
                .last_fix()
                .map(|f| f.position)
                .ok_or(NavError::LocationUnavailable)?;
            let destination = session
                .destination
                .ok_or_else(|| NavError::RouteUnavailable("no active route".into()))?;
            if !session.reroute.begin_manual(now) {
                return Err(NavError::RerouteFailed(
                    "a reroute is already in progress".into(),
                ));
            }
            (origin, destination, session.route_epoch)
        };

        self.spawn_reroute(&slot, origin, destination, epoch).await
    }

    /// Skips the current step, as when the walker has already made the turn.
    pub async fn advance(&self, id: &str, now: DateTime<Utc>) -> NavResult<StepUpdate> {
        let slot = self.registry.get(id).await?;
        slot.touch(now);

        let mut guard = slot.lock().await?;
        let session = &mut *guard;
        let progress = session
            .progress
            .as_mut()
            .ok_or_else(|| NavError::RouteUnavailable("no active route".into()))?;

        let outcome = progress.skip_step(now);
        match outcome {
            StepOutcome::Advanced { index } => {
                session.cache.invalidate_index(index);
                slot.emit(NavEvent::StepAdvanced {
                    index,
                    instruction: progress
                        .current_step()
                        .map(|s| s.instruction())
                        .unwrap_or_default(),
                });
            }
            StepOutcome::Completed => {
                session.cache.invalidate_index(progress.index());
                slot.emit(NavEvent::RouteComplete);
            }
            StepOutcome::Unchanged => {}
        }

        Ok(StepUpdate {
            advanced: outcome != StepOutcome::Unchanged,
            step_index: progress.index(),
            route_complete: progress.is_complete(),
            current_maneuver: progress.current_step().map(|s| s.instruction()),
        })
    }

    /// The active route, for map display.
    pub async fn route(&self, id: &str, now: DateTime<Utc>) -> NavResult<Route> {
        let slot = self.registry.get(id).await?;
        slot.touch(now);
        let session = slot.lock().await?;
        session
            .progress
            .as_ref()
            .map(|p| p.route().clone())
            .ok_or_else(|| NavError::RouteUnavailable("no active route".into()))
    }

    pub async fn status(&self, id: &str, now: DateTime<Utc>) -> NavResult<SessionStatus> {
        let slot = self.registry.get(id).await?;
        let session = slot.lock().await?;
        let progress = session.progress.as_ref();
        let last_position = session.filter.last_fix().map(|f| f.position);
        let hazards = session
            .vision
            .as_ref()
            .and_then(|v| v.fresh(now))
            .map(|v| v.hazards.clone())
            .unwrap_or_default();

        Ok(SessionStatus {
            session_id: session.id.clone(),
            created_at: session.created_at,
            last_activity: slot.last_activity(),
            navigating: progress.is_some(),
            step_index: progress.map(|p| p.index()),
            total_steps: progress.map(|p| p.route().steps.len()).unwrap_or(0),
            phase: progress.map(|p| p.phase()),
            confirmations: progress.map(|p| p.confirmations()).unwrap_or(0),
            route_complete: progress.is_some_and(|p| p.is_complete()),
            current_maneuver: progress
                .and_then(|p| p.current_step())
                .map(|s| s.instruction()),
            remaining_distance_m: progress.map(|p| p.remaining_distance_m(last_position)),
            destination: session.destination,
            last_position,
            last_accuracy_m: session.filter.last_accuracy_m(),
            hazards,
            reroute_in_flight: session.reroute.in_flight(),
        })
    }

    /// Ends the session. In-flight work for it is discarded.
    pub async fn stop(&self, id: &str) -> NavResult<()> {
        if self.registry.remove(id).await {
            Ok(())
        } else {
            Err(NavError::SessionNotFound(id.to_string()))
        }
    }

    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        self.registry
            .evict_idle(now, self.config.session_idle_ttl)
            .await
    }

    pub async fn subscribe(&self, id: &str) -> NavResult<broadcast::Receiver<NavEvent>> {
        Ok(self.registry.get(id).await?.subscribe())
    }

    /// Runs a reroute on its own task. The in-flight claim taken by the
    /// caller is released by that task even if the caller stops waiting.
    async fn spawn_reroute(
        &self,
        slot: &Arc<SessionSlot>,
        origin: LatLng,
        destination: LatLng,
        epoch: u64,
    ) -> NavResult<RouteSummary> {
        let router = Arc::clone(&self.router);
        let timeout = self.config.routing_timeout;
        let task_slot = Arc::clone(slot);
        let handle = tokio::spawn(async move {
            let fetched = fetch_route(router.as_ref(), origin, destination, timeout).await;
            commit_reroute(&task_slot, fetched, destination, epoch).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Reroute task for session {} failed: {}", slot.id(), e);
                if let Ok(mut session) = slot.lock().await {
                    session.reroute.finish(false);
                }
                Err(NavError::RerouteFailed("reroute task failed".into()))
            }
        }
    }
}

async fn fetch_route(
    router: &dyn RouteProvider,
    origin: LatLng,
    destination: LatLng,
    timeout: Duration,
) -> NavResult<Route> {
    match tokio::time::timeout(timeout, router.route(origin, destination)).await {
        Ok(Ok(route)) => Ok(route),
        Ok(Err(e)) => {
            tracing::warn!("Routing failed: {:#}", e);
            Err(NavError::RouteUnavailable(e.to_string()))
        }
        Err(_) => {
            tracing::warn!("Routing timed out after {:?}", timeout);
            Err(NavError::RouteUnavailable(format!(
                "routing timed out after {:?}",
                timeout
            )))
        }
    }
}

/// Swaps in a fetched replacement route if the session still has the route
/// the attempt started from, and releases the in-flight claim either way.
async fn commit_reroute(
    slot: &SessionSlot,
    fetched: NavResult<Route>,
    destination: LatLng,
    epoch: u64,
) -> NavResult<RouteSummary> {
    let mut session = slot.lock().await?;
    match fetched {
        Ok(route) if session.route_epoch == epoch => {
            session.reroute.finish(true);
            let summary = RouteSummary::of(&route);
            session.install_route(route, destination);
            tracing::info!("Session {} rerouted: {}", slot.id(), summary.summary);
            slot.emit(NavEvent::Rerouted {
                steps: summary.total_steps,
                summary: summary.summary.clone(),
            });
            Ok(summary)
        }
        Ok(_) => {
            session.reroute.finish(false);
            tracing::debug!("Session {} route replaced while rerouting", slot.id());
            Err(NavError::RerouteFailed(
                "route was replaced while rerouting".into(),
            ))
        }
        Err(e) => {
            session.reroute.finish(false);
            let reason = e.to_string();
            tracing::warn!("Session {} reroute failed, keeping current route: {}", slot.id(), reason);
            slot.emit(NavEvent::RerouteFailed {
                reason: reason.clone(),
            });
            Err(NavError::RerouteFailed(reason))
        }
    }
}
