use crate::NavEvent;
use crate::config::NavigationConfig;
use crate::error::{NavError, NavResult};
use crate::geo::LatLng;
use crate::position::PositionFilter;
use crate::reroute::RerouteMonitor;
use crate::route::{Route, RouteProgress};
use crate::synthesizer::InstructionCache;
use crate::vision::VisionSignal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, broadcast};

/// Mutable navigation state of one client.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub filter: PositionFilter,
    pub progress: Option<RouteProgress>,
    pub vision: Option<VisionSignal>,
    pub cache: InstructionCache,
    pub reroute: RerouteMonitor,
    pub destination: Option<LatLng>,
    /// Bumped on every route replacement so work started against an older
    /// route can tell it is stale.
    pub route_epoch: u64,
}

impl Session {
    fn new(id: String, now: DateTime<Utc>, config: &NavigationConfig) -> Self {
        Self {
            id,
            created_at: now,
            filter: PositionFilter::new(),
            progress: None,
            vision: None,
            cache: InstructionCache::new(config.instruction_cache_capacity),
            reroute: RerouteMonitor::new(),
            destination: None,
            route_epoch: 0,
        }
    }

    /// Replaces the route wholesale: index 0, empty cache, new epoch.
    pub fn install_route(&mut self, route: Route, destination: LatLng) {
        self.progress = Some(RouteProgress::new(route));
        self.destination = Some(destination);
        self.cache.clear();
        self.reroute.reset_for_new_route();
        self.route_epoch += 1;
    }
}

/// Registry entry. The closed flag and activity clock sit outside the
/// session mutex so eviction and stop never wait on a busy session.
#[derive(Debug)]
pub struct SessionSlot {
    id: String,
    closed: AtomicBool,
    last_activity_ms: AtomicI64,
    events: broadcast::Sender<NavEvent>,
    state: Mutex<Session>,
}

impl SessionSlot {
    fn new(id: &str, now: DateTime<Utc>, config: &NavigationConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            id: id.to_string(),
            closed: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            events,
            state: Mutex::new(Session::new(id.to_string(), now, config)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
    }

    /// Locks the session, failing if it was stopped or evicted.
    pub async fn lock(&self) -> NavResult<MutexGuard<'_, Session>> {
        let guard = self.state.lock().await;
        if self.is_closed() {
            return Err(NavError::SessionNotFound(self.id.clone()));
        }
        Ok(guard)
    }

    pub fn emit(&self, event: NavEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NavEvent> {
        self.events.subscribe()
    }
}

/// Concurrent map from opaque client id to session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    config: NavigationConfig,
}

impl SessionRegistry {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Returns the session for `id`, creating an empty one if needed.
    pub async fn create_or_get(&self, id: &str, now: DateTime<Utc>) -> Arc<SessionSlot> {
        if let Some(slot) = self.sessions.read().await.get(id) {
            slot.touch(now);
            return Arc::clone(slot);
        }

        let mut sessions = self.sessions.write().await;
        let slot = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::info!("Created session {}", id);
            Arc::new(SessionSlot::new(id, now, &self.config))
        });
        slot.touch(now);
        Arc::clone(slot)
    }

    pub async fn get(&self, id: &str) -> NavResult<Arc<SessionSlot>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|slot| !slot.is_closed())
            .cloned()
            .ok_or_else(|| NavError::SessionNotFound(id.to_string()))
    }

    /// Closes and removes a session. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(slot) => {
                slot.close();
                tracing::info!("Stopped session {}", id);
                true
            }
            None => false,
        }
    }

    /// Removes sessions idle for at least `ttl` and returns their ids.
    pub async fn evict_idle(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();

        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| {
                now_ms.saturating_sub(slot.last_activity_ms.load(Ordering::Acquire)) >= ttl_ms
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            if let Some(slot) = sessions.remove(id) {
                slot.close();
            }
        }
        if !idle.is_empty() {
            tracing::info!("Evicted {} idle session(s)", idle.len());
        }
        idle
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
