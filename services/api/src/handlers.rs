use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wayfinder_core::navigator::{
    PositionUpdate, RouteSummary, SessionStatus, StepUpdate, VisionUpdate,
};
use wayfinder_core::position::PositionFix;
use wayfinder_core::route::Route;
use wayfinder_core::synthesizer::InstructionResult;
use wayfinder_core::{LatLng, NavEvent, Navigator};

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub navigator: Arc<Navigator>,
}

impl AppState {
    pub fn new(navigator: Navigator) -> Self {
        Self {
            navigator: Arc::new(navigator),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub sid: Option<String>,
}

/// Successful responses carry `success: true` next to the payload.
#[derive(Debug, Serialize)]
pub struct Success<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        data,
    })
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub origin: Option<LatLng>,
    pub destination: LatLng,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub session_id: String,
    pub route: RouteSummary,
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub lat: f64,
    pub lng: f64,
    /// Reported accuracy radius; missing means the fix is taken at face value.
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct Empty {}

/// Reads the client id from the `X-Client-ID` header, then the `sid` query.
fn client_id(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            query
                .sid
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

fn require_client_id(headers: &HeaderMap, query: &SessionQuery) -> ApiResult<String> {
    client_id(headers, query).ok_or_else(|| {
        ApiError::BadRequest("missing X-Client-ID header or sid query parameter".to_string())
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.navigator.session_count().await,
    })
}

pub async fn start_navigation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<Success<StartResponse>>> {
    let session_id =
        client_id(&headers, &query).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let route = state
        .navigator
        .start_navigation(&session_id, request.origin, request.destination, Utc::now())
        .await?;

    Ok(ok(StartResponse { session_id, route }))
}

pub async fn post_location(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(request): Json<LocationRequest>,
) -> ApiResult<Json<Success<PositionUpdate>>> {
    let session_id = require_client_id(&headers, &query)?;
    let received_at = Utc::now();
    let fix = PositionFix::new(
        request.lat,
        request.lng,
        request.accuracy.unwrap_or(0.0),
        request.timestamp.unwrap_or(received_at),
    );

    let update = state
        .navigator
        .post_position(&session_id, fix, received_at)
        .await?;
    Ok(ok(update))
}

pub async fn post_vision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(update): Json<VisionUpdate>,
) -> ApiResult<Json<Success<Empty>>> {
    let session_id = require_client_id(&headers, &query)?;
    state
        .navigator
        .post_vision(&session_id, update, Utc::now())
        .await?;
    Ok(ok(Empty {}))
}

pub async fn get_instruction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<InstructionResult>>> {
    let session_id = require_client_id(&headers, &query)?;
    let instruction = state
        .navigator
        .poll_instruction(&session_id, Utc::now())
        .await?;
    Ok(ok(instruction))
}

pub async fn advance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<StepUpdate>>> {
    let session_id = require_client_id(&headers, &query)?;
    let update = state.navigator.advance(&session_id, Utc::now()).await?;
    Ok(ok(update))
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub route: Route,
}

pub async fn get_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<RouteResponse>>> {
    let session_id = require_client_id(&headers, &query)?;
    let route = state.navigator.route(&session_id, Utc::now()).await?;
    Ok(ok(RouteResponse { route }))
}

pub async fn reroute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<RouteSummary>>> {
    let session_id = require_client_id(&headers, &query)?;
    let summary = state.navigator.reroute(&session_id, Utc::now()).await?;
    Ok(ok(summary))
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<SessionStatus>>> {
    let session_id = require_client_id(&headers, &query)?;
    let status = state.navigator.status(&session_id, Utc::now()).await?;
    Ok(ok(status))
}

pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Success<Empty>>> {
    let session_id = require_client_id(&headers, &query)?;
    state.navigator.stop(&session_id).await?;
    Ok(ok(Empty {}))
}

/// Upgrades to a WebSocket that streams the session's navigation events.
///
/// The subscription is taken before the upgrade so unknown sessions get a
/// plain 404 instead of an empty socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Response> {
    let session_id = require_client_id(&headers, &query)?;
    let events = state.navigator.subscribe(&session_id).await?;
    info!("WebSocket upgrade request received for session {}", session_id);
    Ok(ws.on_upgrade(move |socket| forward_events(socket, events, session_id)))
}

async fn forward_events(
    socket: WebSocket,
    mut events: broadcast::Receiver<NavEvent>,
    session_id: String,
) {
    info!("WebSocket connection established for session {}", session_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize event {:?}: {}", event, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        // Client disconnected.
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Session {} subscriber lagged; {} event(s) dropped", session_id, skipped);
                }
                // Session stopped or evicted.
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(msg)) => debug!("Ignoring client message: {:?}", msg),
                Some(Err(e)) => {
                    info!("WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    info!("WebSocket connection closed for session {}", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{HeaderValue, StatusCode};
    use wayfinder_core::NavigationConfig;
    use wayfinder_core::refiner::OfflineRefiner;
    use wayfinder_core::route::{Maneuver, ManeuverKind, ManeuverModifier, RouteStep};
    use wayfinder_core::routing::RouteProvider;

    /// Two steps due east of the origin: turn left at 100 m, arrive at 200 m.
    struct StraightRouter;

    #[async_trait]
    impl RouteProvider for StraightRouter {
        async fn route(&self, origin: LatLng, _destination: LatLng) -> anyhow::Result<Route> {
            let turn = origin.offset(100.0, 90.0);
            let end = origin.offset(200.0, 90.0);
            let steps = vec![
                RouteStep {
                    index: 0,
                    maneuver: Maneuver::new(ManeuverKind::Turn, Some(ManeuverModifier::Left)),
                    street_name: Some("Main Street".to_string()),
                    distance_m: 100.0,
                    duration_s: 70.0,
                    location: turn,
                },
                RouteStep {
                    index: 1,
                    maneuver: Maneuver::new(ManeuverKind::Arrive, None),
                    street_name: None,
                    distance_m: 100.0,
                    duration_s: 70.0,
                    location: end,
                },
            ];
            Ok(Route::new(steps, vec![origin, end], 200.0, 140.0))
        }
    }

    fn state() -> AppState {
        AppState::new(Navigator::new(
            Arc::new(StraightRouter),
            Arc::new(OfflineRefiner),
            NavigationConfig::default(),
        ))
    }

    fn headers_for(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_str(id).unwrap());
        headers
    }

    fn origin() -> LatLng {
        LatLng::new(51.5, -0.12)
    }

    #[test]
    fn test_client_id_prefers_header_over_query() {
        let query = SessionQuery {
            sid: Some("from-query".to_string()),
        };

        assert_eq!(
            client_id(&headers_for("from-header"), &query).as_deref(),
            Some("from-header")
        );
        assert_eq!(client_id(&HeaderMap::new(), &query).as_deref(), Some("from-query"));
        assert_eq!(client_id(&HeaderMap::new(), &SessionQuery { sid: Some("  ".into()) }), None);
    }

    #[tokio::test]
    async fn test_start_mints_session_id_and_serves_instruction() {
        // Arrange
        let state = state();
        let request = StartRequest {
            origin: Some(origin()),
            destination: origin().offset(200.0, 90.0),
        };

        // Act
        let Json(started) = start_navigation(
            State(state.clone()),
            HeaderMap::new(),
            Query(SessionQuery::default()),
            Json(request),
        )
        .await
        .unwrap();
        let id = started.data.session_id.clone();
        let Json(instruction) = get_instruction(
            State(state.clone()),
            HeaderMap::new(),
            Query(SessionQuery { sid: Some(id.clone()) }),
        )
        .await
        .unwrap();

        // Assert
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(started.data.route.total_steps, 2);
        assert_eq!(instruction.data.step_index, 0);
        assert!(instruction.data.text.contains("Main Street"));
        let json = serde_json::to_value(&instruction).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["source"], "fallback");
    }

    #[tokio::test]
    async fn test_location_then_status() {
        // Arrange
        let state = state();
        let headers = headers_for("walker");
        start_navigation(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(StartRequest {
                origin: Some(origin()),
                destination: origin().offset(200.0, 90.0),
            }),
        )
        .await
        .unwrap();

        // Act
        let here = origin().offset(20.0, 90.0);
        let Json(update) = post_location(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(LocationRequest {
                lat: here.lat,
                lng: here.lng,
                accuracy: Some(5.0),
                timestamp: None,
            }),
        )
        .await
        .unwrap();
        let Json(status) = status(State(state.clone()), headers, Query(SessionQuery::default()))
            .await
            .unwrap();

        // Assert
        assert!(update.data.accepted);
        assert_eq!(update.data.step_index, Some(0));
        assert!(status.data.navigating);
        assert_eq!(status.data.total_steps, 2);
        assert_eq!(status.data.last_accuracy_m, Some(5.0));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let err = get_instruction(
            State(state()),
            headers_for("ghost"),
            Query(SessionQuery::default()),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_client_id_is_bad_request() {
        let err = post_location(
            State(state()),
            HeaderMap::new(),
            Query(SessionQuery::default()),
            Json(LocationRequest {
                lat: 1.0,
                lng: 1.0,
                accuracy: None,
                timestamp: None,
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_without_origin_or_fix_conflicts() {
        let err = start_navigation(
            State(state()),
            headers_for("lost"),
            Query(SessionQuery::default()),
            Json(StartRequest {
                origin: None,
                destination: origin(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_stop_ends_session() {
        // Arrange
        let state = state();
        let headers = headers_for("done");
        start_navigation(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(StartRequest {
                origin: Some(origin()),
                destination: origin().offset(200.0, 90.0),
            }),
        )
        .await
        .unwrap();

        // Act
        stop(State(state.clone()), headers.clone(), Query(SessionQuery::default()))
            .await
            .unwrap();
        let err = status(State(state.clone()), headers, Query(SessionQuery::default()))
            .await
            .unwrap_err();

        // Assert
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let Json(health) = health(State(state)).await;
        assert_eq!(health.sessions, 0);
    }

    #[tokio::test]
    async fn test_advance_and_route_endpoints() {
        // Arrange
        let state = state();
        let headers = headers_for("tester");
        start_navigation(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(StartRequest {
                origin: Some(origin()),
                destination: origin().offset(200.0, 90.0),
            }),
        )
        .await
        .unwrap();

        // Act
        let Json(route) = get_route(State(state.clone()), headers.clone(), Query(SessionQuery::default()))
            .await
            .unwrap();
        let Json(first) = advance(State(state.clone()), headers.clone(), Query(SessionQuery::default()))
            .await
            .unwrap();
        let Json(last) = advance(State(state.clone()), headers, Query(SessionQuery::default()))
            .await
            .unwrap();

        // Assert
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["route"]["steps"].as_array().unwrap().len(), 2);
        assert_eq!(first.data.step_index, 1);
        assert!(!first.data.route_complete);
        assert!(last.data.route_complete);
    }

    #[tokio::test]
    async fn test_stale_device_timestamp_keeps_session_alive() {
        // Arrange
        let state = state();
        let headers = headers_for("laggard");
        start_navigation(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(StartRequest {
                origin: Some(origin()),
                destination: origin().offset(200.0, 90.0),
            }),
        )
        .await
        .unwrap();

        // Act: a device clock two hours slow.
        post_location(
            State(state.clone()),
            headers.clone(),
            Query(SessionQuery::default()),
            Json(LocationRequest {
                lat: origin().lat,
                lng: origin().lng,
                accuracy: Some(5.0),
                timestamp: Some(Utc::now() - chrono::Duration::hours(2)),
            }),
        )
        .await
        .unwrap();
        let evicted = state.navigator.evict_idle(Utc::now()).await;

        // Assert
        assert!(evicted.is_empty());
        assert!(status(State(state), headers, Query(SessionQuery::default())).await.is_ok());
    }
}
