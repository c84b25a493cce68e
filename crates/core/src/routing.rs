use crate::geo::LatLng;
use crate::route::{Maneuver, ManeuverKind, ManeuverModifier, Route, RouteStep};
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::Deserialize;

pub const DEFAULT_OSRM_BASE_URL: &str = "https://router.project-osrm.org";

/// Computes pedestrian routes between two points.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, origin: LatLng, destination: LatLng) -> Result<Route>;
}

/// Client for an OSRM server's `route` service with the `foot` profile.
pub struct OsrmClient {
    client: Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn route_url(&self, origin: LatLng, destination: LatLng) -> String {
        format!(
            "{}/route/v1/foot/{},{};{},{}?overview=full&steps=true&geometries=geojson",
            self.base_url, origin.lng, origin.lat, destination.lng, destination.lat
        )
    }
}

impl Default for OsrmClient {
    fn default() -> Self {
        Self::new(DEFAULT_OSRM_BASE_URL)
    }
}

#[async_trait]
impl RouteProvider for OsrmClient {
    async fn route(&self, origin: LatLng, destination: LatLng) -> Result<Route> {
        let url = self.route_url(origin, destination);
        tracing::debug!("Requesting route: {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("routing request failed")?
            .error_for_status()
            .context("routing service returned an error status")?
            .json::<OsrmResponse>()
            .await
            .context("routing response was not valid JSON")?;

        let route = convert_response(resp)?;
        tracing::info!(
            "Route received: {} steps, {:.0}m, {:.0}s",
            route.steps.len(),
            route.distance_m,
            route.duration_s
        );
        Ok(route)
    }
}

#[derive(Debug, Deserialize)]
pub struct OsrmResponse {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmRoute {
    pub distance: f64,
    pub duration: f64,
    #[serde(default)]
    pub geometry: Option<OsrmGeometry>,
    #[serde(default)]
    pub legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmGeometry {
    /// `[lng, lat]` pairs.
    pub coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmLeg {
    #[serde(default)]
    pub steps: Vec<OsrmStep>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmStep {
    pub distance: f64,
    pub duration: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    pub maneuver: OsrmManeuver,
}

#[derive(Debug, Deserialize)]
pub struct OsrmManeuver {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub modifier: Option<String>,
    /// `[lng, lat]`.
    pub location: [f64; 2],
    #[serde(default)]
    pub exit: Option<u32>,
}

/// Converts an OSRM response into upcoming-maneuver steps.
///
/// OSRM puts each maneuver at the start of its step. Step `k` here is the
/// walk along OSRM step `k` ending in the maneuver of OSRM step `k + 1`, so
/// the depart maneuver is dropped and the arrive maneuver ends the list.
pub fn convert_response(resp: OsrmResponse) -> Result<Route> {
    if resp.code != "Ok" {
        let detail = resp.message.unwrap_or_default();
        anyhow::bail!("routing service answered {}: {}", resp.code, detail);
    }

    let route = resp
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("routing service returned no routes"))?;

    let osrm_steps: Vec<OsrmStep> = route.legs.into_iter().flat_map(|leg| leg.steps).collect();

    let steps = osrm_steps
        .windows(2)
        .enumerate()
        .map(|(index, pair)| {
            let (walk, next) = (&pair[0], &pair[1]);
            let name = Some(next.name.trim())
                .filter(|n| !n.is_empty())
                .or_else(|| next.reference.as_deref().map(str::trim).filter(|r| !r.is_empty()))
                .map(str::to_string);
            RouteStep {
                index,
                maneuver: Maneuver {
                    kind: ManeuverKind::parse(&next.maneuver.kind),
                    modifier: next
                        .maneuver
                        .modifier
                        .as_deref()
                        .and_then(ManeuverModifier::parse),
                    exit: next.maneuver.exit,
                },
                street_name: name,
                distance_m: walk.distance,
                duration_s: walk.duration,
                location: LatLng::new(next.maneuver.location[1], next.maneuver.location[0]),
            }
        })
        .collect();

    let geometry = route
        .geometry
        .map(|g| {
            g.coordinates
                .into_iter()
                .map(|[lng, lat]| LatLng::new(lat, lng))
                .collect()
        })
        .unwrap_or_default();

    Ok(Route::new(steps, geometry, route.distance, route.duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "code": "Ok",
        "routes": [{
            "distance": 412.6,
            "duration": 297.1,
            "geometry": { "type": "LineString", "coordinates": [[13.3880, 52.5170], [13.3890, 52.5171], [13.3891, 52.5190]] },
            "legs": [{
                "steps": [
                    { "distance": 68.2, "duration": 49.1, "name": "Unter den Linden",
                      "maneuver": { "type": "depart", "location": [13.3880, 52.5170] } },
                    { "distance": 344.4, "duration": 248.0, "name": "",
                      "ref": "B 2",
                      "maneuver": { "type": "turn", "modifier": "left", "location": [13.3890, 52.5171] } },
                    { "distance": 0.0, "duration": 0.0, "name": "",
                      "maneuver": { "type": "arrive", "modifier": "right", "location": [13.3891, 52.5190] } }
                ]
            }]
        }]
    }"#;

    #[test]
    fn test_convert_shifts_maneuvers_onto_preceding_walk() {
        let resp: OsrmResponse = serde_json::from_str(SAMPLE).unwrap();
        let route = convert_response(resp).unwrap();

        assert_eq!(route.steps.len(), 2);

        let first = &route.steps[0];
        assert_eq!(first.index, 0);
        assert_eq!(first.maneuver.kind, ManeuverKind::Turn);
        assert_eq!(first.maneuver.modifier, Some(ManeuverModifier::Left));
        assert_eq!(first.street_name.as_deref(), Some("B 2"));
        assert_eq!(first.distance_m, 68.2);
        assert_eq!(first.location, LatLng::new(52.5171, 13.3890));
        assert_eq!(first.instruction(), "Turn left onto B 2");

        let last = &route.steps[1];
        assert_eq!(last.maneuver.kind, ManeuverKind::Arrive);
        assert_eq!(last.distance_m, 344.4);
        assert!(last.street_name.is_none());
        assert_eq!(last.instruction(), "You have arrived on the right");

        assert_eq!(route.geometry.len(), 3);
        assert_eq!(route.geometry[0], LatLng::new(52.5170, 13.3880));
        assert_eq!(route.distance_m, 412.6);
    }

    #[test]
    fn test_convert_rejects_error_codes() {
        let resp: OsrmResponse =
            serde_json::from_str(r#"{"code":"NoRoute","message":"Impossible route"}"#).unwrap();
        let err = convert_response(resp).unwrap_err();
        assert!(err.to_string().contains("NoRoute"));

        let empty: OsrmResponse = serde_json::from_str(r#"{"code":"Ok","routes":[]}"#).unwrap();
        assert!(convert_response(empty).is_err());
    }

    #[test]
    fn test_route_url_uses_foot_profile_and_lng_lat_order() {
        let client = OsrmClient::new("http://localhost:5000/");
        let url = client.route_url(LatLng::new(52.5, 13.4), LatLng::new(52.6, 13.5));
        assert_eq!(
            url,
            "http://localhost:5000/route/v1/foot/13.4,52.5;13.5,52.6?overview=full&steps=true&geometries=geojson"
        );
    }

    // Makes a live call to the public OSRM demo server.
    #[tokio::test]
    #[ignore]
    async fn test_route_live() {
        let client = OsrmClient::default();
        let route = client
            .route(LatLng::new(52.5170, 13.3889), LatLng::new(52.5163, 13.3777))
            .await
            .unwrap();
        println!("{}", route.summary());
        assert!(!route.steps.is_empty());
    }
}
