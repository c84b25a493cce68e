use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &LatLng) -> f64 {
        haversine_m(*self, *other)
    }

    /// Returns the point `meters` away along a compass `bearing_deg`.
    ///
    /// Uses a flat-earth offset, which is accurate to well under a meter for
    /// the few-hundred-meter displacements pedestrian routing deals with.
    pub fn offset(&self, meters: f64, bearing_deg: f64) -> LatLng {
        let bearing = bearing_deg.to_radians();
        let d_north = meters * bearing.cos();
        let d_east = meters * bearing.sin();
        let lat = self.lat + (d_north / EARTH_RADIUS_M).to_degrees();
        let lng = self.lng + (d_east / (EARTH_RADIUS_M * self.lat.to_radians().cos())).to_degrees();
        LatLng { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Shortest distance in meters from `point` to the polyline through `path`.
///
/// Each segment is projected onto a local equirectangular plane centred on
/// `point`. Returns `None` for an empty path; a single-point path degrades to
/// a point distance.
pub fn distance_to_polyline_m(point: LatLng, path: &[LatLng]) -> Option<f64> {
    match path {
        [] => None,
        [only] => Some(haversine_m(point, *only)),
        _ => path
            .windows(2)
            .map(|seg| distance_to_segment_m(point, seg[0], seg[1]))
            .min_by(|a, b| a.total_cmp(b)),
    }
}

fn distance_to_segment_m(point: LatLng, start: LatLng, end: LatLng) -> f64 {
    let cos_lat = point.lat.to_radians().cos();
    let project = |p: LatLng| {
        (
            (p.lng - point.lng).to_radians() * EARTH_RADIUS_M * cos_lat,
            (p.lat - point.lat).to_radians() * EARTH_RADIUS_M,
        )
    };

    let (ax, ay) = project(start);
    let (bx, by) = project(end);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;

    // Degenerate segment: both ends coincide.
    if len_sq == 0.0 {
        return (ax * ax + ay * ay).sqrt();
    }

    // The point sits at the origin of the local plane.
    let t = (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (cx * cx + cy * cy).sqrt()
}
