//! Spatial math: great-circle distance, point-in-polygon, and the ENU
//! (East-North-Up) projections used to convert buffered-circle volumes into
//! polygons and to compute geofence-exit waypoints.

/// Calculate distance between two points in meters using the Haversine formula.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6_371_000.0; // Earth radius in meters
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * R * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Ray-casting point-in-polygon test. `polygon` is a closed ring of
/// `[lat, lon]` pairs (first == last).
pub fn point_in_polygon(lat: f64, lon: f64, polygon: &[[f64; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let yi = polygon[i][0];
        let xi = polygon[i][1];
        let yj = polygon[j][0];
        let xj = polygon[j][1];

        if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }

    inside
}

// ==== ENU (East-North-Up) Coordinate Conversion ====
// These functions convert between meters and degrees using proper latitude scaling.

/// Meters per degree of latitude (constant at all latitudes).
pub const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// Meters per degree of longitude at a given latitude.
/// Longitude degrees shrink as you move toward the poles.
pub fn meters_per_deg_lon(lat_deg: f64) -> f64 {
    METERS_PER_DEG_LAT * lat_deg.to_radians().cos()
}

/// Convert a north/south offset in meters to degrees latitude.
pub fn meters_to_lat(meters: f64) -> f64 {
    meters / METERS_PER_DEG_LAT
}

/// Convert an east/west offset in meters to degrees longitude.
/// Requires the reference latitude for proper scaling.
pub fn meters_to_lon(meters: f64, ref_lat_deg: f64) -> f64 {
    meters / meters_per_deg_lon(ref_lat_deg)
}

/// Offset a position by meters in the north and east directions.
pub fn offset_position(lat: f64, lon: f64, north_m: f64, east_m: f64) -> (f64, f64) {
    let new_lat = lat + meters_to_lat(north_m);
    let new_lon = lon + meters_to_lon(east_m, lat);
    (new_lat, new_lon)
}

/// Calculate bearing from point 1 to point 2 in radians (0 = north, clockwise).
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let x = delta_lambda.sin() * phi2.cos();
    let y = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * delta_lambda.cos();

    x.atan2(y)
}

/// Offset a position by distance and bearing (radians, 0 = north).
pub fn offset_by_bearing(lat: f64, lon: f64, distance_m: f64, bearing_rad: f64) -> (f64, f64) {
    let north_m = distance_m * bearing_rad.cos();
    let east_m = distance_m * bearing_rad.sin();
    offset_position(lat, lon, north_m, east_m)
}

/// Convert a buffered circle (center + radius) into a closed polygon ring
/// using an azimuthal-equidistant projection centered on the circle: each
/// vertex is the center offset by `radius_m` along an evenly spaced bearing.
/// Used by the Conformance Engine (C7a) so circle volumes can reuse the same
/// ray-cast point-in-polygon test as declared polygons.
pub fn circle_to_polygon(center_lat: f64, center_lon: f64, radius_m: f64, segments: usize) -> Vec<[f64; 2]> {
    let segments = segments.max(8);
    let mut ring = Vec::with_capacity(segments + 1);
    for i in 0..segments {
        let bearing_rad = (i as f64 / segments as f64) * std::f64::consts::TAU;
        let (lat, lon) = offset_by_bearing(center_lat, center_lon, radius_m, bearing_rad);
        ring.push([lat, lon]);
    }
    ring.push(ring[0]);
    ring
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        let dist = haversine_distance(0.0, 0.0, 1.0, 0.0);
        assert!((dist - 111_194.0).abs() < 100.0);
    }

    #[test]
    fn haversine_same_point() {
        let dist = haversine_distance(33.6846, -117.8265, 33.6846, -117.8265);
        assert!(dist < 0.001);
    }

    #[test]
    fn point_in_polygon_rectangle() {
        let polygon = vec![
            [46.98, 7.47],
            [46.98, 7.49],
            [46.99, 7.49],
            [46.99, 7.47],
            [46.98, 7.47],
        ];
        assert!(point_in_polygon(46.985, 7.48, &polygon));
        assert!(!point_in_polygon(1.0, 1.0, &polygon));
    }

    #[test]
    fn circle_to_polygon_contains_center() {
        let ring = circle_to_polygon(46.98, 7.48, 100.0, 16);
        assert!(point_in_polygon(46.98, 7.48, &ring));
        assert!(!point_in_polygon(46.98, 7.60, &ring));
    }
}
