//! Great-circle geometry for the radius filter and per-recipient
//! distance annotations.

use crate::types::Coords;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometers.
pub fn haversine_km(from: Coords, to: Coords) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlat = (to.lat - from.lat).to_radians();
    let dlon = (to.lon - from.lon).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Initial great-circle bearing from `from` to `to`, in degrees [0, 360).
pub fn initial_bearing_deg(from: Coords, to: Coords) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlon = (to.lon - from.lon).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Eight-point compass label for a bearing in degrees.
pub fn compass_point(bearing_deg: f64) -> &'static str {
    const POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let normalized = (bearing_deg % 360.0 + 360.0) % 360.0;
    let index = ((normalized + 22.5) / 45.0) as usize % 8;
    POINTS[index]
}

/// Human-readable distance and direction line, e.g. "634 km N".
///
/// Distances under 10 km keep one decimal; beyond that whole kilometers
/// are precise enough for a subscriber deciding whether to deploy.
pub fn distance_and_direction(from: Coords, to: Coords) -> String {
    let km = haversine_km(from, to);
    let point = compass_point(initial_bearing_deg(from, to));
    if km < 10.0 {
        format!("{:.1} km {}", km, point)
    } else {
        format!("{:.0} km {}", km, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOSCOW: Coords = Coords {
        lat: 55.7558,
        lon: 37.6173,
    };
    const ST_PETERSBURG: Coords = Coords {
        lat: 59.9311,
        lon: 30.3609,
    };

    #[test]
    fn test_haversine_known_distance() {
        // Moscow → Saint Petersburg is ~634 km
        let km = haversine_km(MOSCOW, ST_PETERSBURG);
        assert!((630.0..640.0).contains(&km), "got {}", km);
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert!(haversine_km(MOSCOW, MOSCOW) < 1e-9);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = Coords { lat: 50.0, lon: 30.0 };
        let north = Coords { lat: 51.0, lon: 30.0 };
        let east = Coords { lat: 50.0, lon: 31.0 };

        assert!(initial_bearing_deg(origin, north).abs() < 1.0);
        let east_bearing = initial_bearing_deg(origin, east);
        assert!((east_bearing - 90.0).abs() < 2.0, "got {}", east_bearing);
    }

    #[test]
    fn test_compass_points() {
        assert_eq!(compass_point(0.0), "N");
        assert_eq!(compass_point(44.0), "NE");
        assert_eq!(compass_point(92.0), "E");
        assert_eq!(compass_point(180.0), "S");
        assert_eq!(compass_point(271.0), "W");
        assert_eq!(compass_point(359.0), "N");
        assert_eq!(compass_point(-45.0), "NW");
    }

    #[test]
    fn test_distance_and_direction_format() {
        let line = distance_and_direction(MOSCOW, ST_PETERSBURG);
        assert!(line.ends_with("NW"), "got {}", line);
        assert!(line.contains("km"));
    }
}
