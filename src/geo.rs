use serde::{Deserialize, Serialize};

/// Mean Earth radius (IUGG), in kilometres.
const EARTH_RADIUS_KM: f64 = 6_371.008_8;

/// Great-circle distances below this are treated as geocoding jitter inside
/// one locality.
pub const MATERIALITY_FLOOR_KM: f64 = 1.0;

/// Multiplier converting a great-circle distance into an estimated road distance.
pub const ROAD_CIRCUITY_FACTOR: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine distance in kilometres.
    pub fn great_circle_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}

/// One service's road-distance estimate between two points.
pub fn candidate_distance_km(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let raw = from.great_circle_km(to);
    if raw < MATERIALITY_FLOOR_KM {
        return 0.0;
    }
    round2(raw * ROAD_CIRCUITY_FACTOR)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
