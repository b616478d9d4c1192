// src/utils/geo.rs
//! Distance, ETA and viewport math for delivery tracking.

use serde::{Deserialize, Serialize};

use crate::models::delivery::Coordinate;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Average urban courier speed used when the backend gives no estimate.
pub const DEFAULT_AVG_SPEED_KMH: f64 = 30.0;

/// Viewport center used before any position is known (New York City).
pub const DEFAULT_MAP_CENTER: Coordinate = Coordinate {
    latitude: 40.7128,
    longitude: -74.0060,
};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub south_west: Coordinate,
    pub north_east: Coordinate,
}

/// Haversine great-circle distance in kilometers, rounded to 2 decimals.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // a can drift a hair outside [0, 1] for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let distance = (EARTH_RADIUS_KM * c * 100.0).round() / 100.0;
    if distance.is_finite() { distance.max(0.0) } else { 0.0 }
}

pub fn distance_between(from: Coordinate, to: Coordinate) -> f64 {
    distance_km(from.latitude, from.longitude, to.latitude, to.longitude)
}

/// Minutes to cover `distance_km` at `avg_speed_kmh`, rounded up.
///
/// Zero only when there is no distance left; any positive distance takes at
/// least one minute. A non-positive speed falls back to [`DEFAULT_AVG_SPEED_KMH`].
pub fn eta_minutes(distance_km: f64, avg_speed_kmh: f64) -> u32 {
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return 0;
    }
    let speed = if avg_speed_kmh.is_finite() && avg_speed_kmh > 0.0 {
        avg_speed_kmh
    } else {
        DEFAULT_AVG_SPEED_KMH
    };

    let minutes = (distance_km / speed * 60.0).ceil();
    if minutes >= u32::MAX as f64 {
        u32::MAX
    } else {
        (minutes as u32).max(1)
    }
}

pub fn format_distance(distance_km: f64) -> String {
    if distance_km < 1.0 {
        format!("{} m", (distance_km.max(0.0) * 1000.0).round() as u64)
    } else {
        format!("{:.1} km", distance_km)
    }
}

pub fn format_eta(minutes: u32) -> String {
    if minutes < 1 {
        return "Less than 1 min".to_string();
    }
    if minutes < 60 {
        return format!("{} min", minutes);
    }
    let hours = minutes / 60;
    let mins = minutes % 60;
    if mins > 0 {
        format!("{}h {}min", hours, mins)
    } else {
        format!("{}h", hours)
    }
}

/// Arithmetic mean of the coordinates; the origin when there are none.
pub fn center_point(coords: &[Coordinate]) -> Coordinate {
    match coords {
        [] => Coordinate::new(0.0, 0.0),
        [only] => *only,
        _ => {
            let count = coords.len() as f64;
            let (sum_lat, sum_lng) = coords
                .iter()
                .fold((0.0, 0.0), |(lat, lng), c| (lat + c.latitude, lng + c.longitude));
            Coordinate::new(sum_lat / count, sum_lng / count)
        }
    }
}

pub fn bounds_of(coords: &[Coordinate]) -> Option<Bounds> {
    let first = coords.first()?;
    let mut bounds = Bounds {
        south_west: *first,
        north_east: *first,
    };

    for c in &coords[1..] {
        bounds.south_west.latitude = bounds.south_west.latitude.min(c.latitude);
        bounds.south_west.longitude = bounds.south_west.longitude.min(c.longitude);
        bounds.north_east.latitude = bounds.north_east.latitude.max(c.latitude);
        bounds.north_east.longitude = bounds.north_east.longitude.max(c.longitude);
    }

    Some(bounds)
}
