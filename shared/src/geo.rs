//! Great-circle distance and territory checks on WGS84 coordinates

use crate::{Flag, Position};

/// Mean Earth radius used by the spherical model
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in metres between two coordinates
pub fn distance(a: &Position, b: &Position) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);

    // Rounding can push h a hair above 1 for antipodal points
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// True when `a` and `b` are within `tolerance_m` of each other
pub fn is_same_position(a: &Position, b: &Position, tolerance_m: f64) -> bool {
    distance(a, b) <= tolerance_m
}

/// Closest flag not owned by `owner_id` that lies inside `radius_m` of `candidate`
pub fn nearest_conflict<'a, I>(
    candidate: &Position,
    flags: I,
    radius_m: f64,
    owner_id: &str,
) -> Option<(&'a Flag, f64)>
where
    I: IntoIterator<Item = &'a Flag>,
{
    flags
        .into_iter()
        .filter(|flag| !flag.is_owned_by(owner_id))
        .map(|flag| (flag, distance(candidate, &flag.position)))
        .filter(|(_, d)| *d < radius_m)
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
}

/// True if any flag not owned by `owner_id` lies within `radius_m` of `candidate`
pub fn violates_territory<'a, I>(candidate: &Position, flags: I, radius_m: f64, owner_id: &str) -> bool
where
    I: IntoIterator<Item = &'a Flag>,
{
    nearest_conflict(candidate, flags, radius_m, owner_id).is_some()
}
