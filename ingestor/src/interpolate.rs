//! Path reconstruction from sparse position fixes.
//!
//! Positions are split into mowing sessions, each session is weighted by how
//! recently it started, and consecutive fixes are joined by evenly spaced
//! synthetic points. Everything is recomputed per call so the recency decay
//! always reflects the current day.

use crate::model::{PathPoint, Position, ACTIVITY_MOWING};
use chrono::{DateTime, Utc};
use tracing::warn;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Spacing of synthetic points along a segment
pub const STEP_METERS: f64 = 0.5;
/// Segments shorter than this are emitted as their two fixes only
pub const MIN_SEGMENT_METERS: f64 = 1.0;
/// A mower cannot cover this between two fixes of one session. Longer
/// segments are kept as their two fixes and not filled in.
pub const MAX_SEGMENT_METERS: f64 = 1_000.0;
pub const MAX_SESSION_AGE_DAYS: i64 = 7;

/// Great-circle distance in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// `2^-(1 + age)` for ages up to seven days, zero beyond.
pub fn recency_weight(age_days: i64) -> f64 {
    if age_days > MAX_SESSION_AGE_DAYS {
        return 0.0;
    }
    let exponent = 1 + age_days.clamp(0, MAX_SESSION_AGE_DAYS) as i32;
    2f64.powi(-exponent)
}

/// Whole UTC calendar days between `first` and `now`.
pub fn session_age_days(first: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now.date_naive() - first.date_naive()).num_days()
}

/// Splits fixes (ordered by mower, then time) into mowing sessions.
///
/// A session is a run of `MOWING` fixes of one mower sharing a session id.
/// Runs with a single fix describe no path and are dropped.
pub fn extract_sessions(positions: &[Position]) -> Vec<&[Position]> {
    let mut sessions = Vec::new();
    let mut start: Option<usize> = None;

    for (index, position) in positions.iter().enumerate() {
        if let Some(first) = start {
            let head = &positions[first];
            let continues = position.activity == ACTIVITY_MOWING
                && position.mower_id == head.mower_id
                && position.session_id == head.session_id;
            if continues {
                continue;
            }
            if index - first > 1 {
                sessions.push(&positions[first..index]);
            }
            start = None;
        }

        if position.activity == ACTIVITY_MOWING {
            start = Some(index);
        }
    }

    if let Some(first) = start {
        if positions.len() - first > 1 {
            sessions.push(&positions[first..]);
        }
    }

    sessions
}

/// Weighted, interpolated path points for every recent mowing session.
pub fn reconstruct(positions: &[Position], now: DateTime<Utc>) -> Vec<PathPoint> {
    let mut output = Vec::new();

    for session in extract_sessions(positions) {
        let age_days = session_age_days(session[0].timestamp, now);
        if age_days > MAX_SESSION_AGE_DAYS {
            continue;
        }
        interpolate_session(session, recency_weight(age_days), &mut output);
    }

    output
}

fn interpolate_session(session: &[Position], weight: f64, output: &mut Vec<PathPoint>) {
    let session_id = session[0].session_id;
    let point = |lat: f64, lon: f64, is_endpoint: bool| PathPoint {
        lat,
        lon,
        weight,
        session_id,
        is_endpoint,
    };

    for pair in session.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let distance = haversine_distance(a.lat, a.lon, b.lat, b.lon);

        let implausible = distance.is_nan() || distance > MAX_SEGMENT_METERS;
        if implausible {
            warn!(
                "Not filling implausible {:.0} m segment in session {:?} of mower {}",
                distance, session_id, a.mower_id
            );
        }
        if implausible || distance < MIN_SEGMENT_METERS {
            output.push(point(a.lat, a.lon, true));
            output.push(point(b.lat, b.lon, true));
            continue;
        }

        let steps = ((distance / STEP_METERS).floor() as usize).max(1);
        for step in 0..=steps {
            let t = step as f64 / steps as f64;
            output.push(point(
                a.lat + t * (b.lat - a.lat),
                a.lon + t * (b.lon - a.lon),
                step == 0 || step == steps,
            ));
        }
    }

    if let Some(last) = session.last() {
        output.push(point(last.lat, last.lon, true));
    }
}

/// `[lat, lon, weight]` triples for heatmap rendering.
pub fn heatmap(points: &[PathPoint]) -> Vec<[f64; 3]> {
    points
        .iter()
        .map(|point| [point.lat, point.lon, point.weight])
        .collect()
}

/// Recorded fixes of the most recent session.
pub fn recent_path(points: &[PathPoint]) -> Vec<PathPoint> {
    let Some(latest) = points.iter().map(|point| point.session_id).max() else {
        return Vec::new();
    };

    points
        .iter()
        .filter(|point| point.is_endpoint && point.session_id == latest)
        .copied()
        .collect()
}
