use chrono::{DateTime, SecondsFormat, Utc};
use mowertrack_ingestor::normalize::to_instant;
use serde_json::{json, Value};
use std::collections::HashMap;

const BATTERY_START_PERCENT: i64 = 100;
const BATTERY_END_PERCENT: i64 = 30;
const BATTERY_STEP: i64 = 5;

pub const HANDSHAKE: &str = "connection-event";

/// One row of a recorded session log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub id: i64,
    pub mower_id: String,
    pub session_id: String,
    pub activity: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A stream frame to be replayed, with the instant it is ordered by
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFrame {
    pub kind: String,
    pub at: Option<DateTime<Utc>>,
    pub body: Value,
}

/// Parses `id,mower_id,session_id,activity,lat,lon,timestamp` lines after a
/// header row. Rows without a mower id or a readable timestamp are skipped.
pub fn parse_log(content: &str) -> Vec<LogRow> {
    content
        .trim()
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let field = |index: usize| fields.get(index).copied().unwrap_or_default();

            let mower_id = field(1);
            if mower_id.is_empty() {
                return None;
            }
            let timestamp = to_instant(&Value::String(field(6).to_string()))?;

            Some(LogRow {
                id: field(0).parse().unwrap_or_default(),
                mower_id: mower_id.to_string(),
                session_id: field(2).to_string(),
                activity: Some(field(3))
                    .filter(|activity| !activity.is_empty())
                    .map(str::to_string),
                lat: field(4).parse().ok(),
                lon: field(5).parse().ok(),
                timestamp,
            })
        })
        .collect()
}

/// Builds the handshake plus every session's frames, ordered by event time.
pub fn build_frames(rows: &[LogRow]) -> Vec<ReplayFrame> {
    let mut frames = vec![ReplayFrame {
        kind: HANDSHAKE.to_string(),
        at: None,
        body: json!({"ready": true, "connectionId": "replay"}),
    }];

    for session in group_sessions(rows) {
        let mut last_activity: Option<&str> = None;

        for row in &session {
            if let (Some(lat), Some(lon)) = (row.lat, row.lon) {
                frames.push(frame(
                    "position-event-v2",
                    &row.mower_id,
                    row.timestamp,
                    json!({"position": {"latitude": lat, "longitude": lon}}),
                ));
            }

            if let Some(activity) = row.activity.as_deref() {
                if last_activity != Some(activity) {
                    frames.push(frame(
                        "mower-event-v2",
                        &row.mower_id,
                        row.timestamp,
                        json!({"mower": {"activity": activity}}),
                    ));
                    last_activity = Some(activity);
                }
            }
        }

        frames.extend(battery_frames(&session));
    }

    frames.sort_by_key(|frame| frame.at);
    frames
}

/// Rows grouped by mower and session, each group in time order.
fn group_sessions(rows: &[LogRow]) -> Vec<Vec<&LogRow>> {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut sessions: Vec<Vec<&LogRow>> = Vec::new();

    for row in rows {
        let session = if row.session_id.is_empty() {
            "unknown"
        } else {
            row.session_id.as_str()
        };
        let slot = *index
            .entry((row.mower_id.as_str(), session))
            .or_insert_with(|| {
                sessions.push(Vec::new());
                sessions.len() - 1
            });
        sessions[slot].push(row);
    }

    for session in &mut sessions {
        session.sort_by_key(|row| row.timestamp);
    }
    sessions
}

/// Battery readings falling from 100% to 30% in 5% steps, spread evenly
/// between the session's `LEAVING` and `GOING_HOME` rows.
fn battery_frames(session: &[&LogRow]) -> Vec<ReplayFrame> {
    let (Some(first), Some(last)) = (session.first(), session.last()) else {
        return Vec::new();
    };
    let start = session
        .iter()
        .find(|row| row.activity.as_deref() == Some("LEAVING"))
        .unwrap_or(first);
    let end = session
        .iter()
        .find(|row| row.activity.as_deref() == Some("GOING_HOME"))
        .unwrap_or(last);

    let duration_ms = (end.timestamp - start.timestamp).num_milliseconds().max(0);
    let levels: Vec<i64> = (BATTERY_END_PERCENT..=BATTERY_START_PERCENT)
        .rev()
        .step_by(BATTERY_STEP as usize)
        .collect();
    let steps = (levels.len() as i64 - 1).max(1);

    levels
        .iter()
        .enumerate()
        .map(|(index, percent)| {
            let offset = duration_ms * index as i64 / steps;
            frame(
                "battery-event-v2",
                &start.mower_id,
                start.timestamp + chrono::Duration::milliseconds(offset),
                json!({"battery": {"batteryPercent": percent}}),
            )
        })
        .collect()
}

fn frame(kind: &str, mower_id: &str, at: DateTime<Utc>, mut attributes: Value) -> ReplayFrame {
    attributes["metadata"] = json!({"timestamp": iso(at)});
    ReplayFrame {
        kind: kind.to_string(),
        at: Some(at),
        body: json!({"id": mower_id, "type": kind, "attributes": attributes}),
    }
}

/// Rewrites the frame's timestamps to `now`, as if it were just observed.
pub fn restamp(body: &mut Value, now: DateTime<Utc>) {
    let Some(attributes) = body.get_mut("attributes") else {
        return;
    };
    if let Some(metadata) = attributes.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("timestamp".to_string(), json!(iso(now)));
    }
    if let Some(message) = attributes.get_mut("message").and_then(Value::as_object_mut) {
        if message.contains_key("time") {
            message.insert("time".to_string(), json!(now.timestamp()));
        }
    }
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
