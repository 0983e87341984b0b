use crate::errors::{Error, Result};
use crate::model::{Event, EventDetails, EventType};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Numeric timestamps above this magnitude are milliseconds, below it seconds
const MILLIS_THRESHOLD: f64 = 1e12;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Type-specific fallback timestamp fields, tried after metadata and message time
const FALLBACK_TIMESTAMP_PATHS: &[&[&str]] = &[
    &["mower", "errorCodeTimestamp"],
    &["planner", "nextStartTimestamp"],
    &["position", "timestamp"],
];

/// Turns a raw stream frame into a canonical [`Event`].
///
/// Pure: the receipt instant is supplied by the caller. Frames that are not
/// JSON, lack an id/type/attributes, or carry an unknown type are rejected
/// with an error the caller logs and drops.
pub fn normalize(raw: &str, received_at: DateTime<Utc>) -> Result<Event> {
    let value: Value = serde_json::from_str(raw)?;
    let frame = value
        .as_object()
        .ok_or_else(|| Error::Validation("frame is not a JSON object".to_string()))?;

    if frame.get("ready").and_then(Value::as_bool) == Some(true) {
        return Ok(Event {
            mower_id: None,
            event_type: EventType::Connection,
            event_timestamp: received_at,
            received_at,
            lat: None,
            lon: None,
            message_code: None,
            message_severity: None,
            details: EventDetails::Connection,
            payload: raw.to_string(),
        });
    }

    let mower_id = frame
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::Validation("frame has no mower id".to_string()))?;
    let frame_type = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("frame has no type".to_string()))?;
    let event_type = EventType::from_frame_type(frame_type)
        .ok_or_else(|| Error::Validation(format!("unsupported frame type {}", frame_type)))?;
    let attributes = frame
        .get("attributes")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Validation("frame has no attributes".to_string()))?;

    let event_timestamp = derive_timestamp(attributes).unwrap_or(received_at);

    let (lat, lon) = match event_type {
        EventType::Position => coordinates(attributes, "position"),
        EventType::Message => coordinates(attributes, "message"),
        _ => (None, None),
    };

    let (message_code, message_severity) = match attributes.get("message") {
        Some(message) => (
            message.get("code").and_then(Value::as_i64),
            message
                .get("severity")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
        None => (None, None),
    };

    let details = match event_type {
        EventType::Activity => EventDetails::Activity {
            activity: string_at(attributes, &["mower", "activity"]),
            name: string_at(attributes, &["system", "name"]),
        },
        EventType::Battery => EventDetails::Battery {
            percent: lookup(attributes, &["battery", "batteryPercent"]).and_then(Value::as_f64),
        },
        EventType::Position => EventDetails::Position,
        EventType::Message => EventDetails::Message,
        EventType::Connection => EventDetails::Connection,
    };

    Ok(Event {
        mower_id: Some(mower_id.to_string()),
        event_type,
        event_timestamp,
        received_at,
        lat,
        lon,
        message_code,
        message_severity,
        details,
        payload: raw.to_string(),
    })
}

/// Converts a JSON timestamp value into an instant.
///
/// Numbers (and numeric strings) are epoch seconds, or epoch milliseconds once
/// their magnitude exceeds 1e12. Other strings parse as RFC 3339 or as a naive
/// date-time read in UTC. Zero, negative and unparseable values yield `None`.
pub fn to_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_f64().and_then(from_epoch),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(numeric) = trimmed.parse::<f64>() {
                return from_epoch(numeric);
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(parsed.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value > MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

fn derive_timestamp(attributes: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let primary: [&[&str]; 2] = [&["metadata", "timestamp"], &["message", "time"]];

    primary
        .iter()
        .chain(FALLBACK_TIMESTAMP_PATHS.iter())
        .find_map(|path| lookup(attributes, path).and_then(to_instant))
}

fn coordinates(attributes: &Map<String, Value>, block: &str) -> (Option<f64>, Option<f64>) {
    (
        lookup(attributes, &[block, "latitude"]).and_then(Value::as_f64),
        lookup(attributes, &[block, "longitude"]).and_then(Value::as_f64),
    )
}

fn lookup<'a>(attributes: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = attributes.get(*first)?;
    for key in rest {
        current = current.get(*key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn string_at(attributes: &Map<String, Value>, path: &[&str]) -> Option<String> {
    lookup(attributes, path)
        .and_then(Value::as_str)
        .map(str::to_string)
}
