use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ACTIVITY_MOWING: &str = "MOWING";
pub const ACTIVITY_CHARGING: &str = "CHARGING";
pub const ACTIVITY_UNKNOWN: &str = "UNKNOWN";
pub const UNKNOWN_MOWER_NAME: &str = "Unknown";

/// Canonical event kinds persisted in the `events` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Connection,
    Activity,
    Position,
    Message,
    Battery,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connection => "connection",
            EventType::Activity => "activity",
            EventType::Position => "position",
            EventType::Message => "message",
            EventType::Battery => "battery",
        }
    }

    /// Maps an inbound frame `type` discriminator, with or without the
    /// `-v2` suffix, onto an event kind.
    pub fn from_frame_type(frame_type: &str) -> Option<Self> {
        let base = frame_type.strip_suffix("-v2").unwrap_or(frame_type);
        match base {
            "mower-event" => Some(EventType::Activity),
            "position-event" => Some(EventType::Position),
            "message-event" => Some(EventType::Message),
            "battery-event" => Some(EventType::Battery),
            _ => None,
        }
    }
}

/// Type-specific values pulled out of a frame during normalization
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetails {
    Connection,
    Activity {
        activity: Option<String>,
        name: Option<String>,
    },
    Position,
    Message,
    Battery {
        percent: Option<f64>,
    },
}

/// A normalized inbound event. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub mower_id: Option<String>,
    pub event_type: EventType,
    pub event_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub message_code: Option<i64>,
    pub message_severity: Option<String>,
    pub details: EventDetails,
    /// Frame text exactly as received
    pub payload: String,
}

impl Event {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// A position fix, written to and read back from the `positions` table
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub mower_id: String,
    pub session_id: Option<i64>,
    pub activity: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub event_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub code: Option<i64>,
    pub severity: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPosition {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
}

/// Live view of a single mower
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MowerState {
    pub mower_id: String,
    pub name: String,
    pub activity: String,
    pub session_id: Option<i64>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub battery_percent: Option<f64>,
    pub battery_at: Option<DateTime<Utc>>,
    pub is_charging: bool,
    pub last_message: Option<LastMessage>,
    pub last_position: Option<LastPosition>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl MowerState {
    pub fn new(mower_id: impl Into<String>) -> Self {
        Self {
            mower_id: mower_id.into(),
            name: UNKNOWN_MOWER_NAME.to_string(),
            activity: ACTIVITY_UNKNOWN.to_string(),
            session_id: None,
            last_activity_at: None,
            battery_percent: None,
            battery_at: None,
            is_charging: false,
            last_message: None,
            last_position: None,
            last_event_at: None,
        }
    }
}

/// Partial update merged onto a [`MowerState`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MowerStateUpdate {
    pub name: Option<String>,
    pub activity: Option<String>,
    pub session_id: Option<i64>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub battery_percent: Option<f64>,
    pub battery_at: Option<DateTime<Utc>>,
    pub is_charging: Option<bool>,
    pub last_message: Option<LastMessage>,
    pub last_position: Option<LastPosition>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Entry of the bulk fleet snapshot fetched at startup
#[derive(Debug, Clone, PartialEq)]
pub struct MowerSnapshot {
    pub mower_id: String,
    pub name: Option<String>,
    pub activity: Option<String>,
    pub battery_percent: Option<f64>,
}

/// A message-type event as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub mower_id: String,
    pub timestamp: DateTime<Utc>,
    pub code: Option<i64>,
    pub severity: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryReading {
    pub mower_id: String,
    pub percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: i64,
    pub activity: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub point_count: i64,
    pub messages: Vec<StoredMessage>,
}

/// One emitted point of a reconstructed path
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPoint {
    pub lat: f64,
    pub lon: f64,
    pub weight: f64,
    pub session_id: Option<i64>,
    pub is_endpoint: bool,
}
