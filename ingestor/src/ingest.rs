use crate::db::EventStore;
use crate::errors::Result;
use crate::metrics::{EVENTS_STORED_TOTAL, INGEST_LATENCY_SECONDS, POSITIONS_STORED_TOTAL};
use crate::model::{
    Event, EventDetails, EventType, LastMessage, LastPosition, MowerState, MowerStateUpdate,
    Position, ACTIVITY_CHARGING, ACTIVITY_UNKNOWN,
};
use crate::normalize::normalize;
use crate::state::MowerStates;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Persists events and reconciles mower state, one event at a time.
///
/// This is the single write path shared by the live stream consumer and the
/// replay tool.
#[derive(Debug, Clone)]
pub struct Ingestor {
    store: EventStore,
    states: Arc<MowerStates>,
}

/// What a single event changes: the state merge and an optional position fix
#[derive(Debug, Clone, PartialEq)]
pub struct IngestPlan {
    pub update: MowerStateUpdate,
    pub position: Option<Position>,
}

impl Ingestor {
    pub fn new(store: EventStore, states: Arc<MowerStates>) -> Self {
        Self { store, states }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn states(&self) -> &Arc<MowerStates> {
        &self.states
    }

    /// Normalizes a raw frame received now and ingests it.
    pub async fn handle_frame(&self, raw: &str) -> Result<i64> {
        let event = normalize(raw, Utc::now())?;
        self.ingest(&event).await
    }

    /// Stores the event, then its position fix, then applies the state merge.
    ///
    /// A persistence failure abandons the event before any state changes.
    pub async fn ingest(&self, event: &Event) -> Result<i64> {
        let start = Instant::now();
        let event_id = self.store.store_event(event).await?;
        EVENTS_STORED_TOTAL.inc();

        let Some(mower_id) = event.mower_id.as_deref() else {
            debug!("Stored {} event {}", event.event_type.as_str(), event_id);
            return Ok(event_id);
        };

        let current = self.states.mower_state(mower_id);
        let plan = plan_ingest(current.as_deref(), mower_id, event);

        if let Some(mut position) = plan.position {
            position.event_id = Some(event_id);
            if self.store.store_position(&position).await? {
                POSITIONS_STORED_TOTAL.inc();
            }
        }

        self.states.update_mower_state(mower_id, plan.update);
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        debug!(
            "Ingested {} event {} for mower {}",
            event.event_type.as_str(),
            event_id,
            mower_id
        );
        Ok(event_id)
    }
}

/// Derives the state merge and position fix for `event` given the mower's
/// current state.
///
/// A new session id (the transition instant in epoch milliseconds) is minted
/// when the reported activity differs from the recorded one, or when no
/// session has been recorded yet. The second case is intentional: a mower
/// seeded from the fleet snapshot already carries its activity but no
/// session, and its first activity report must still open one. Fixes inherit
/// the current session and activity.
pub fn plan_ingest(current: Option<&MowerState>, mower_id: &str, event: &Event) -> IngestPlan {
    let mut update = MowerStateUpdate {
        last_event_at: Some(event.event_timestamp),
        ..Default::default()
    };

    match &event.details {
        EventDetails::Activity { activity, name } => {
            update.name = name.clone();
            if let Some(activity) = activity {
                let previous = current.map(|state| state.activity.as_str());
                let has_session = current.is_some_and(|state| state.session_id.is_some());
                if previous != Some(activity.as_str()) || !has_session {
                    update.session_id = Some(event.event_timestamp.timestamp_millis());
                    update.last_activity_at = Some(event.event_timestamp);
                }
                update.is_charging = Some(activity == ACTIVITY_CHARGING);
                update.activity = Some(activity.clone());
            }
        }
        EventDetails::Battery { percent } => {
            if percent.is_some() {
                update.battery_percent = *percent;
                update.battery_at = Some(event.event_timestamp);
            }
        }
        EventDetails::Message => {
            update.last_message = Some(LastMessage {
                code: event.message_code,
                severity: event.message_severity.clone(),
                timestamp: event.event_timestamp,
                lat: event.lat,
                lon: event.lon,
            });
        }
        EventDetails::Position | EventDetails::Connection => {}
    }

    let position = match (event.event_type, event.coordinates()) {
        (EventType::Position | EventType::Message, Some((lat, lon))) => {
            if event.event_type == EventType::Position {
                update.last_position = Some(LastPosition {
                    lat,
                    lon,
                    timestamp: event.event_timestamp,
                });
            }
            Some(Position {
                mower_id: mower_id.to_string(),
                session_id: current.and_then(|state| state.session_id),
                activity: current
                    .map(|state| state.activity.clone())
                    .unwrap_or_else(|| ACTIVITY_UNKNOWN.to_string()),
                lat,
                lon,
                timestamp: event.event_timestamp,
                event_id: None,
            })
        }
        _ => None,
    };

    IngestPlan { update, position }
}
