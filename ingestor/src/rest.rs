use crate::db::EventStore;
use crate::ingest::Ingestor;
use crate::interpolate::{heatmap, reconstruct, recent_path};
use crate::messages::{severity_symbol, MessageCatalog};
use crate::metrics::gather_metrics;
use crate::model::{LastMessage, LastPosition, MowerState, PathPoint, SessionSummary};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

const DEFAULT_SESSION_LIMIT: u32 = 10;
const MAX_SESSION_LIMIT: u32 = 100;
const DEFAULT_MESSAGE_LIMIT: u32 = 5;
const MAX_MESSAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
struct AppState {
    ingestor: Arc<Ingestor>,
    catalog: Arc<MessageCatalog>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    limit: Option<u32>,
    messages: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    mower_id: Option<String>,
}

/// Current view of a mower, with store fallbacks for fields the live state
/// has not seen yet.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MowerStatus {
    pub mower_id: String,
    pub name: String,
    pub activity: String,
    pub session_id: Option<i64>,
    pub is_charging: bool,
    pub battery_percent: Option<f64>,
    pub battery_at: Option<DateTime<Utc>>,
    pub last_position: Option<LastPosition>,
    pub last_message: Option<LastMessage>,
    pub last_message_description: Option<String>,
    pub last_message_symbol: Option<&'static str>,
    pub last_event_at: Option<DateTime<Utc>>,
}

pub fn create_router(ingestor: Arc<Ingestor>, catalog: Arc<MessageCatalog>) -> Router {
    let state = AppState { ingestor, catalog };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/mowers", get(list_mowers))
        .route("/api/mowers/:id/sessions", get(list_sessions))
        .route("/api/heatmap", get(get_heatmap))
        .route("/api/path/recent", get(get_recent_path))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics() -> String {
    gather_metrics()
}

async fn list_mowers(State(state): State<AppState>) -> Result<Json<Vec<MowerStatus>>, AppError> {
    let mut statuses = Vec::new();
    for mower in state.ingestor.states().all_mower_states() {
        statuses.push(mower_status(&mower, state.ingestor.store(), &state.catalog).await?);
    }
    Ok(Json(statuses))
}

async fn mower_status(
    mower: &MowerState,
    store: &EventStore,
    catalog: &MessageCatalog,
) -> Result<MowerStatus, AppError> {
    let (battery_percent, battery_at) = match mower.battery_percent {
        Some(percent) => (Some(percent), mower.battery_at),
        None => match store.latest_battery_reading(&mower.mower_id).await? {
            Some(reading) => (reading.percent, Some(reading.timestamp)),
            None => (None, None),
        },
    };

    let last_message = match &mower.last_message {
        Some(message) => Some(message.clone()),
        None => store
            .latest_message(&mower.mower_id)
            .await?
            .map(|stored| LastMessage {
                code: stored.code,
                severity: stored.severity,
                timestamp: stored.timestamp,
                lat: stored.lat,
                lon: stored.lon,
            }),
    };

    let last_message_description = last_message
        .as_ref()
        .and_then(|message| message.code)
        .and_then(|code| catalog.describe(code))
        .map(str::to_string);

    let last_message_symbol = last_message.as_ref().map(|message| {
        severity_symbol(message.severity.as_deref().unwrap_or_default())
    });

    Ok(MowerStatus {
        mower_id: mower.mower_id.clone(),
        name: mower.name.clone(),
        activity: mower.activity.clone(),
        session_id: mower.session_id,
        is_charging: mower.is_charging,
        battery_percent,
        battery_at,
        last_position: mower.last_position,
        last_message,
        last_message_description,
        last_message_symbol,
        last_event_at: mower.last_event_at,
    })
}

async fn list_sessions(
    State(state): State<AppState>,
    Path(mower_id): Path<String>,
    Query(params): Query<SessionQuery>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_SESSION_LIMIT)
        .min(MAX_SESSION_LIMIT);
    let messages = params
        .messages
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .min(MAX_MESSAGE_LIMIT);

    let summaries = state
        .ingestor
        .store()
        .session_summaries(&mower_id, limit, messages)
        .await?;
    Ok(Json(summaries))
}

async fn path_points(state: &AppState, mower_id: Option<&str>) -> Result<Vec<PathPoint>, AppError> {
    let positions = state.ingestor.store().positions(mower_id).await?;
    Ok(reconstruct(&positions, Utc::now()))
}

async fn get_heatmap(
    State(state): State<AppState>,
    Query(params): Query<PathQuery>,
) -> Result<Json<Vec<[f64; 3]>>, AppError> {
    let points = path_points(&state, params.mower_id.as_deref()).await?;
    Ok(Json(heatmap(&points)))
}

async fn get_recent_path(
    State(state): State<AppState>,
    Query(params): Query<PathQuery>,
) -> Result<Json<Vec<PathPoint>>, AppError> {
    let points = path_points(&state, params.mower_id.as_deref()).await?;
    Ok(Json(recent_path(&points)))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
