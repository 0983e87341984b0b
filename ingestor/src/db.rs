use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{BatteryReading, Event, Position, SessionSummary, StoredMessage};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Durable, idempotent event history and position log.
///
/// SQLite in WAL mode: the HTTP surface reads while the consumer task writes.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!("Database connection established");
        Self::migrate(pool).await
    }

    /// Single-connection in-memory store, used by tests and dry replays.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Appends an event and returns its row id.
    ///
    /// Redelivery of the same (mower, type, timestamp, payload) only refreshes
    /// `received_at` and returns the id of the existing row.
    pub async fn store_event(&self, event: &Event) -> Result<i64> {
        retry_transient("event insert", move || self.insert_event(event)).await
    }

    async fn insert_event(&self, event: &Event) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO events (
                mower_id, event_type, event_timestamp, received_at,
                lat, lon, message_code, message_severity, payload
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (mower_id, event_type, event_timestamp, payload)
            DO UPDATE SET received_at = excluded.received_at
            RETURNING id
            "#,
        )
        .bind(event.mower_id.as_deref())
        .bind(event.event_type.as_str())
        .bind(format_timestamp(&event.event_timestamp))
        .bind(format_timestamp(&event.received_at))
        .bind(event.lat)
        .bind(event.lon)
        .bind(event.message_code)
        .bind(event.message_severity.as_deref())
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Records a position fix keyed by (mower, timestamp, lat, lon).
    ///
    /// Returns `true` when a new row was written. A repeat of an existing fix
    /// is ignored apart from backfilling a missing event link.
    pub async fn store_position(&self, position: &Position) -> Result<bool> {
        match retry_transient("position insert", move || self.insert_position(position)).await {
            Ok(inserted) => Ok(inserted),
            Err(e) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn insert_position(&self, position: &Position) -> Result<bool> {
        let timestamp = format_timestamp(&position.timestamp);
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO positions (mower_id, session_id, activity, lat, lon, timestamp, event_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&position.mower_id)
        .bind(position.session_id)
        .bind(&position.activity)
        .bind(position.lat)
        .bind(position.lon)
        .bind(&timestamp)
        .bind(position.event_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            if let Some(event_id) = position.event_id {
                sqlx::query(
                    r#"
                    UPDATE positions SET event_id = ?1
                    WHERE mower_id = ?2 AND timestamp = ?3 AND lat = ?4 AND lon = ?5
                      AND event_id IS NULL
                    "#,
                )
                .bind(event_id)
                .bind(&position.mower_id)
                .bind(&timestamp)
                .bind(position.lat)
                .bind(position.lon)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(inserted)
    }

    /// Most recent `limit` sessions of a mower, newest first, each with up to
    /// `message_limit` message events inside its time span.
    pub async fn session_summaries(
        &self,
        mower_id: &str,
        limit: u32,
        message_limit: u32,
    ) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id,
                   MAX(activity) AS activity,
                   MIN(timestamp) AS started_at,
                   MAX(timestamp) AS ended_at,
                   COUNT(*) AS point_count
            FROM positions
            WHERE mower_id = ?1 AND session_id IS NOT NULL
            GROUP BY session_id
            ORDER BY MAX(timestamp) DESC
            LIMIT ?2
            "#,
        )
        .bind(mower_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let started_at: String = row.try_get("started_at")?;
            let ended_at: String = row.try_get("ended_at")?;
            let messages = if message_limit == 0 {
                Vec::new()
            } else {
                self.messages_between(mower_id, &started_at, &ended_at, message_limit)
                    .await?
            };

            let start = parse_timestamp(&started_at)?;
            let end = parse_timestamp(&ended_at)?;

            summaries.push(SessionSummary {
                session_id: row.try_get("session_id")?,
                activity: row.try_get("activity")?,
                start,
                end,
                duration_seconds: (end - start).num_seconds(),
                point_count: row.try_get("point_count")?,
                messages,
            });
        }

        Ok(summaries)
    }

    async fn messages_between(
        &self,
        mower_id: &str,
        start: &str,
        end: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mower_id, event_timestamp, message_code, message_severity, lat, lon
            FROM events
            WHERE mower_id = ?1 AND event_type = 'message'
              AND event_timestamp >= ?2 AND event_timestamp <= ?3
            ORDER BY event_timestamp DESC, id DESC
            LIMIT ?4
            "#,
        )
        .bind(mower_id)
        .bind(start)
        .bind(end)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn latest_message(&self, mower_id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, mower_id, event_timestamp, message_code, message_severity, lat, lon
            FROM events
            WHERE mower_id = ?1 AND event_type = 'message'
            ORDER BY event_timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(mower_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn latest_battery_reading(&self, mower_id: &str) -> Result<Option<BatteryReading>> {
        let row = sqlx::query(
            r#"
            SELECT mower_id, event_timestamp, payload
            FROM events
            WHERE mower_id = ?1 AND event_type = 'battery'
            ORDER BY event_timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(mower_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.try_get("payload")?;
        let percent = serde_json::from_str::<serde_json::Value>(&payload)
            .ok()
            .and_then(|value| {
                value
                    .pointer("/attributes/battery/batteryPercent")
                    .and_then(serde_json::Value::as_f64)
            });
        let timestamp: String = row.try_get("event_timestamp")?;

        Ok(Some(BatteryReading {
            mower_id: row.try_get("mower_id")?,
            percent,
            timestamp: parse_timestamp(&timestamp)?,
        }))
    }

    /// All stored fixes ordered by mower then timestamp, optionally for one mower.
    pub async fn positions(&self, mower_id: Option<&str>) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT mower_id, session_id, activity, lat, lon, timestamp, event_id
            FROM positions
            WHERE ?1 IS NULL OR mower_id = ?1
            ORDER BY mower_id, timestamp, id
            "#,
        )
        .bind(mower_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.try_get("timestamp")?;
                Ok(Position {
                    mower_id: row.try_get("mower_id")?,
                    session_id: row.try_get("session_id")?,
                    activity: row.try_get("activity")?,
                    lat: row.try_get("lat")?,
                    lon: row.try_get("lon")?,
                    timestamp: parse_timestamp(&timestamp)?,
                    event_id: row.try_get("event_id")?,
                })
            })
            .collect()
    }

    pub async fn count_events(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_positions(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM positions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Stored timestamps are fixed-width RFC 3339 so text order is time order.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid stored timestamp {}: {}", value, e)))
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let timestamp: String = row.try_get("event_timestamp")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        mower_id: row.try_get("mower_id")?,
        timestamp: parse_timestamp(&timestamp)?,
        code: row.try_get("message_code")?,
        severity: row.try_get("message_severity")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
    })
}

async fn retry_transient<T, F, Fut>(label: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Database(db_err))
                if attempts < MAX_WRITE_ATTEMPTS && is_transient_error(&db_err) =>
            {
                let wait_ms = 100 * 2_u64.pow(attempts - 1);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    label, attempts, MAX_WRITE_ATTEMPTS, wait_ms, db_err
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                if !e.is_unique_violation() {
                    error!("{} failed after {} attempts: {}", label, attempts, e);
                    DB_FAILURES_TOTAL.inc();
                }
                return Err(e);
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY / SQLITE_LOCKED, including extended codes
            db_err.code().is_some_and(|code| {
                code.parse::<i32>()
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false)
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventDetails, EventType};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap() + ChronoDuration::seconds(seconds)
    }

    fn event(event_type: EventType, seconds: i64, payload: &str) -> Event {
        Event {
            mower_id: Some("mower-1".to_string()),
            event_type,
            event_timestamp: at(seconds),
            received_at: Utc::now(),
            lat: None,
            lon: None,
            message_code: None,
            message_severity: None,
            details: EventDetails::Position,
            payload: payload.to_string(),
        }
    }

    fn position(seconds: i64, session_id: i64, lat: f64, lon: f64) -> Position {
        Position {
            mower_id: "mower-1".to_string(),
            session_id: Some(session_id),
            activity: "MOWING".to_string(),
            lat,
            lon,
            timestamp: at(seconds),
            event_id: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_event_updates_received_at_only() {
        let store = EventStore::in_memory().await.unwrap();
        let mut first = event(EventType::Position, 0, r#"{"p":1}"#);
        first.received_at = at(5);
        let mut second = first.clone();
        second.received_at = at(9);

        let id_a = store.store_event(&first).await.unwrap();
        let id_b = store.store_event(&second).await.unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(store.count_events().await.unwrap(), 1);

        let received: String = sqlx::query_scalar("SELECT received_at FROM events WHERE id = ?1")
            .bind(id_a)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(received, format_timestamp(&at(9)));
    }

    #[tokio::test]
    async fn test_distinct_payloads_are_distinct_events() {
        let store = EventStore::in_memory().await.unwrap();
        let id_a = store
            .store_event(&event(EventType::Position, 0, r#"{"p":1}"#))
            .await
            .unwrap();
        let id_b = store
            .store_event(&event(EventType::Position, 0, r#"{"p":2}"#))
            .await
            .unwrap();

        assert_ne!(id_a, id_b);
        assert_eq!(store.count_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_position_ignored_and_link_backfilled() {
        let store = EventStore::in_memory().await.unwrap();
        let event_id = store
            .store_event(&event(EventType::Position, 0, "{}"))
            .await
            .unwrap();

        let unlinked = position(0, 1, 57.0, 11.0);
        assert!(store.store_position(&unlinked).await.unwrap());

        let mut linked = unlinked.clone();
        linked.event_id = Some(event_id);
        assert!(!store.store_position(&linked).await.unwrap());

        let positions = store.positions(Some("mower-1")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].event_id, Some(event_id));
    }

    #[tokio::test]
    async fn test_event_link_is_unique_across_positions() {
        let store = EventStore::in_memory().await.unwrap();
        let event_id = store
            .store_event(&event(EventType::Position, 0, "{}"))
            .await
            .unwrap();

        let mut first = position(0, 1, 57.0, 11.0);
        first.event_id = Some(event_id);
        let mut second = position(1, 1, 57.1, 11.1);
        second.event_id = Some(event_id);

        assert!(store.store_position(&first).await.unwrap());
        assert!(!store.store_position(&second).await.unwrap());
        assert_eq!(store.count_positions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_summaries_newest_first_with_messages() {
        let store = EventStore::in_memory().await.unwrap();

        for (offset, lat) in [(0, 57.0), (60, 57.001), (120, 57.002)] {
            store
                .store_position(&position(offset, 100, lat, 11.0))
                .await
                .unwrap();
        }
        for (offset, lat) in [(1_000, 57.0), (1_030, 57.001)] {
            store
                .store_position(&position(offset, 200, lat, 11.0))
                .await
                .unwrap();
        }

        let mut inside = event(EventType::Message, 60, r#"{"m":1}"#);
        inside.message_code = Some(13);
        inside.message_severity = Some("WARNING".to_string());
        store.store_event(&inside).await.unwrap();
        store
            .store_event(&event(EventType::Message, 500, r#"{"m":2}"#))
            .await
            .unwrap();

        let summaries = store.session_summaries("mower-1", 10, 5).await.unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].session_id, 200);
        assert_eq!(summaries[0].point_count, 2);
        assert_eq!(summaries[0].duration_seconds, 30);
        assert!(summaries[0].messages.is_empty());

        assert_eq!(summaries[1].session_id, 100);
        assert_eq!(summaries[1].start, at(0));
        assert_eq!(summaries[1].end, at(120));
        assert_eq!(summaries[1].messages.len(), 1);
        assert_eq!(summaries[1].messages[0].code, Some(13));

        let limited = store.session_summaries("mower-1", 1, 0).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].session_id, 200);
    }

    #[tokio::test]
    async fn test_latest_message_and_battery() {
        let store = EventStore::in_memory().await.unwrap();
        assert!(store.latest_message("mower-1").await.unwrap().is_none());
        assert!(store.latest_battery_reading("mower-1").await.unwrap().is_none());

        let mut older = event(EventType::Message, 0, r#"{"m":"old"}"#);
        older.message_code = Some(1);
        let mut newer = event(EventType::Message, 10, r#"{"m":"new"}"#);
        newer.message_code = Some(2);
        store.store_event(&newer).await.unwrap();
        store.store_event(&older).await.unwrap();

        store
            .store_event(&event(
                EventType::Battery,
                3,
                r#"{"attributes":{"battery":{"batteryPercent":64}}}"#,
            ))
            .await
            .unwrap();

        let message = store.latest_message("mower-1").await.unwrap().unwrap();
        assert_eq!(message.code, Some(2));

        let battery = store.latest_battery_reading("mower-1").await.unwrap().unwrap();
        assert_eq!(battery.percent, Some(64.0));
        assert_eq!(battery.timestamp, at(3));
    }

    #[tokio::test]
    async fn test_positions_ordered_by_mower_then_time() {
        let store = EventStore::in_memory().await.unwrap();
        let mut other = position(0, 1, 1.0, 1.0);
        other.mower_id = "mower-0".to_string();

        store.store_position(&position(20, 1, 2.0, 2.0)).await.unwrap();
        store.store_position(&position(10, 1, 3.0, 3.0)).await.unwrap();
        store.store_position(&other).await.unwrap();

        let all = store.positions(None).await.unwrap();
        let order: Vec<(String, f64)> = all.iter().map(|p| (p.mower_id.clone(), p.lat)).collect();
        assert_eq!(
            order,
            vec![
                ("mower-0".to_string(), 1.0),
                ("mower-1".to_string(), 3.0),
                ("mower-1".to_string(), 2.0)
            ]
        );

        assert_eq!(store.positions(Some("mower-0")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/mower.sqlite").display());
        let store = EventStore::connect(&url).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        store.close().await;
    }
}
