/// Event Store (C2, §4.2).
///
/// Keyed record store of events by `event_id`; supports put-if-absent and
/// partial attribute updates of `status` and per-channel retry counters.
/// Writes are attribute-scoped and therefore commute across concurrent
/// channel workers (§5) — there is no general check-and-set.
use crate::error::Result;
use crate::models::{Event, EventAttributes, EventStatus, EventType, Channel};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts the event iff no record with this `event_id` exists yet.
    /// Returns `true` if this call performed the insert, `false` if a
    /// record already existed (the idempotent-redelivery case, §4.5 step 4).
    async fn put_if_absent(&self, event: &Event) -> Result<bool>;

    /// Updates the unified `status` summary column. Callers must not
    /// demote a terminal state; the store itself does not enforce this
    /// (§4.2) — it is the worker's responsibility.
    async fn update_status(&self, event_id: &str, status: EventStatus) -> Result<()>;

    /// Updates the per-channel status column (extension adopted per the
    /// spec's recommended resolution to cross-channel status contention).
    async fn update_channel_status(
        &self,
        event_id: &str,
        channel: Channel,
        status: EventStatus,
    ) -> Result<()>;

    /// Updates `retry_count_<channel>` to `n`.
    async fn update_retry(&self, event_id: &str, channel: Channel, n: i32) -> Result<()>;

    async fn get(&self, event_id: &str) -> Result<Option<Event>>;

    /// Best-effort, eventually-consistent scan by a single attribute
    /// equality filter (§4.2).
    async fn scan(&self, filter_key: &str, filter_value: &str) -> Result<Vec<Event>>;
}

/// PostgreSQL-backed implementation. Follows the teacher's raw
/// `sqlx::query` style (no compile-time `query!` macro, since the pack
/// ships no offline query cache to verify against).
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresEventStore { pool }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn put_if_absent(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO event (
                event_id, status, status_sms, status_email, status_push,
                user_id, event_type,
                retry_count_sms, retry_count_email, retry_count_push,
                parent_id, parent_type, payload_timestamp, priority,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(event.status.as_str())
        .bind(event.status_sms.map(|s| s.as_str()))
        .bind(event.status_email.map(|s| s.as_str()))
        .bind(event.status_push.map(|s| s.as_str()))
        .bind(&event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.retry_count_sms)
        .bind(event.retry_count_email)
        .bind(event.retry_count_push)
        .bind(&event.payload.parent_id)
        .bind(&event.payload.parent_type)
        .bind(event.payload.timestamp)
        .bind(&event.payload.priority)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, event_id: &str, status: EventStatus) -> Result<()> {
        sqlx::query(
            "UPDATE event SET status = $1, updated_at = $2 WHERE event_id = $3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_channel_status(
        &self,
        event_id: &str,
        channel: Channel,
        status: EventStatus,
    ) -> Result<()> {
        let column = match channel {
            Channel::Sms => "status_sms",
            Channel::Email => "status_email",
            Channel::Push => "status_push",
        };
        let query = format!(
            "UPDATE event SET {column} = $1, updated_at = $2 WHERE event_id = $3"
        );
        sqlx::query(&query)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_retry(&self, event_id: &str, channel: Channel, n: i32) -> Result<()> {
        let column = match channel {
            Channel::Sms => "retry_count_sms",
            Channel::Email => "retry_count_email",
            Channel::Push => "retry_count_push",
        };
        let query = format!(
            "UPDATE event SET {column} = $1, updated_at = $2 WHERE event_id = $3"
        );
        sqlx::query(&query)
            .bind(n)
            .bind(Utc::now())
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM event WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn scan(&self, filter_key: &str, filter_value: &str) -> Result<Vec<Event>> {
        // filter_key is restricted to a fixed allow-list of column names so
        // it can never be used to inject arbitrary SQL.
        let column = match filter_key {
            "user_id" => "user_id",
            "status" => "status",
            "event_type" => "event_type",
            other => {
                return Err(crate::error::Error::permanent(format!(
                    "scan: unsupported filter_key '{other}'"
                )))
            }
        };
        let query = format!("SELECT * FROM event WHERE {column} = $1");
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(filter_value)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    status: String,
    status_sms: Option<String>,
    status_email: Option<String>,
    status_push: Option<String>,
    user_id: String,
    event_type: String,
    retry_count_sms: i32,
    retry_count_email: i32,
    retry_count_push: i32,
    parent_id: Option<String>,
    parent_type: Option<String>,
    payload_timestamp: Option<chrono::DateTime<Utc>>,
    priority: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            event_id: row.event_id,
            status: EventStatus::from_str_lenient(&row.status),
            status_sms: row.status_sms.as_deref().map(EventStatus::from_str_lenient),
            status_email: row.status_email.as_deref().map(EventStatus::from_str_lenient),
            status_push: row.status_push.as_deref().map(EventStatus::from_str_lenient),
            user_id: row.user_id,
            event_type: EventType::parse_lenient(&row.event_type),
            retry_count_sms: row.retry_count_sms,
            retry_count_email: row.retry_count_email,
            retry_count_push: row.retry_count_push,
            payload: EventAttributes {
                parent_id: row.parent_id,
                parent_type: row.parent_type,
                timestamp: row.payload_timestamp,
                priority: row.priority,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// In-memory store backing unit and integration tests (§4.2, §10 test
/// tooling).
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<HashMap<String, Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        InMemoryEventStore {
            events: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put_if_absent(&self, event: &Event) -> Result<bool> {
        let mut events = self.events.lock().await;
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn update_status(&self, event_id: &str, status: EventStatus) -> Result<()> {
        let mut events = self.events.lock().await;
        if let Some(e) = events.get_mut(event_id) {
            e.status = status;
            e.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_channel_status(
        &self,
        event_id: &str,
        channel: Channel,
        status: EventStatus,
    ) -> Result<()> {
        let mut events = self.events.lock().await;
        if let Some(e) = events.get_mut(event_id) {
            match channel {
                Channel::Sms => e.status_sms = Some(status),
                Channel::Email => e.status_email = Some(status),
                Channel::Push => e.status_push = Some(status),
            }
            e.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_retry(&self, event_id: &str, channel: Channel, n: i32) -> Result<()> {
        let mut events = self.events.lock().await;
        if let Some(e) = events.get_mut(event_id) {
            match channel {
                Channel::Sms => e.retry_count_sms = n,
                Channel::Email => e.retry_count_email = n,
                Channel::Push => e.retry_count_push = n,
            }
            e.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(self.events.lock().await.get(event_id).cloned())
    }

    async fn scan(&self, filter_key: &str, filter_value: &str) -> Result<Vec<Event>> {
        let events = self.events.lock().await;
        let matches = events
            .values()
            .filter(|e| match filter_key {
                "user_id" => e.user_id == filter_value,
                "status" => e.status.as_str() == filter_value,
                "event_type" => e.event_type.as_str().eq_ignore_ascii_case(filter_value),
                _ => false,
            })
            .cloned()
            .collect();
        Ok(matches)
    }
}

pub type SharedEventStore = Arc<dyn EventStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(id: &str) -> Event {
        Event {
            event_id: id.to_string(),
            status: EventStatus::Start,
            status_sms: None,
            status_email: None,
            status_push: None,
            user_id: "u1".to_string(),
            event_type: EventType::Like,
            retry_count_sms: 0,
            retry_count_email: 0,
            retry_count_push: 0,
            payload: EventAttributes::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_if_absent_inserts_once() {
        let store = InMemoryEventStore::new();
        assert!(store.put_if_absent(&sample_event("e1")).await.unwrap());
        assert!(!store.put_if_absent(&sample_event("e1")).await.unwrap());
    }

    #[tokio::test]
    async fn retry_counts_are_per_channel() {
        let store = InMemoryEventStore::new();
        store.put_if_absent(&sample_event("e1")).await.unwrap();
        store.update_retry("e1", Channel::Sms, 3).await.unwrap();
        let event = store.get("e1").await.unwrap().unwrap();
        assert_eq!(event.retry_count_sms, 3);
        assert_eq!(event.retry_count_email, 0);
    }

    #[tokio::test]
    async fn channel_status_is_independent_of_summary_status() {
        let store = InMemoryEventStore::new();
        store.put_if_absent(&sample_event("e1")).await.unwrap();
        store
            .update_channel_status("e1", Channel::Email, EventStatus::Failed)
            .await
            .unwrap();
        store.update_status("e1", EventStatus::Success).await.unwrap();

        let event = store.get("e1").await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(event.channel_status(Channel::Email), Some(EventStatus::Failed));
        assert_eq!(event.channel_status(Channel::Sms), None);
    }

    #[tokio::test]
    async fn scan_filters_by_attribute() {
        let store = InMemoryEventStore::new();
        store.put_if_absent(&sample_event("e1")).await.unwrap();
        let mut other = sample_event("e2");
        other.user_id = "u2".to_string();
        store.put_if_absent(&other).await.unwrap();

        let results = store.scan("user_id", "u1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_id, "e1");
    }
}
