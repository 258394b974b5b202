/// User preferences lookup, used by the Ingress Router (§3, §4.5 step 5).
/// Missing preferences (no row, or a lookup error) default to all
/// channels enabled and no suppression — the router must never block on a
/// preferences outage.
use crate::models::UserPreferences;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn get(&self, user_id: &str) -> UserPreferences;

    /// `user_type` participates in the priority predicate (§4.5) but isn't
    /// part of the notification-channel preferences proper; the teacher's
    /// `notification_service.rs` and the source both model it as a
    /// separate lookup.
    async fn user_type(&self, user_id: &str) -> Option<String>;
}

pub struct PostgresPreferencesStore {
    pool: PgPool,
}

impl PostgresPreferencesStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresPreferencesStore { pool }
    }
}

#[async_trait]
impl PreferencesStore for PostgresPreferencesStore {
    async fn get(&self, user_id: &str) -> UserPreferences {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT notification_preferences FROM user_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(json)) => serde_json::from_value(json).unwrap_or_else(|e| {
                warn!(user_id, error = %e, "malformed preferences, using defaults");
                UserPreferences::default()
            }),
            Ok(None) => UserPreferences::default(),
            Err(e) => {
                warn!(user_id, error = %e, "preferences lookup failed, using defaults");
                UserPreferences::default()
            }
        }
    }

    async fn user_type(&self, user_id: &str) -> Option<String> {
        sqlx::query_scalar::<_, String>("SELECT user_type FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .unwrap_or_else(|e| {
                warn!(user_id, error = %e, "user_type lookup failed");
                None
            })
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryPreferencesStore {
    preferences: Mutex<HashMap<String, UserPreferences>>,
    user_types: Mutex<HashMap<String, String>>,
}

impl InMemoryPreferencesStore {
    pub fn new() -> Self {
        InMemoryPreferencesStore {
            preferences: Mutex::new(HashMap::new()),
            user_types: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set(&self, user_id: &str, prefs: UserPreferences) {
        self.preferences
            .lock()
            .await
            .insert(user_id.to_string(), prefs);
    }

    pub async fn set_user_type(&self, user_id: &str, user_type: &str) {
        self.user_types
            .lock()
            .await
            .insert(user_id.to_string(), user_type.to_string());
    }
}

#[async_trait]
impl PreferencesStore for InMemoryPreferencesStore {
    async fn get(&self, user_id: &str) -> UserPreferences {
        self.preferences
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn user_type(&self, user_id: &str) -> Option<String> {
        self.user_types.lock().await.get(user_id).cloned()
    }
}

pub type SharedPreferencesStore = Arc<dyn PreferencesStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_user_defaults_to_all_channels_enabled() {
        let store = InMemoryPreferencesStore::new();
        let prefs = store.get("unknown-user").await;
        assert!(prefs.sms && prefs.email && prefs.push);
        assert!(!prefs.priority_only);
        assert!(!prefs.quiet_hours.enabled);
    }

    #[tokio::test]
    async fn explicit_preferences_round_trip() {
        let store = InMemoryPreferencesStore::new();
        let mut prefs = UserPreferences::default();
        prefs.sms = false;
        prefs.priority_only = true;
        store.set("u1", prefs).await;

        let fetched = store.get("u1").await;
        assert!(!fetched.sms);
        assert!(fetched.priority_only);
    }
}
