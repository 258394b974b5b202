/// Connection Registry (C3, §4.3) and the in-process Connection Manager
/// that backs it for sockets actually open on this process.
///
/// These are deliberately two different structures (§9 DESIGN NOTES,
/// "Connection registry as a message bus to live sockets"): the registry
/// is durable and visible to every process; the manager holds the live
/// `mpsc` sender half for a socket this process itself accepted. A
/// registry entry can outlive the process that owns the live connection —
/// the manager cannot.
use crate::error::Result;
use crate::models::{Connection, DeviceType};
use crate::websocket::WebSocketMessage;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn store(&self, connection: Connection) -> Result<()>;
    async fn delete(&self, user_id: &str, device_type: DeviceType) -> Result<()>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Connection>>;
}

pub struct PostgresConnectionRegistry {
    pool: PgPool,
}

impl PostgresConnectionRegistry {
    pub fn new(pool: PgPool) -> Self {
        PostgresConnectionRegistry { pool }
    }
}

#[async_trait]
impl ConnectionRegistry for PostgresConnectionRegistry {
    async fn store(&self, connection: Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_connections (
                user_id, device_type, websocket_id, connection_url, device_token, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, device_type, websocket_id) DO UPDATE
                SET connection_url = EXCLUDED.connection_url,
                    device_token = EXCLUDED.device_token
            "#,
        )
        .bind(&connection.user_id)
        .bind(connection.device_type.as_str())
        .bind(&connection.websocket_id)
        .bind(&connection.connection_url)
        .bind(&connection.device_token)
        .bind(connection.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: &str, device_type: DeviceType) -> Result<()> {
        sqlx::query("DELETE FROM user_connections WHERE user_id = $1 AND device_type = $2")
            .bind(user_id)
            .bind(device_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Connection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM user_connections WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    user_id: String,
    device_type: String,
    websocket_id: Option<String>,
    connection_url: Option<String>,
    device_token: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

impl From<ConnectionRow> for Connection {
    fn from(row: ConnectionRow) -> Self {
        Connection {
            user_id: row.user_id,
            device_type: if row.device_type == DeviceType::Ios.as_str() {
                DeviceType::Ios
            } else {
                DeviceType::Web
            },
            websocket_id: row.websocket_id,
            connection_url: row.connection_url,
            device_token: row.device_token,
            created_at: row.created_at,
        }
    }
}

/// In-memory registry for tests, mirroring `InMemoryEventStore`'s shape.
#[derive(Default)]
pub struct InMemoryConnectionRegistry {
    connections: RwLock<HashMap<(String, DeviceType), Vec<Connection>>>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        InMemoryConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn store(&self, connection: Connection) -> Result<()> {
        let mut map = self.connections.write().await;
        map.entry((connection.user_id.clone(), connection.device_type))
            .or_default()
            .push(connection);
        Ok(())
    }

    async fn delete(&self, user_id: &str, device_type: DeviceType) -> Result<()> {
        let mut map = self.connections.write().await;
        map.remove(&(user_id.to_string(), device_type));
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Connection>> {
        let map = self.connections.read().await;
        let mut result = Vec::new();
        for device_type in [DeviceType::Web, DeviceType::Ios] {
            if let Some(conns) = map.get(&(user_id.to_string(), device_type)) {
                result.extend(conns.iter().cloned());
            }
        }
        Ok(result)
    }
}

pub type SharedConnectionRegistry = Arc<dyn ConnectionRegistry>;

/// Type alias for the live WebSocket message sender, mirroring the
/// teacher's `websocket::manager::WebSocketSender`.
pub type WebSocketSender = mpsc::UnboundedSender<WebSocketMessage>;

/// In-process live-connection map: `user_id -> [sender]`. Thread-safe via
/// `Arc<RwLock<>>`, following the teacher's `ConnectionManager` almost
/// verbatim (keyed by `String` user_id here rather than `Uuid`, since this
/// spec's `user_id` is an opaque string, §3).
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<String, Vec<(String, WebSocketSender)>>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a live sender for `user_id` under `websocket_id`, returning
    /// nothing to undo with on disconnect beyond the id itself.
    pub async fn subscribe(&self, user_id: &str, websocket_id: String, sender: WebSocketSender) {
        let mut connections = self.connections.write().await;
        connections
            .entry(user_id.to_string())
            .or_default()
            .push((websocket_id, sender));
    }

    /// Removes one specific socket (by id) for a user, leaving any other
    /// live connections for that user untouched.
    pub async fn unsubscribe(&self, user_id: &str, websocket_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(senders) = connections.get_mut(user_id) {
            senders.retain(|(id, _)| id != websocket_id);
            if senders.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    /// Sends to every live connection this process holds for `user_id`.
    /// Returns the number of sockets the send was attempted on and the
    /// number that failed (closed channel) — used by the push Delivery
    /// Worker to decide success per §4.7.
    pub async fn send_to_user(&self, user_id: &str, message: &WebSocketMessage) -> (usize, usize) {
        let connections = self.connections.read().await;
        let Some(senders) = connections.get(user_id) else {
            return (0, 0);
        };
        let mut failures = 0;
        for (_, sender) in senders {
            if sender.send(message.clone()).is_err() {
                failures += 1;
            }
        }
        (senders.len(), failures)
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .read()
            .await
            .get(user_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub async fn clear_all(&self) {
        self.connections.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_by_user_is_empty_after_connect_then_disconnect() {
        let registry = InMemoryConnectionRegistry::new();
        let conn = Connection {
            user_id: "u1".into(),
            device_type: DeviceType::Web,
            websocket_id: Some("ws1".into()),
            connection_url: Some("wss://example/ws1".into()),
            device_token: None,
            created_at: Utc::now(),
        };
        registry.store(conn).await.unwrap();
        assert_eq!(registry.list_by_user("u1").await.unwrap().len(), 1);

        registry.delete("u1", DeviceType::Web).await.unwrap();
        assert_eq!(registry.list_by_user("u1").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn multiple_devices_for_same_user_are_listed_together() {
        let registry = InMemoryConnectionRegistry::new();
        registry
            .store(Connection {
                user_id: "u1".into(),
                device_type: DeviceType::Web,
                websocket_id: Some("ws1".into()),
                connection_url: Some("wss://example/ws1".into()),
                device_token: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        registry
            .store(Connection {
                user_id: "u1".into(),
                device_type: DeviceType::Ios,
                websocket_id: None,
                connection_url: None,
                device_token: Some("apns-token".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(registry.list_by_user("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn connection_manager_send_to_user_counts_attempts_and_failures() {
        let manager = ConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe("u1", "ws1".into(), tx).await;
        drop(rx); // simulate a closed socket

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.subscribe("u1", "ws2".into(), tx2).await;

        let (attempted, failed) = manager
            .send_to_user("u1", &WebSocketMessage::ping())
            .await;
        assert_eq!(attempted, 2);
        assert_eq!(failed, 1);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_the_named_socket() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.subscribe("u1", "ws1".into(), tx1).await;
        manager.subscribe("u1", "ws2".into(), tx2).await;

        manager.unsubscribe("u1", "ws1").await;
        assert_eq!(manager.connection_count("u1").await, 1);
    }
}
