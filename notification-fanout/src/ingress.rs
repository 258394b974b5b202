/// Ingress Router (C5, §4.5): the single entry point from the fanout topic
/// into the per-channel priority queues. Grounded on
/// `original_source/sqs_listener.py`'s main loop — parse envelope, resolve
/// or mint `event_id`, dedupe via `PutIfAbsent`, resolve preferences and
/// priority, enqueue one message per enabled-and-unsuppressed channel, then
/// delete the source messages in a batch.
use crate::bus::{queues, MessageBus};
use crate::connections::SharedConnectionRegistry;
use crate::error::Result;
use crate::models::{
    Channel, ChannelMessage, Event, EventAttributes, EventStatus, EventType, EventWirePayload,
    FanoutEnvelope, Priority, ReceivedMessage,
};
use crate::preferences::SharedPreferencesStore;
use crate::priority::{classify, should_suppress};
use crate::store::SharedEventStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct IngressRouter {
    bus: Arc<dyn MessageBus>,
    store: SharedEventStore,
    preferences: SharedPreferencesStore,
    #[allow(dead_code)]
    connections: SharedConnectionRegistry,
}

/// Result of routing a single source message, used by the caller to decide
/// whether the source message should be deleted from `event_queue`.
pub enum RouteOutcome {
    /// Routed (or recognized as a duplicate redelivery) — safe to delete.
    Routed,
    /// Malformed payload that can never be processed — still safe to
    /// delete (§4.5 edge cases: a poison-pill message must not wedge the
    /// queue by being redelivered forever).
    Malformed { reason: String },
}

impl IngressRouter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: SharedEventStore,
        preferences: SharedPreferencesStore,
        connections: SharedConnectionRegistry,
    ) -> Self {
        IngressRouter {
            bus,
            store,
            preferences,
            connections,
        }
    }

    /// Receives a batch from `event_queue`, routes each message, and
    /// deletes every message that was either routed or recognized as
    /// unprocessable. Returns the number of messages deleted.
    pub async fn run_once(&self, max_messages: i32, wait_seconds: i32) -> Result<usize> {
        let messages = self
            .bus
            .receive(queues::EVENT_QUEUE, max_messages, wait_seconds)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }

        let mut to_delete = Vec::new();
        for message in &messages {
            match self.route_one(message).await {
                Ok(RouteOutcome::Routed) => to_delete.push(message.receipt_handle.clone()),
                Ok(RouteOutcome::Malformed { reason }) => {
                    warn!(message_id = %message.id, reason, "dropping unprocessable ingress message");
                    to_delete.push(message.receipt_handle.clone());
                }
                Err(e) if e.is_retryable() => {
                    debug!(message_id = %message.id, error = %e, "transient routing failure, leaving for redelivery");
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "permanent routing failure, dropping");
                    to_delete.push(message.receipt_handle.clone());
                }
            }
        }

        if !to_delete.is_empty() {
            self.bus
                .delete_batch(queues::EVENT_QUEUE, &to_delete)
                .await?;
        }
        Ok(to_delete.len())
    }

    async fn route_one(&self, message: &ReceivedMessage) -> Result<RouteOutcome> {
        let envelope: FanoutEnvelope = match serde_json::from_str(&message.body) {
            Ok(e) => e,
            Err(e) => {
                return Ok(RouteOutcome::Malformed {
                    reason: format!("not a fanout envelope: {e}"),
                })
            }
        };
        let payload: EventWirePayload = match envelope.unwrap_payload() {
            Ok(p) => p,
            Err(e) => {
                return Ok(RouteOutcome::Malformed {
                    reason: format!("malformed event payload: {e}"),
                })
            }
        };

        let event_id = payload
            .event_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_type = match &payload.user_type {
            Some(t) => Some(t.clone()),
            None => self.preferences.user_type(&payload.user_id).await,
        };
        let priority = classify(&payload, user_type.as_deref());

        let now = Utc::now();
        let event = Event {
            event_id: event_id.clone(),
            status: EventStatus::Start,
            status_sms: None,
            status_email: None,
            status_push: None,
            user_id: payload.user_id.clone(),
            event_type: EventType::parse_lenient(&payload.event_type),
            retry_count_sms: payload.retry_count_sms,
            retry_count_email: payload.retry_count_email,
            retry_count_push: payload.retry_count_push,
            payload: EventAttributes {
                parent_id: payload.parent_id.clone(),
                parent_type: payload.parent_type.clone(),
                timestamp: payload.timestamp,
                priority: payload.priority.clone(),
            },
            created_at: now,
            updated_at: now,
        };

        let inserted = self.store.put_if_absent(&event).await?;
        if !inserted {
            // Redelivery of an event we've already recorded. §4.5 step 4:
            // dedup at the store, but still route — the original routing
            // attempt may have been interrupted before every channel queue
            // received its message, and per-channel enqueue is itself
            // idempotent at the worker (§4.7 PROCESSING-before-attempt).
            info!(event_id = %event_id, "redelivered event, re-routing without re-inserting");
        }

        let prefs = self.preferences.get(&payload.user_id).await;
        let suppressed = should_suppress(priority, &prefs);
        if suppressed {
            info!(event_id = %event_id, "suppressed by user preference, not enqueuing any channel");
            return Ok(RouteOutcome::Routed);
        }

        for channel in Channel::ALL {
            if !payload.notifications.enabled(channel) || !prefs.enabled(channel) {
                continue;
            }
            let queue = match priority {
                Priority::Critical => queues::channel_critical(channel),
                Priority::NonCritical => queues::channel_non_critical(channel),
            };
            let channel_message = ChannelMessage {
                event_id: event_id.clone(),
                channel,
                payload: payload.clone(),
            };
            let body = serde_json::to_string(&channel_message)
                .map_err(|e| crate::error::Error::permanent(format!("encoding channel message: {e}")))?;
            self.bus.send(&queue, &body).await?;
        }

        Ok(RouteOutcome::Routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::connections::InMemoryConnectionRegistry;
    use crate::models::NotificationSelection;
    use crate::preferences::InMemoryPreferencesStore;
    use crate::store::InMemoryEventStore;

    fn router() -> (IngressRouter, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        let prefs: SharedPreferencesStore = Arc::new(InMemoryPreferencesStore::new());
        let connections: SharedConnectionRegistry = Arc::new(InMemoryConnectionRegistry::new());
        let router = IngressRouter::new(bus.clone() as Arc<dyn MessageBus>, store, prefs, connections);
        (router, bus)
    }

    async fn seed(bus: &Arc<InMemoryBus>, payload: &EventWirePayload) {
        let envelope = FanoutEnvelope::wrap(payload).unwrap();
        let body = serde_json::to_string(&envelope).unwrap();
        bus.send(queues::EVENT_QUEUE, &body).await.unwrap();
    }

    fn payload(event_type: &str, channels: NotificationSelection) -> EventWirePayload {
        EventWirePayload {
            event_id: None,
            event_type: event_type.to_string(),
            user_id: "u1".to_string(),
            priority: None,
            parent_id: None,
            parent_type: None,
            timestamp: None,
            retry_count_sms: 0,
            retry_count_email: 0,
            retry_count_push: 0,
            notifications: channels,
            target_clients: Vec::new(),
            user_type: None,
        }
    }

    #[tokio::test]
    async fn routes_a_critical_event_to_the_critical_channel_queues() {
        let (router, bus) = router();
        let channels = NotificationSelection {
            sms: true,
            email: false,
            push: false,
        };
        seed(&bus, &payload("MENTION", channels)).await;

        let deleted = router.run_once(10, 0).await.unwrap();
        assert_eq!(deleted, 1);

        let sms_queue = queues::channel_critical(Channel::Sms);
        assert_eq!(bus.depth(&sms_queue).await, 1);
    }

    #[tokio::test]
    async fn routes_a_non_critical_event_to_the_non_critical_channel_queue() {
        let (router, bus) = router();
        let channels = NotificationSelection {
            sms: false,
            email: true,
            push: false,
        };
        seed(&bus, &payload("LIKE", channels)).await;
        router.run_once(10, 0).await.unwrap();

        let email_queue = queues::channel_non_critical(Channel::Email);
        assert_eq!(bus.depth(&email_queue).await, 1);
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_not_redelivered() {
        let (router, bus) = router();
        bus.send(queues::EVENT_QUEUE, "not json at all")
            .await
            .unwrap();

        let deleted = router.run_once(10, 0).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(bus.depth(queues::EVENT_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn disabled_channel_is_never_enqueued() {
        let (router, bus) = router();
        let channels = NotificationSelection {
            sms: false,
            email: false,
            push: false,
        };
        seed(&bus, &payload("LIKE", channels)).await;
        router.run_once(10, 0).await.unwrap();

        assert_eq!(bus.depth(&queues::channel_non_critical(Channel::Sms)).await, 0);
        assert_eq!(bus.depth(&queues::channel_non_critical(Channel::Email)).await, 0);
        assert_eq!(bus.depth(&queues::channel_non_critical(Channel::Push)).await, 0);
    }
}
