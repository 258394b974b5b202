/// Delivery Worker (C7, §4.7) — the retry/backoff/DLQ state machine shared
/// by SMS, email, and push. Grounded on `original_source/send_sms_notif.py`'s
/// `process_message` (the `backoff_factor ** retry_count` formula, the
/// PROCESSING-before-every-attempt write, the DLQ write on exhaustion), with
/// the channel-specific send step modeled as a tagged variant per
/// `push_sender.rs`'s FCM/APNs split and §9's "channel dispatch via tagged
/// variants" redesign note.
use crate::bus::{queues, MessageBus};
use crate::connections::ConnectionManager;
use crate::models::{Channel, ChannelMessage, EventStatus};
use crate::store::SharedEventStore;
use crate::transports::{SendOutcome, Transport};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Retry/backoff constants named in §4.7. Kept as a struct rather than
/// bare module constants so tests can shrink them without sleeping for
/// real seconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub backoff_base_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 2,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, retry_count: i32) -> std::time::Duration {
        let exp = retry_count.max(0).min(20) as u32;
        std::time::Duration::from_secs(self.backoff_base_secs.saturating_pow(exp))
    }
}

pub struct DeliveryWorker {
    channel: Channel,
    bus: Arc<dyn MessageBus>,
    store: SharedEventStore,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(
        channel: Channel,
        bus: Arc<dyn MessageBus>,
        store: SharedEventStore,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        DeliveryWorker {
            channel,
            bus,
            store,
            transport,
            policy,
        }
    }

    /// Runs the full state machine for one channel message body (§4.7).
    /// Never returns an error — every transport/store failure is absorbed
    /// into a retry or a terminal FAILED/DLQ outcome; only a malformed
    /// message body is logged and dropped (§7, "permanent payload").
    pub async fn process(&self, body: &str) {
        let message: ChannelMessage = match serde_json::from_str(body) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel = self.channel.as_str(), error = %e, "dropping unparseable channel message");
                return;
            }
        };

        let event_id = message.event_id.clone();
        let mut retry_count = self.starting_retry_count(&message).await;

        loop {
            if let Err(e) = self
                .store
                .update_channel_status(&event_id, self.channel, EventStatus::Processing)
                .await
            {
                warn!(event_id = %event_id, error = %e, "failed to record PROCESSING, continuing anyway");
            }
            if let Err(e) = self.store.update_status(&event_id, EventStatus::Processing).await {
                warn!(event_id = %event_id, error = %e, "failed to record summary PROCESSING");
            }

            match self.transport.send(&message, &event_id).await {
                SendOutcome::Success => {
                    self.mark_terminal(&event_id, EventStatus::Success).await;
                    crate::metrics::record_delivery_outcome(self.channel.as_str(), "success");
                    info!(event_id = %event_id, channel = self.channel.as_str(), "delivery succeeded");
                    return;
                }
                SendOutcome::Permanent(reason) => {
                    // A permanent transport rejection still consumes the
                    // retry budget conceptually, but there is no point
                    // sleeping and re-attempting what cannot succeed —
                    // the spec's 4xx/permanent classification (§6) short-
                    // circuits straight to exhaustion.
                    warn!(event_id = %event_id, channel = self.channel.as_str(), reason, "permanent send failure, skipping remaining retries");
                    crate::metrics::record_delivery_outcome(self.channel.as_str(), "permanent_failure");
                    let final_retry_count = self.policy.max_retries;
                    if let Err(e) = self
                        .store
                        .update_retry(&event_id, self.channel, final_retry_count)
                        .await
                    {
                        warn!(event_id = %event_id, error = %e, "failed to persist retry counter");
                    }
                    self.exhaust(&message, &event_id, final_retry_count).await;
                    return;
                }
                SendOutcome::Transient(reason) => {
                    crate::metrics::record_delivery_outcome(self.channel.as_str(), "transient_failure");
                    retry_count += 1;
                    if let Err(e) = self
                        .store
                        .update_retry(&event_id, self.channel, retry_count)
                        .await
                    {
                        warn!(event_id = %event_id, error = %e, "failed to persist retry counter");
                    }

                    if retry_count < self.policy.max_retries {
                        let delay = self.policy.backoff(retry_count);
                        warn!(
                            event_id = %event_id,
                            channel = self.channel.as_str(),
                            retry_count,
                            delay_secs = delay.as_secs(),
                            reason,
                            "transient send failure, backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.exhaust(&message, &event_id, retry_count).await;
                    return;
                }
            }
        }
    }

    /// The starting retry count is authoritative on the Event record, not
    /// the message body — redelivery after a crash must resume from where
    /// the previous process left off (§4.7 notes).
    async fn starting_retry_count(&self, message: &ChannelMessage) -> i32 {
        match self.store.get(&message.event_id).await {
            Ok(Some(event)) => event.retry_count(self.channel),
            _ => message.payload.retry_count(self.channel),
        }
    }

    async fn mark_terminal(&self, event_id: &str, status: EventStatus) {
        if let Err(e) = self
            .store
            .update_channel_status(event_id, self.channel, status)
            .await
        {
            warn!(event_id, error = %e, "failed to persist terminal channel status");
        }
        if let Err(e) = self.store.update_status(event_id, status).await {
            warn!(event_id, error = %e, "failed to persist terminal summary status");
        }
    }

    /// Retry budget exhausted: write terminal FAILED, best-effort DLQ the
    /// original event payload JSON augmented with the terminal per-channel
    /// retry counter — no additional framing (§3, glossary "DLQ message").
    /// A consumer identifies the exhausted channel by which
    /// `retry_count_<channel>` field reads `MAX_RETRIES`. Always consider
    /// the channel message consumed regardless of DLQ-write outcome (§4.7
    /// notes: a DLQ-write failure must not cause infinite reprocessing).
    async fn exhaust(&self, message: &ChannelMessage, event_id: &str, final_retry_count: i32) {
        self.mark_terminal(event_id, EventStatus::Failed).await;

        let mut dlq_payload = message.payload.clone();
        dlq_payload.event_id = Some(event_id.to_string());
        match self.channel {
            Channel::Sms => dlq_payload.retry_count_sms = final_retry_count,
            Channel::Email => dlq_payload.retry_count_email = final_retry_count,
            Channel::Push => dlq_payload.retry_count_push = final_retry_count,
        }

        match serde_json::to_string(&dlq_payload) {
            Ok(body) => {
                if let Err(e) = self.bus.send(queues::DLQ, &body).await {
                    error!(event_id, channel = self.channel.as_str(), error = %e, "DLQ write failed, dropping anyway");
                }
                crate::metrics::record_dlq_write(self.channel.as_str());
            }
            Err(e) => error!(event_id, error = %e, "failed to encode DLQ message"),
        }
    }
}

trait PayloadRetry {
    fn retry_count(&self, channel: Channel) -> i32;
}

impl PayloadRetry for crate::models::EventWirePayload {
    fn retry_count(&self, channel: Channel) -> i32 {
        match channel {
            Channel::Sms => self.retry_count_sms,
            Channel::Email => self.retry_count_email,
            Channel::Push => self.retry_count_push,
        }
    }
}

/// Convenience constructor for the push channel, which additionally needs
/// the in-process `ConnectionManager` to relay to live web sockets (§4.7
/// push notes). Kept separate from `Transport::send` construction so
/// `main.rs` doesn't have to know push is special beyond this one call.
pub fn push_worker(
    bus: Arc<dyn MessageBus>,
    store: SharedEventStore,
    connections: crate::connections::SharedConnectionRegistry,
    manager: ConnectionManager,
    apns: Option<Arc<nova_apns_shared::ApnsPush>>,
    policy: RetryPolicy,
) -> DeliveryWorker {
    let transport = Arc::new(crate::transports::PushTransport::new(
        connections, manager, apns,
    ));
    DeliveryWorker::new(Channel::Push, bus, store, transport, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::models::{Event, EventAttributes, EventType, EventWirePayload, NotificationSelection};
    use crate::store::InMemoryEventStore;
    use crate::transports::FailNTimesTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire_payload() -> EventWirePayload {
        EventWirePayload {
            event_id: Some("e1".to_string()),
            event_type: "LIKE".to_string(),
            user_id: "u1".to_string(),
            priority: None,
            parent_id: None,
            parent_type: None,
            timestamp: None,
            retry_count_sms: 0,
            retry_count_email: 0,
            retry_count_push: 0,
            notifications: NotificationSelection::default(),
            target_clients: Vec::new(),
            user_type: None,
        }
    }

    fn event(id: &str) -> Event {
        let now = chrono::Utc::now();
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
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt_marks_success_no_dlq() {
        let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        store.put_if_absent(&event("e1")).await.unwrap();
        let transport = Arc::new(FailNTimesTransport::new(0));
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 0,
        };
        let worker = DeliveryWorker::new(Channel::Sms, bus.clone(), store.clone(), transport, policy);

        let message = ChannelMessage {
            event_id: "e1".to_string(),
            channel: Channel::Sms,
            payload: wire_payload(),
        };
        worker.process(&serde_json::to_string(&message).unwrap()).await;

        let e = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Success);
        assert_eq!(bus.depth(queues::DLQ).await, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_and_write_dlq() {
        let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        store.put_if_absent(&event("e1")).await.unwrap();
        let transport = Arc::new(FailNTimesTransport::new(999));
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 0,
        };
        let worker = DeliveryWorker::new(Channel::Email, bus.clone(), store.clone(), transport, policy);

        let message = ChannelMessage {
            event_id: "e1".to_string(),
            channel: Channel::Email,
            payload: wire_payload(),
        };
        worker.process(&serde_json::to_string(&message).unwrap()).await;

        let e = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Failed);
        assert_eq!(e.retry_count_email, 5);

        assert_eq!(bus.depth(queues::DLQ).await, 1);
        let dlq = bus.receive(queues::DLQ, 1, 0).await.unwrap();
        let dlq_payload: EventWirePayload = serde_json::from_str(&dlq[0].body).unwrap();
        assert_eq!(dlq_payload.retry_count_email, 5);
        assert_eq!(dlq_payload.event_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn recovers_after_a_few_transient_failures() {
        let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        store.put_if_absent(&event("e1")).await.unwrap();
        let transport = Arc::new(FailNTimesTransport::new(2));
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 0,
        };
        let worker = DeliveryWorker::new(Channel::Push, bus.clone(), store.clone(), transport.clone(), policy);

        let message = ChannelMessage {
            event_id: "e1".to_string(),
            channel: Channel::Push,
            payload: wire_payload(),
        };
        worker.process(&serde_json::to_string(&message).unwrap()).await;

        let e = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Success);
        assert_eq!(e.retry_count_push, 2);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn resumes_retry_budget_from_the_persisted_counter() {
        let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        let mut e = event("e1");
        e.retry_count_sms = 4;
        store.put_if_absent(&e).await.unwrap();

        let transport = Arc::new(FailNTimesTransport::new(999));
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 0,
        };
        let worker = DeliveryWorker::new(Channel::Sms, bus.clone(), store.clone(), transport.clone(), policy);

        let message = ChannelMessage {
            event_id: "e1".to_string(),
            channel: Channel::Sms,
            payload: wire_payload(),
        };
        worker.process(&serde_json::to_string(&message).unwrap()).await;

        // only one more attempt was needed to reach MAX_RETRIES=5
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        let e = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e.retry_count_sms, 5);
        assert_eq!(e.status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn permanent_failure_skips_remaining_retries() {
        let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
        let store: SharedEventStore = Arc::new(InMemoryEventStore::new());
        store.put_if_absent(&event("e1")).await.unwrap();

        struct AlwaysPermanent(AtomicUsize);
        #[async_trait::async_trait]
        impl Transport for AlwaysPermanent {
            async fn send(&self, _message: &ChannelMessage, _event_id: &str) -> SendOutcome {
                self.0.fetch_add(1, Ordering::SeqCst);
                SendOutcome::Permanent("400 bad request".to_string())
            }
        }
        let transport = Arc::new(AlwaysPermanent(AtomicUsize::new(0)));
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 0,
        };
        let worker = DeliveryWorker::new(Channel::Email, bus.clone(), store.clone(), transport.clone(), policy);

        let message = ChannelMessage {
            event_id: "e1".to_string(),
            channel: Channel::Email,
            payload: wire_payload(),
        };
        worker.process(&serde_json::to_string(&message).unwrap()).await;

        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        let e = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Failed);
        assert_eq!(bus.depth(queues::DLQ).await, 1);
    }
}
