/// Fanout Publisher (C4, §4.4): publishes freshly-ingested events onto the
/// pub/sub fanout topic in chunks, with bounded concurrency and a short
/// jittered retry per chunk. Grounded on the chunking/retry shape of
/// `libs/resilience/src/retry.rs` in the teacher, generalized from a single
/// future to a batch of publishes.
use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::models::{EventWirePayload, FanoutEnvelope};
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const CHUNK_SIZE: usize = 10;
const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 100;

/// Publishes `payloads` onto `topic`, `CHUNK_SIZE` at a time, all chunk
/// members published concurrently. A publish failing after `MAX_ATTEMPTS`
/// retries is logged and skipped — the spec draws no DLQ for ingress-publish
/// failures (§4.4), only for delivery-worker exhaustion (§4.7).
pub async fn publish_events(
    bus: &Arc<dyn MessageBus>,
    topic: &str,
    payloads: &[EventWirePayload],
) -> Result<usize> {
    let mut published = 0;
    for chunk in payloads.chunks(CHUNK_SIZE) {
        let results = join_all(
            chunk
                .iter()
                .map(|payload| publish_one_with_retry(bus, topic, payload)),
        )
        .await;
        for result in results {
            match result {
                Ok(()) => published += 1,
                Err(e) => error!(error = %e, "event publish failed after retries, dropping"),
            }
        }
    }
    Ok(published)
}

async fn publish_one_with_retry(
    bus: &Arc<dyn MessageBus>,
    topic: &str,
    payload: &EventWirePayload,
) -> Result<()> {
    let envelope = FanoutEnvelope::wrap(payload)
        .map_err(|e| Error::permanent(format!("encoding event payload: {e}")))?;
    let body = serde_json::to_string(&envelope)
        .map_err(|e| Error::permanent(format!("encoding fanout envelope: {e}")))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match bus.publish(topic, &body).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= MAX_ATTEMPTS || !e.is_retryable() => return Err(e),
            Err(e) => {
                let delay = jittered_backoff(attempt, BASE_DELAY_MS);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying event publish");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Exponential backoff with up to 50% jitter.
fn jittered_backoff(attempt: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2 + 1);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::models::NotificationSelection;

    fn payload(user_id: &str) -> EventWirePayload {
        EventWirePayload {
            event_id: None,
            event_type: "LIKE".to_string(),
            user_id: user_id.to_string(),
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

    #[tokio::test]
    async fn publishes_every_payload_wrapped_in_a_fanout_envelope() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let payloads = vec![payload("u1"), payload("u2")];
        let count = publish_events(&bus, "event_queue", &payloads).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(bus.receive("event_queue", 10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chunks_larger_than_ten_are_all_published() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let payloads: Vec<_> = (0..25).map(|i| payload(&format!("u{i}"))).collect();
        let count = publish_events(&bus, "event_queue", &payloads).await.unwrap();
        assert_eq!(count, 25);
    }

    #[tokio::test]
    async fn envelope_double_encodes_the_payload_as_a_json_string() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        publish_events(&bus, "event_queue", &[payload("u1")])
            .await
            .unwrap();
        let received = bus.receive("event_queue", 10, 0).await.unwrap();
        let envelope: FanoutEnvelope = serde_json::from_str(&received[0].body).unwrap();
        let inner: EventWirePayload = serde_json::from_str(&envelope.message).unwrap();
        assert_eq!(inner.user_id, "u1");
    }
}
