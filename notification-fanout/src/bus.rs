/// Message Bus Abstraction (C1, §4.1).
///
/// Named durable FIFO queues with batched long-poll receive, batched
/// delete, and a single publish-to-fanout primitive. This is the only seam
/// through which the core talks to a broker; everything upstream of it
/// (ingress router, dispatchers, workers) is broker-agnostic.
use crate::error::{Error, Result};
use crate::models::ReceivedMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Logical queue names (§6). Fixed by the spec, not configurable per
/// instance — dispatchers and workers refer to channels, which map to
/// these through `Channel::queue_names`.
pub mod queues {
    pub const EVENT_QUEUE: &str = "event_queue";
    pub const DLQ: &str = "dlq";

    pub fn channel_critical(channel: crate::models::Channel) -> String {
        format!("{}_queue_critical", queue_root(channel))
    }

    pub fn channel_non_critical(channel: crate::models::Channel) -> String {
        format!("{}_queue_non_critical", queue_root(channel))
    }

    fn queue_root(channel: crate::models::Channel) -> &'static str {
        match channel {
            crate::models::Channel::Sms => "sms",
            crate::models::Channel::Email => "email",
            crate::models::Channel::Push => "push_notification",
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a single payload onto the ingress fanout topic. Used by
    /// the Fanout Publisher (C4); internally routed to `event_queue`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Long-polls up to `max_messages` from `queue`, waiting up to
    /// `wait_seconds` for at least one to arrive.
    async fn receive(
        &self,
        queue: &str,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Deletes a single message by receipt handle.
    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()>;

    /// Deletes a batch of messages in one call.
    async fn delete_batch(&self, queue: &str, receipt_handles: &[String]) -> Result<()>;

    /// Sends a single message body directly onto `queue` (used for
    /// channel fan-out and DLQ writes).
    async fn send(&self, queue: &str, body: &str) -> Result<()>;
}

/// In-memory bus: durable only for the process lifetime, FIFO per named
/// queue, with an artificial visibility timeout. Backs tests and local
/// runs of the whole pipeline without external infrastructure (§4.1).
#[derive(Default)]
pub struct InMemoryBus {
    queues: Mutex<std::collections::HashMap<String, VecDeque<InFlightMessage>>>,
    visibility_timeout: Duration,
}

struct InFlightMessage {
    id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_again_at: Option<std::time::Instant>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus {
            queues: Mutex::new(std::collections::HashMap::new()),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        InMemoryBus {
            queues: Mutex::new(std::collections::HashMap::new()),
            visibility_timeout,
        }
    }

    /// Test helper: number of messages currently visible-and-waiting in a
    /// queue (ignores in-flight/invisible ones).
    pub async fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.iter().filter(|m| !is_invisible(m)).count())
            .unwrap_or(0)
    }
}

fn is_invisible(msg: &InFlightMessage) -> bool {
    match msg.visible_again_at {
        Some(deadline) => std::time::Instant::now() < deadline,
        None => false,
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.send(topic, payload).await
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline =
            std::time::Instant::now() + Duration::from_secs(wait_seconds.max(0) as u64);
        loop {
            {
                let mut queues = self.queues.lock().await;
                let q = queues.entry(queue.to_string()).or_default();
                let mut taken = Vec::new();
                for msg in q.iter_mut() {
                    if taken.len() as i32 >= max_messages {
                        break;
                    }
                    if is_invisible(msg) {
                        continue;
                    }
                    let receipt_handle = Uuid::new_v4().to_string();
                    msg.receipt_handle = Some(receipt_handle.clone());
                    msg.visible_again_at =
                        Some(std::time::Instant::now() + self.visibility_timeout);
                    taken.push(ReceivedMessage {
                        id: msg.id.clone(),
                        receipt_handle,
                        body: msg.body.clone(),
                    });
                }
                if !taken.is_empty() {
                    return Ok(taken);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.get_mut(queue) {
            q.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        }
        Ok(())
    }

    async fn delete_batch(&self, queue: &str, receipt_handles: &[String]) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.get_mut(queue) {
            q.retain(|m| {
                m.receipt_handle
                    .as_ref()
                    .map(|h| !receipt_handles.contains(h))
                    .unwrap_or(true)
            });
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(InFlightMessage {
                id: Uuid::new_v4().to_string(),
                body: body.to_string(),
                receipt_handle: None,
                visible_again_at: None,
            });
        Ok(())
    }
}

/// Production bus backed by Amazon SQS (receive/delete/send) and SNS
/// (publish-to-fanout), matching the spec's SQS-shaped contract in §4.1
/// and the `original_source/sqs_listener.py` / `main.py` reference.
pub struct SqsMessageBus {
    sqs: Arc<aws_sdk_sqs::Client>,
    sns: Arc<aws_sdk_sns::Client>,
    queue_urls: Arc<Mutex<std::collections::HashMap<String, String>>>,
}

impl SqsMessageBus {
    pub fn new(sqs: aws_sdk_sqs::Client, sns: aws_sdk_sns::Client) -> Self {
        SqsMessageBus {
            sqs: Arc::new(sqs),
            sns: Arc::new(sns),
            queue_urls: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    async fn resolve_queue_url(&self, queue: &str) -> Result<String> {
        {
            let cache = self.queue_urls.lock().await;
            if let Some(url) = cache.get(queue) {
                return Ok(url.clone());
            }
        }
        let resp = self
            .sqs
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| Error::transient(format!("get_queue_url({queue}): {e}")))?;
        let url = resp
            .queue_url
            .ok_or_else(|| Error::transient(format!("queue {queue} has no url")))?;
        self.queue_urls
            .lock()
            .await
            .insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl MessageBus for SqsMessageBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.sns
            .publish()
            .topic_arn(topic)
            .message(payload)
            .subject("Event")
            .send()
            .await
            .map_err(|e| Error::transient(format!("sns publish to {topic}: {e}")))?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let url = self.resolve_queue_url(queue).await?;
        let resp = self
            .sqs
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|e| Error::transient(format!("sqs receive from {queue}: {e}")))?;

        let messages = resp
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let id = m.message_id?;
                let receipt_handle = m.receipt_handle?;
                let body = m.body.unwrap_or_default();
                Some(ReceivedMessage {
                    id,
                    receipt_handle,
                    body,
                })
            })
            .collect();
        debug!(queue, "received batch from sqs");
        Ok(messages)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let url = self.resolve_queue_url(queue).await?;
        self.sqs
            .delete_message()
            .queue_url(&url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| Error::transient(format!("sqs delete from {queue}: {e}")))?;
        Ok(())
    }

    async fn delete_batch(&self, queue: &str, receipt_handles: &[String]) -> Result<()> {
        if receipt_handles.is_empty() {
            return Ok(());
        }
        let url = self.resolve_queue_url(queue).await?;
        let entries: Vec<_> = receipt_handles
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                aws_sdk_sqs::types::DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(handle)
                    .build()
                    .expect("id and receipt_handle are always set")
            })
            .collect();
        let resp = self
            .sqs
            .delete_message_batch()
            .queue_url(&url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| Error::transient(format!("sqs delete_message_batch on {queue}: {e}")))?;
        for failure in resp.failed {
            warn!(queue, id = %failure.id, message = %failure.message.unwrap_or_default(), "batch delete entry failed");
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: &str) -> Result<()> {
        let url = self.resolve_queue_url(queue).await?;
        self.sqs
            .send_message()
            .queue_url(&url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| Error::transient(format!("sqs send to {queue}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_receive_round_trips_body() {
        let bus = InMemoryBus::new();
        bus.send("q1", "hello").await.unwrap();
        let msgs = bus.receive("q1", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "hello");
    }

    #[tokio::test]
    async fn received_message_is_invisible_until_deleted_or_timeout() {
        let bus = InMemoryBus::with_visibility_timeout(Duration::from_millis(50));
        bus.send("q1", "hello").await.unwrap();
        let first = bus.receive("q1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        // still invisible immediately after receive
        let empty = bus.receive("q1", 10, 0).await.unwrap();
        assert!(empty.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = bus.receive("q1", 10, 0).await.unwrap();
        assert_eq!(redelivered.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_message_permanently() {
        let bus = InMemoryBus::new();
        bus.send("q1", "hello").await.unwrap();
        let msgs = bus.receive("q1", 10, 0).await.unwrap();
        bus.delete("q1", &msgs[0].receipt_handle).await.unwrap();
        assert_eq!(bus.depth("q1").await, 0);
    }

    #[tokio::test]
    async fn delete_batch_removes_multiple() {
        let bus = InMemoryBus::new();
        for i in 0..5 {
            bus.send("q1", &format!("msg-{i}")).await.unwrap();
        }
        let msgs = bus.receive("q1", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 5);
        let handles: Vec<String> = msgs.iter().map(|m| m.receipt_handle.clone()).collect();
        bus.delete_batch("q1", &handles).await.unwrap();
        assert_eq!(bus.depth("q1").await, 0);
    }

    #[tokio::test]
    async fn receive_waits_up_to_wait_seconds_for_a_message() {
        let bus = Arc::new(InMemoryBus::new());
        let bus2 = bus.clone();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            bus2.send("q1", "late").await.unwrap();
        });
        let msgs = bus.receive("q1", 10, 1).await.unwrap();
        producer.await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "late");
    }

    #[tokio::test]
    async fn publish_is_receivable_on_the_same_topic_as_a_queue() {
        let bus = InMemoryBus::new();
        bus.publish("event_queue", "payload").await.unwrap();
        let msgs = bus.receive("event_queue", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }
}
