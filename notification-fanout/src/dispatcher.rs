/// Priority Dispatcher (C6, §4.6): per-channel loop that drains the
/// critical queue with strict priority over the non-critical queue,
/// grounded on `original_source/send_sms_notif.py`'s
/// `listen_to_sqs_with_priority`.
///
/// Each iteration: long-poll the critical queue; if it returned anything,
/// hand the batch to the Delivery Worker and loop immediately without
/// touching the non-critical queue. Only when the critical queue is empty
/// does a non-critical poll happen. When both are empty, sleep briefly
/// before retrying — the spec's back-off against hammering an empty queue.
use crate::bus::{queues, MessageBus};
use crate::delivery::DeliveryWorker;
use crate::models::Channel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const BATCH_SIZE: i32 = 10;
const WAIT_SECONDS: i32 = 5;
const IDLE_SLEEP: Duration = Duration::from_secs(1);

pub struct PriorityDispatcher {
    bus: Arc<dyn MessageBus>,
    channel: Channel,
    worker: Arc<DeliveryWorker>,
}

impl PriorityDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, channel: Channel, worker: Arc<DeliveryWorker>) -> Self {
        PriorityDispatcher {
            bus,
            channel,
            worker,
        }
    }

    /// Runs until `shutdown` is signalled. `shutdown` carries `true` once
    /// a graceful stop has been requested (§10 graceful shutdown).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let critical_queue = queues::channel_critical(self.channel);
        let non_critical_queue = queues::channel_non_critical(self.channel);

        loop {
            if *shutdown.borrow() {
                info!(channel = self.channel.as_str(), "dispatcher shutting down");
                return;
            }

            let critical = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                result = self.bus.receive(&critical_queue, BATCH_SIZE, WAIT_SECONDS) => result,
            };
            match critical {
                Ok(messages) if !messages.is_empty() => {
                    debug!(channel = self.channel.as_str(), count = messages.len(), "processing critical batch");
                    crate::metrics::record_queue_received(&critical_queue, messages.len());
                    self.process_and_delete(&critical_queue, messages).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(channel = self.channel.as_str(), error = %e, "critical receive failed");
                }
            }

            if *shutdown.borrow() {
                continue;
            }

            let non_critical = self
                .bus
                .receive(&non_critical_queue, BATCH_SIZE, WAIT_SECONDS)
                .await;
            match non_critical {
                Ok(messages) if !messages.is_empty() => {
                    debug!(channel = self.channel.as_str(), count = messages.len(), "processing non-critical batch");
                    crate::metrics::record_queue_received(&non_critical_queue, messages.len());
                    self.process_and_delete(&non_critical_queue, messages).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(channel = self.channel.as_str(), error = %e, "non-critical receive failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Hands every message in the batch to the Delivery Worker concurrently
    /// and deletes the source message once its full retry/backoff/DLQ
    /// sequence has completed, win or lose — the worker never leaves a
    /// message's fate to be decided by queue redelivery (§4.7).
    async fn process_and_delete(
        &self,
        queue: &str,
        messages: Vec<crate::models::ReceivedMessage>,
    ) {
        let tasks: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let worker = self.worker.clone();
                tokio::spawn(async move {
                    worker.process(&message.body).await;
                    message.receipt_handle
                })
            })
            .collect();

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(error = %e, "delivery task panicked"),
            }
        }

        crate::metrics::record_queue_deleted(queue, handles.len());
        if let Err(e) = self.bus.delete_batch(queue, &handles).await {
            tracing::warn!(queue, error = %e, "failed to delete processed batch");
        }
    }
}
