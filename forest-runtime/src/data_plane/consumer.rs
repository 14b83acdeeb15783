//! Named durable consumers over [`DurableStream`].
//!
//! Delivery is strictly in slot order within the consumer's filter; each
//! record must be acknowledged before the next is delivered. A nak (or a
//! handler that cannot complete) leaves the record pending and it is
//! redelivered after the stream's ack-wait. The acknowledged floor is
//! persisted so a restarted consumer resumes where it left off.

use crate::data_plane::stream::{DurableStream, StreamRecord};
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONSUMER_TAG: &str = "DurableConsumer:";
const CONSUMER_FN_RUN_TAG: &str = "run():";

/// Handler verdict for one delivered record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; advance the acknowledged floor.
    Ack,
    /// Not processed; redeliver after the ack-wait.
    Nak,
}

/// Stream-side contract: invoked once per delivered record, in slot order.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn on_record(&self, record: Arc<StreamRecord>) -> AckDecision;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsumerCursor {
    ack_floor: u64,
}

/// Handle owning a running consumer loop; `stop` cancels and drains it.
pub struct ConsumerHandle {
    name: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the loop and waits for the in-flight delivery to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("{CONSUMER_TAG}{CONSUMER_FN_RUN_TAG} consumer task failed: {err}");
            }
        }
    }
}

impl DurableStream {
    /// Opens (or resumes) the durable consumer `name` over `pattern`.
    pub async fn observe(
        self: &Arc<Self>,
        name: &str,
        pattern: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ConsumerHandle, ForestError> {
        self.spawn_consumer(name, pattern, handler, false).await
    }

    /// Opens the consumer `name` with the pin held: at most one holder is
    /// active at a time, later openers stand by until the pin frees.
    pub async fn observe_pinned(
        self: &Arc<Self>,
        name: &str,
        pattern: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ConsumerHandle, ForestError> {
        self.spawn_consumer(name, pattern, handler, true).await
    }

    async fn spawn_consumer(
        self: &Arc<Self>,
        name: &str,
        pattern: &str,
        handler: Arc<dyn RecordHandler>,
        pinned: bool,
    ) -> Result<ConsumerHandle, ForestError> {
        crate::routing::validate_pattern(pattern)?;
        let stream = self.clone();
        let consumer_name = name.to_string();
        let consumer_pattern = pattern.to_string();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            if pinned && !acquire_pin(&stream, &consumer_name, &loop_cancel).await {
                return;
            }
            run_consumer_loop(&stream, &consumer_name, &consumer_pattern, handler, &loop_cancel)
                .await;
            if pinned {
                stream.pins.lock().await.remove(&consumer_name);
                stream.pin_released.notify_waiters();
            }
        });

        Ok(ConsumerHandle {
            name: name.to_string(),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    async fn load_cursor(&self, name: &str) -> u64 {
        match tokio::fs::read_to_string(self.consumer_cursor_path(name)).await {
            Ok(raw) => serde_json::from_str::<ConsumerCursor>(&raw)
                .map(|cursor| cursor.ack_floor)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn store_cursor(&self, name: &str, ack_floor: u64) -> Result<(), ForestError> {
        let raw = serde_json::to_string(&ConsumerCursor { ack_floor })
            .map_err(|err| ForestError::fail_with_kind(ErrorKind::Internal, err.to_string()))?;
        tokio::fs::write(self.consumer_cursor_path(name), raw)
            .await
            .map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Bus, format!("cursor write failed: {err}"))
            })
    }
}

/// Waits until the pin for `name` is free, then takes it. Returns false if
/// cancelled while standing by.
async fn acquire_pin(stream: &Arc<DurableStream>, name: &str, cancel: &CancellationToken) -> bool {
    loop {
        {
            let mut pins = stream.pins.lock().await;
            if !pins.contains(name) {
                pins.insert(name.to_string());
                return true;
            }
        }
        debug!("{CONSUMER_TAG} {name:?} standing by for pin");
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = stream.pin_released.notified() => {}
        }
    }
}

async fn run_consumer_loop(
    stream: &Arc<DurableStream>,
    name: &str,
    pattern: &str,
    handler: Arc<dyn RecordHandler>,
    cancel: &CancellationToken,
) {
    let ack_wait = stream.config().ack_wait;
    let mut next = stream.load_cursor(name).await + 1;
    debug!("{CONSUMER_TAG}{CONSUMER_FN_RUN_TAG} {name:?} starting at slot {next}");

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let notified = stream.notify.notified();
        let Some(record) = stream.fetch_from(next, pattern).await else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
                _ = tokio::time::sleep(ack_wait) => {}
            }
            continue;
        };

        let slot = record.slot;
        match handler.on_record(record).await {
            AckDecision::Ack => {
                if let Err(err) = stream.store_cursor(name, slot).await {
                    warn!("{CONSUMER_TAG}{CONSUMER_FN_RUN_TAG} {name:?}: {err}");
                }
                next = slot + 1;
            }
            AckDecision::Nak => {
                debug!(
                    "{CONSUMER_TAG}{CONSUMER_FN_RUN_TAG} {name:?} nak on slot {slot}, redelivering after {ack_wait:?}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ack_wait) => {}
                }
            }
        }
    }
}
