//! Decomposer: the single-writer reconciliation worker that applies the
//! Humus change-log to Soil.
//!
//! Exactly one Decomposer is active per forest: the pinned Humus consumer
//! enforces that when several nodes boot. Every action maps to a
//! compare-and-set operation, so a redelivered entry either succeeds (first
//! delivery) or conflicts (replay after an earlier success); both outcomes
//! leave the same post-state.

use crate::data_plane::consumer::{AckDecision, ConsumerHandle, RecordHandler};
use crate::data_plane::humus::{Compost, CompostAction, Humus};
use crate::data_plane::soil::Soil;
use crate::data_plane::stream::StreamRecord;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

const DECOMPOSER_TAG: &str = "Decomposer:";
const DECOMPOSER_FN_APPLY_TAG: &str = "apply():";

/// Bounded conflict retries for `update` before the record is left for
/// redelivery.
const MAX_UPDATE_RETRIES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecomposerState {
    Idle,
    Consuming,
    Stopping,
}

struct DecomposerWorker {
    soil: Arc<Soil>,
}

impl DecomposerWorker {
    async fn apply(&self, compost: &Compost) -> AckDecision {
        match compost.action {
            CompostAction::Create => {
                match self.soil.put(&compost.entity, &compost.payload, 0).await {
                    Ok(revision) => {
                        debug!(
                            "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} created {:?} at revision {revision}",
                            compost.entity
                        );
                        AckDecision::Ack
                    }
                    Err(err) if err.kind() == ErrorKind::RevisionConflict => {
                        // Idempotent replay: the entity was already created.
                        warn!(
                            "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} create conflict on {:?}: {err}",
                            compost.entity
                        );
                        AckDecision::Ack
                    }
                    Err(err) => {
                        warn!(
                            "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} create failed on {:?}: {err}",
                            compost.entity
                        );
                        AckDecision::Nak
                    }
                }
            }
            CompostAction::Update => self.apply_update(compost).await,
            CompostAction::Delete => match self.soil.delete(&compost.entity).await {
                Ok(()) => AckDecision::Ack,
                Err(err) => {
                    warn!(
                        "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} delete failed on {:?}: {err}",
                        compost.entity
                    );
                    AckDecision::Nak
                }
            },
        }
    }

    async fn apply_update(&self, compost: &Compost) -> AckDecision {
        for _ in 0..MAX_UPDATE_RETRIES {
            // An update for an absent key is applied as a create so that a
            // replay after a crash between soil-write and ack converges.
            let expected = match self.soil.get(&compost.entity).await {
                Ok(entry) => entry.revision as i64,
                Err(err) if err.kind() == ErrorKind::NotFound => 0,
                Err(err) => {
                    warn!(
                        "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} read failed on {:?}: {err}",
                        compost.entity
                    );
                    return AckDecision::Nak;
                }
            };
            match self
                .soil
                .put(&compost.entity, &compost.payload, expected)
                .await
            {
                Ok(_) => return AckDecision::Ack,
                Err(err) if err.kind() == ErrorKind::RevisionConflict => continue,
                Err(err) => {
                    warn!(
                        "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} update failed on {:?}: {err}",
                        compost.entity
                    );
                    return AckDecision::Nak;
                }
            }
        }
        warn!(
            "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} update on {:?} exhausted {MAX_UPDATE_RETRIES} retries",
            compost.entity
        );
        AckDecision::Nak
    }
}

#[async_trait]
impl RecordHandler for DecomposerWorker {
    async fn on_record(&self, record: Arc<StreamRecord>) -> AckDecision {
        let compost = match serde_json::from_slice::<Compost>(&record.payload) {
            Ok(mut compost) => {
                compost.slot = record.slot;
                compost
            }
            Err(err) => {
                // Malformed payloads are permanent; ack to avoid head-of-line
                // blocking.
                warn!(
                    "{DECOMPOSER_TAG}{DECOMPOSER_FN_APPLY_TAG} malformed compost at slot {}: {err}",
                    record.slot
                );
                return AckDecision::Ack;
            }
        };
        self.apply(&compost).await
    }
}

/// The reconciliation worker. `start` opens the pinned Humus consumer;
/// `stop` drains and releases the pin so a standby instance can take over.
pub struct Decomposer {
    humus: Arc<Humus>,
    soil: Arc<Soil>,
    state: watch::Sender<DecomposerState>,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl Decomposer {
    pub fn new(humus: Arc<Humus>, soil: Arc<Soil>) -> Self {
        let (state, _) = watch::channel(DecomposerState::Idle);
        Self {
            humus,
            soil,
            state,
            consumer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DecomposerState {
        *self.state.borrow()
    }

    pub async fn start(&self) -> Result<(), ForestError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }
        let worker = Arc::new(DecomposerWorker {
            soil: self.soil.clone(),
        });
        *consumer = Some(self.humus.decompose(worker).await?);
        let _ = self.state.send(DecomposerState::Consuming);
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.state.send(DecomposerState::Stopping);
            handle.stop().await;
        }
        let _ = self.state.send(DecomposerState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::{Decomposer, DecomposerState, DecomposerWorker};
    use crate::data_plane::consumer::{AckDecision, RecordHandler};
    use crate::data_plane::humus::{Compost, CompostAction, Humus};
    use crate::data_plane::soil::Soil;
    use crate::data_plane::stream::{StreamConfig, StreamRecord};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn compost_record(slot: u64, entity: &str, action: CompostAction, payload: &[u8]) -> Arc<StreamRecord> {
        let compost = Compost {
            entity: entity.to_string(),
            action,
            payload: payload.to_vec(),
            producer: "test".to_string(),
            timestamp: Utc::now(),
            slot,
        };
        Arc::new(StreamRecord {
            slot,
            subject: format!("humus.{}", entity.replace('/', ".")),
            payload: serde_json::to_vec(&compost).unwrap(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn replaying_a_create_twice_leaves_one_revision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let soil = Soil::open(dir.path()).await.unwrap();
        let worker = DecomposerWorker { soil: soil.clone() };

        let record = compost_record(1, "tasks/one", CompostAction::Create, b"{\"a\":1}");
        assert_eq!(worker.on_record(record.clone()).await, AckDecision::Ack);
        assert_eq!(worker.on_record(record).await, AckDecision::Ack);

        let entry = soil.get("tasks/one").await.unwrap();
        assert_eq!(entry.revision, 1);
    }

    #[tokio::test]
    async fn updates_apply_in_order_without_lost_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let soil = Soil::open(dir.path()).await.unwrap();
        let worker = DecomposerWorker { soil: soil.clone() };

        worker
            .on_record(compost_record(1, "counter", CompostAction::Create, b"0"))
            .await;
        worker
            .on_record(compost_record(2, "counter", CompostAction::Update, b"1"))
            .await;
        worker
            .on_record(compost_record(3, "counter", CompostAction::Update, b"2"))
            .await;

        let entry = soil.get("counter").await.unwrap();
        assert_eq!(entry.revision, 3);
        assert_eq!(entry.bytes, b"2");
    }

    #[tokio::test]
    async fn update_for_an_absent_key_creates_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let soil = Soil::open(dir.path()).await.unwrap();
        let worker = DecomposerWorker { soil: soil.clone() };

        let decision = worker
            .on_record(compost_record(1, "tasks/late", CompostAction::Update, b"x"))
            .await;
        assert_eq!(decision, AckDecision::Ack);
        assert_eq!(soil.get("tasks/late").await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn malformed_compost_is_acked_and_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let soil = Soil::open(dir.path()).await.unwrap();
        let worker = DecomposerWorker { soil };

        let record = Arc::new(StreamRecord {
            slot: 9,
            subject: "humus.broken".to_string(),
            payload: b"not json".to_vec(),
            timestamp: Utc::now(),
        });
        assert_eq!(worker.on_record(record).await, AckDecision::Ack);
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_state_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = StreamConfig::new("", "");
        config.ack_wait = Duration::from_millis(50);
        let humus = Humus::open(dir.path(), config).await.unwrap();
        let soil = Soil::open(dir.path().join("soil")).await.unwrap();

        let decomposer = Decomposer::new(humus.clone(), soil.clone());
        assert_eq!(decomposer.state(), DecomposerState::Idle);

        decomposer.start().await.unwrap();
        assert_eq!(decomposer.state(), DecomposerState::Consuming);

        humus
            .add("test", "tasks/flow", CompostAction::Create, b"{}")
            .await
            .unwrap();
        // Applied within bounded time.
        let mut applied = false;
        for _ in 0..40 {
            if soil.get("tasks/flow").await.is_ok() {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(applied, "compost applied to soil");

        decomposer.stop().await;
        assert_eq!(decomposer.state(), DecomposerState::Idle);
    }
}
