//! Ceremony sources and the conductor.
//!
//! All periodic triggers hang off one heartbeat: the conductor publishes
//! `dance.beat` at a fixed tempo, and each ceremony counts beats and flows
//! its payload every `interval / beat_period` beats. Triggers are monotone
//! by beat count, not wall-clock, which removes drift between nodes;
//! missed beats are simply lost.

use crate::data_plane::river::River;
use crate::data_plane::wind::{LeafListener, SubscriptionHandle, Wind};
use crate::leaf::Leaf;
use crate::routing::BEAT_SUBJECT;
use crate::runtime::artifact::ScriptArtifact;
use crate::runtime::source::Source;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONDUCTOR_TAG: &str = "Conductor:";
const CEREMONY_TAG: &str = "CeremonySource:";
const CEREMONY_FN_ON_BEAT_TAG: &str = "on_beat():";

pub const DEFAULT_TEMPO_HZ: f64 = 10.0;

/// Publishes `dance.beat` at a fixed tempo. Exactly one node per forest
/// should conduct.
pub struct Conductor {
    wind: Arc<Wind>,
    tempo_hz: f64,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Conductor {
    pub fn new(wind: Arc<Wind>, tempo_hz: f64) -> Self {
        Self {
            wind,
            tempo_hz: if tempo_hz > 0.0 { tempo_hz } else { DEFAULT_TEMPO_HZ },
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let wind = self.wind.clone();
        let period = Duration::from_secs_f64(1.0 / self.tempo_hz);
        debug!("{CONDUCTOR_TAG} beating every {period:?}");
        let task = tokio::spawn(async move {
            let mut beat: u64 = 0;
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                beat += 1;
                let payload = serde_json::to_vec(&json!({"beat": beat})).unwrap_or_default();
                if let Err(err) = wind
                    .publish(Leaf::new(BEAT_SUBJECT, payload, "conductor"))
                    .await
                {
                    warn!("{CONDUCTOR_TAG} beat publish failed: {err}");
                }
            }
        });
        *task_slot = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// What a ceremony flows on trigger.
pub enum CeremonyPayload {
    /// A fixed JSON document.
    Static(serde_json::Value),
    /// `trigger(beat)` from a rhai script, invoked per trigger.
    Script(Arc<ScriptArtifact>),
}

struct CeremonyWorker {
    name: String,
    publishes: String,
    beats_per_trigger: u64,
    counted: AtomicU64,
    payload: CeremonyPayload,
    river: Arc<River>,
}

#[async_trait]
impl LeafListener for CeremonyWorker {
    async fn on_leaf(&self, _beat: Arc<Leaf>) {
        let counted = self.counted.fetch_add(1, Ordering::SeqCst) + 1;
        if counted % self.beats_per_trigger != 0 {
            return;
        }

        let payload = match &self.payload {
            CeremonyPayload::Static(value) => value.clone(),
            CeremonyPayload::Script(script) => match script.trigger(counted) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "{CEREMONY_TAG}{CEREMONY_FN_ON_BEAT_TAG} {:?}: {err}",
                        self.name
                    );
                    return;
                }
            },
        };
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        if let Err(err) = self.river.flow(&self.publishes, &bytes).await {
            warn!(
                "{CEREMONY_TAG}{CEREMONY_FN_ON_BEAT_TAG} {:?} flow failed: {err}",
                self.name
            );
        }
    }
}

/// A ceremony source: counts conductor beats, flows on every Nth.
pub struct CeremonySource {
    name: String,
    wind: Arc<Wind>,
    worker: Arc<CeremonyWorker>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    running: AtomicBool,
}

impl CeremonySource {
    /// `interval` is the wall-time intent; with the conductor at `tempo_hz`
    /// it is realized as a beat count of `interval * tempo`, floored at one.
    pub fn new(
        name: &str,
        interval: Duration,
        tempo_hz: f64,
        publishes: &str,
        payload: CeremonyPayload,
        river: Arc<River>,
        wind: Arc<Wind>,
    ) -> Self {
        let beats = (interval.as_secs_f64() * tempo_hz).round() as u64;
        Self {
            name: name.to_string(),
            wind,
            worker: Arc::new(CeremonyWorker {
                name: name.to_string(),
                publishes: publishes.to_string(),
                beats_per_trigger: beats.max(1),
                counted: AtomicU64::new(0),
                payload,
                river,
            }),
            subscription: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Source for CeremonySource {
    async fn start(&self) -> Result<(), ForestError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Internal,
                format!("ceremony {:?} already started", self.name),
            ));
        }
        *subscription = Some(self.wind.subscribe(BEAT_SUBJECT, self.worker.clone()).await?);
        self.running.store(true, Ordering::SeqCst);
        debug!(
            "{CEREMONY_TAG} {:?} triggering every {} beats",
            self.name, self.worker.beats_per_trigger
        );
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.subscription.lock().await.take() {
            self.wind.unsubscribe(handle).await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{CeremonyPayload, CeremonySource, Conductor};
    use crate::data_plane::river::River;
    use crate::data_plane::stream::StreamConfig;
    use crate::data_plane::wind::Wind;
    use crate::leaf::Leaf;
    use crate::routing::BEAT_SUBJECT;
    use crate::runtime::source::Source;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn ceremony_triggers_once_per_beat_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();
        let wind = Arc::new(Wind::new(64));

        // interval 1s at 10 Hz -> every 10 beats.
        let ceremony = CeremonySource::new(
            "daily",
            Duration::from_secs(1),
            10.0,
            "river.ticks.daily",
            CeremonyPayload::Static(json!({"tick": true})),
            river.clone(),
            wind.clone(),
        );
        ceremony.start().await.unwrap();
        assert!(ceremony.is_running());

        // Beats are counted, not timed: 30 beats must yield exactly 3 flows.
        for _ in 0..30 {
            wind.publish(Leaf::new(BEAT_SUBJECT, b"{}".to_vec(), "conductor"))
                .await
                .unwrap();
        }
        // Drain delivery by unsubscribing (stop drains in-flight handlers).
        ceremony.stop().await;
        assert!(!ceremony.is_running());
        assert_eq!(river.stream().last_slot().await, 3);
    }

    #[tokio::test]
    async fn sub_beat_intervals_floor_at_every_beat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();
        let wind = Arc::new(Wind::new(64));

        let ceremony = CeremonySource::new(
            "eager",
            Duration::from_millis(1),
            10.0,
            "river.ticks.eager",
            CeremonyPayload::Static(json!({})),
            river.clone(),
            wind.clone(),
        );
        ceremony.start().await.unwrap();
        for _ in 0..4 {
            wind.publish(Leaf::new(BEAT_SUBJECT, b"{}".to_vec(), "conductor"))
                .await
                .unwrap();
        }
        ceremony.stop().await;
        assert_eq!(river.stream().last_slot().await, 4);
    }

    #[tokio::test]
    async fn conductor_publishes_beats_until_stopped() {
        let wind = Arc::new(Wind::new(64));
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();

        let ceremony = CeremonySource::new(
            "pulse",
            Duration::from_millis(10),
            100.0,
            "river.ticks.pulse",
            CeremonyPayload::Static(json!({})),
            river.clone(),
            wind.clone(),
        );
        ceremony.start().await.unwrap();

        let conductor = Conductor::new(wind.clone(), 100.0);
        conductor.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        conductor.stop().await;
        ceremony.stop().await;

        assert!(river.stream().last_slot().await >= 1, "beats arrived");
    }
}
