//! Tree: parses raw River records into Leaves on Wind.

use crate::data_plane::consumer::{AckDecision, ConsumerHandle, RecordHandler};
use crate::data_plane::river::River;
use crate::data_plane::stream::StreamRecord;
use crate::data_plane::wind::Wind;
use crate::leaf::Leaf;
use crate::runtime::artifact::ScriptArtifact;
use crate::runtime::worker::{run_with_deadline, DEFAULT_HANDLER_DEADLINE};
use crate::status::ForestError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

const TREE_TAG: &str = "Tree:";
const TREE_FN_ON_RECORD_TAG: &str = "on_record():";

struct TreeWorker {
    name: String,
    publishes: String,
    script: Arc<ScriptArtifact>,
    wind: Arc<Wind>,
}

impl TreeWorker {
    async fn handle(&self, record: &StreamRecord) -> AckDecision {
        // Parsers are expected to be robust: a script failure drops the
        // record rather than blocking the stream.
        let leaves = match self.script.parse(&record.subject, &record.payload) {
            Ok(leaves) => leaves,
            Err(err) => {
                warn!(
                    "{TREE_TAG}{TREE_FN_ON_RECORD_TAG} {:?} parse failed on slot {}: {err}",
                    self.name, record.slot
                );
                return AckDecision::Ack;
            }
        };

        for spec in leaves {
            let subject = spec.subject.unwrap_or_else(|| self.publishes.clone());
            let payload = match serde_json::to_vec(&spec.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        "{TREE_TAG}{TREE_FN_ON_RECORD_TAG} {:?} unserializable leaf: {err}",
                        self.name
                    );
                    continue;
                }
            };
            let leaf = Leaf::new(subject, payload, self.name.clone());
            if let Err(err) = self.wind.publish(leaf).await {
                // Bus trouble is transient: leave the record for redelivery.
                warn!(
                    "{TREE_TAG}{TREE_FN_ON_RECORD_TAG} {:?} publish failed: {err}",
                    self.name
                );
                return AckDecision::Nak;
            }
        }
        AckDecision::Ack
    }
}

#[async_trait]
impl RecordHandler for TreeWorker {
    async fn on_record(&self, record: Arc<StreamRecord>) -> AckDecision {
        match run_with_deadline(&self.name, DEFAULT_HANDLER_DEADLINE, self.handle(&record)).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!("{TREE_TAG}{TREE_FN_ON_RECORD_TAG} {err}");
                AckDecision::Nak
            }
        }
    }
}

/// A running Tree: a durable River consumer feeding parsed Leaves to Wind.
pub struct Tree {
    name: String,
    consumer: ConsumerHandle,
}

impl Tree {
    /// Starts the Tree: observes `watches` on the River under a durable
    /// consumer named after the Tree, parsing each record with `script`.
    pub async fn start(
        name: &str,
        watches: &str,
        publishes: &str,
        script: Arc<ScriptArtifact>,
        river: &River,
        wind: Arc<Wind>,
    ) -> Result<Self, ForestError> {
        let worker = Arc::new(TreeWorker {
            name: name.to_string(),
            publishes: publishes.to_string(),
            script,
            wind,
        });
        let consumer = river.observe(watches, name, worker).await?;
        debug!("{TREE_TAG} {name:?} observing {watches:?}");
        Ok(Self {
            name: name.to_string(),
            consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn stop(&self) {
        self.consumer.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::Tree;
    use crate::data_plane::river::River;
    use crate::data_plane::stream::StreamConfig;
    use crate::data_plane::wind::{LeafListener, Wind};
    use crate::leaf::Leaf;
    use crate::runtime::artifact::ScriptArtifact;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct CollectingListener {
        leaves: mpsc::UnboundedSender<Leaf>,
    }

    #[async_trait]
    impl LeafListener for CollectingListener {
        async fn on_leaf(&self, leaf: Arc<Leaf>) {
            let _ = self.leaves.send((*leaf).clone());
        }
    }

    fn short_ack_wait() -> StreamConfig {
        let mut config = StreamConfig::new("", "");
        config.ack_wait = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn tree_parses_river_records_onto_wind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), short_ack_wait()).await.unwrap();
        let wind = Arc::new(Wind::new(16));

        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("payment.completed", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        let script = Arc::new(
            ScriptArtifact::compile(
                r#"
                fn parse(subject, body) {
                    [#{ payload: #{ customer_id: body.data.object.customer } }]
                }
                "#,
            )
            .unwrap(),
        );
        let tree = Tree::start(
            "payment",
            "river.stripe.>",
            "payment.completed",
            script,
            &river,
            wind.clone(),
        )
        .await
        .unwrap();

        river
            .flow(
                "river.stripe.webhook",
                br#"{"data":{"object":{"customer":"cus_alice"}}}"#,
            )
            .await
            .unwrap();

        let leaf = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.subject, "payment.completed");
        assert_eq!(leaf.source, "payment");
        assert_eq!(leaf.payload_json().unwrap()["customer_id"], "cus_alice");
        tree.stop().await;
    }

    #[tokio::test]
    async fn parse_failures_do_not_block_the_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), short_ack_wait()).await.unwrap();
        let wind = Arc::new(Wind::new(16));

        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("out.ok", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        // Script raises on payloads without a `keep` field.
        let script = Arc::new(
            ScriptArtifact::compile(
                r#"
                fn parse(subject, body) {
                    [#{ payload: #{ kept: body.keep } }]
                }
                "#,
            )
            .unwrap(),
        );
        let tree = Tree::start("robust", "river.feed.>", "out.ok", script, &river, wind.clone())
            .await
            .unwrap();

        river.flow("river.feed.a", b"\"just a string\"").await.unwrap();
        river.flow("river.feed.a", br#"{"keep":"yes"}"#).await.unwrap();

        // The bad record is dropped; the good one still arrives.
        let leaf = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.payload_json().unwrap()["kept"], "yes");
        tree.stop().await;
    }
}
