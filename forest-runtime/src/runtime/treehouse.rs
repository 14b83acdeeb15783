//! TreeHouse: the deterministic Leaf transformer.
//!
//! `process` must be a pure function of the Leaf: same input, same output,
//! byte for byte. No I/O, no clock, no randomness; time and randomness, if
//! needed, arrive as Leaf fields. Replicas share load through the
//! `treehouse.<name>` queue group.

use crate::data_plane::wind::{LeafListener, SubscriptionHandle, Wind};
use crate::leaf::Leaf;
use crate::runtime::artifact::ScriptArtifact;
use crate::runtime::worker::{run_with_deadline, DEFAULT_HANDLER_DEADLINE};
use crate::status::ForestError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

const TREEHOUSE_TAG: &str = "TreeHouse:";
const TREEHOUSE_FN_ON_LEAF_TAG: &str = "on_leaf():";

struct TreeHouseWorker {
    name: String,
    publishes: String,
    script: Arc<ScriptArtifact>,
    wind: Arc<Wind>,
}

impl TreeHouseWorker {
    fn leaf_value(leaf: &Leaf) -> serde_json::Value {
        let payload = leaf
            .payload_json()
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&leaf.payload).to_string()));
        json!({
            "subject": leaf.subject,
            "payload": payload,
            "source": leaf.source,
            "timestamp": leaf.timestamp.to_rfc3339(),
        })
    }

    async fn handle(&self, leaf: &Leaf) {
        let outputs = match self.script.process(Self::leaf_value(leaf)) {
            Ok(outputs) => outputs,
            Err(err) => {
                // Wind is at-most-once anyway: log and drop.
                warn!(
                    "{TREEHOUSE_TAG}{TREEHOUSE_FN_ON_LEAF_TAG} {:?} on {:?}: {err}",
                    self.name, leaf.subject
                );
                return;
            }
        };
        for spec in outputs {
            let subject = spec.subject.unwrap_or_else(|| self.publishes.clone());
            let payload = match serde_json::to_vec(&spec.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        "{TREEHOUSE_TAG}{TREEHOUSE_FN_ON_LEAF_TAG} {:?} unserializable output: {err}",
                        self.name
                    );
                    continue;
                }
            };
            if let Err(err) = self
                .wind
                .publish(Leaf::new(subject, payload, self.name.clone()))
                .await
            {
                warn!(
                    "{TREEHOUSE_TAG}{TREEHOUSE_FN_ON_LEAF_TAG} {:?} publish failed: {err}",
                    self.name
                );
            }
        }
    }
}

#[async_trait]
impl LeafListener for TreeHouseWorker {
    async fn on_leaf(&self, leaf: Arc<Leaf>) {
        if let Err(err) =
            run_with_deadline(&self.name, DEFAULT_HANDLER_DEADLINE, self.handle(&leaf)).await
        {
            warn!("{TREEHOUSE_TAG}{TREEHOUSE_FN_ON_LEAF_TAG} {err}");
        }
    }
}

/// A running TreeHouse subscription.
pub struct TreeHouse {
    name: String,
    wind: Arc<Wind>,
    subscription: SubscriptionHandle,
}

impl TreeHouse {
    pub async fn start(
        name: &str,
        subscribes: &str,
        publishes: &str,
        script: Arc<ScriptArtifact>,
        wind: Arc<Wind>,
    ) -> Result<Self, ForestError> {
        let worker = Arc::new(TreeHouseWorker {
            name: name.to_string(),
            publishes: publishes.to_string(),
            script,
            wind: wind.clone(),
        });
        let subscription = wind
            .subscribe_queue(subscribes, &format!("treehouse.{name}"), worker)
            .await?;
        debug!("{TREEHOUSE_TAG} {name:?} subscribed to {subscribes:?}");
        Ok(Self {
            name: name.to_string(),
            wind,
            subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn stop(&self) {
        self.wind.unsubscribe(self.subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::TreeHouse;
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

    #[tokio::test]
    async fn treehouse_transforms_and_republishes() {
        let wind = Arc::new(Wind::new(16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("scores.out", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        let script = Arc::new(
            ScriptArtifact::compile(
                r#"
                fn process(leaf) {
                    [#{ payload: #{ doubled: leaf.payload.n * 2 } }]
                }
                "#,
            )
            .unwrap(),
        );
        let treehouse = TreeHouse::start("scoring", "scores.in", "scores.out", script, wind.clone())
            .await
            .unwrap();

        wind.publish(Leaf::new("scores.in", br#"{"n":21}"#.to_vec(), "test"))
            .await
            .unwrap();

        let leaf = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.source, "scoring");
        assert_eq!(leaf.payload_json().unwrap()["doubled"], 42);
        treehouse.stop().await;
    }

    #[tokio::test]
    async fn stopped_treehouse_receives_nothing_further() {
        let wind = Arc::new(Wind::new(16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("echo.out", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        let script = Arc::new(
            ScriptArtifact::compile(
                r#"
                fn process(leaf) {
                    [#{ payload: leaf.payload }]
                }
                "#,
            )
            .unwrap(),
        );
        let treehouse = TreeHouse::start("echo", "echo.in", "echo.out", script, wind.clone())
            .await
            .unwrap();

        wind.publish(Leaf::new("echo.in", br#"{"x":1}"#.to_vec(), "test"))
            .await
            .unwrap();
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_ok());

        treehouse.stop().await;
        wind.publish(Leaf::new("echo.in", br#"{"x":2}"#.to_vec(), "test"))
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "no delivery after stop"
        );
    }
}
