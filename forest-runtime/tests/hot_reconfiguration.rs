//! Hot add/remove through the management API, redelivery behavior, and
//! script determinism under parallelism.

use async_trait::async_trait;
use forest_runtime::data_plane::{AckDecision, RecordHandler, StreamRecord};
use forest_runtime::runtime::ScriptArtifact;
use forest_runtime::{Forest, ForestOptions, Leaf};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn options(dir: &Path) -> ForestOptions {
    let mut options = ForestOptions::new(dir.join("bus"), dir.join("artifacts"));
    options.ack_wait = Duration::from_millis(100);
    options.conduct = false;
    options
}

struct CollectingListener {
    leaves: mpsc::UnboundedSender<Leaf>,
}

#[async_trait]
impl forest_runtime::data_plane::LeafListener for CollectingListener {
    async fn on_leaf(&self, leaf: Arc<Leaf>) {
        let _ = self.leaves.send((*leaf).clone());
    }
}

#[tokio::test]
async fn components_hot_add_and_remove_over_the_management_api() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("artifacts")).unwrap();
    std::fs::write(
        dir.path().join("artifacts").join("rescore.rhai"),
        "fn process(leaf) { [#{ payload: #{ score: leaf.payload.score + 1 } }] }",
    )
    .unwrap();

    let forest = Forest::start(options(dir.path())).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = forest.management_router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    forest
        .wind()
        .subscribe("scores.final", Arc::new(CollectingListener { leaves: tx }))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let created = client
        .post(format!("http://{addr}/api/v1/treehouses"))
        .json(&json!({
            "name": "rescore",
            "subscribes": "scores.raw",
            "publishes": "scores.final",
            "script": "rescore.rhai",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    forest
        .wind()
        .publish(Leaf::new("scores.raw", br#"{"score":41}"#.to_vec(), "test"))
        .await
        .unwrap();
    let leaf = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("output after hot add")
        .unwrap();
    assert_eq!(leaf.payload_json().unwrap()["score"], 42);

    let removed = client
        .delete(format!("http://{addr}/api/v1/treehouses/rescore"))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 204);

    forest
        .wind()
        .publish(Leaf::new("scores.raw", br#"{"score":1}"#.to_vec(), "test"))
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "no output after hot remove"
    );

    forest.shutdown().await;
}

struct NakOnceHandler {
    naks_left: AtomicUsize,
    deliveries: mpsc::UnboundedSender<u64>,
}

#[async_trait]
impl RecordHandler for NakOnceHandler {
    async fn on_record(&self, record: Arc<StreamRecord>) -> AckDecision {
        let _ = self.deliveries.send(record.slot);
        if self
            .naks_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            AckDecision::Nak
        } else {
            AckDecision::Ack
        }
    }
}

#[tokio::test]
async fn unacknowledged_river_records_redeliver_after_ack_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let forest = Forest::start(options(dir.path())).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = forest
        .river()
        .observe(
            "river.flaky.>",
            "flaky-tree",
            Arc::new(NakOnceHandler {
                naks_left: AtomicUsize::new(1),
                deliveries: tx,
            }),
        )
        .await
        .unwrap();

    forest.river().flow("river.flaky.feed", b"{}").await.unwrap();

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, 1, "first delivery");
    assert_eq!(second, 1, "same record redelivered after the ack-wait");

    consumer.stop().await;
    forest.shutdown().await;
}

#[tokio::test]
async fn treehouse_scripts_are_deterministic_across_parallel_workers() {
    let script = Arc::new(
        ScriptArtifact::compile(
            r#"
            fn process(leaf) {
                let total = 0;
                for item in leaf.payload.items {
                    total += item.weight * item.count;
                }
                [#{ payload: #{ total: total, grade: if total > 100 { "high" } else { "low" } } }]
            }
            "#,
        )
        .unwrap(),
    );

    let leaf = json!({
        "subject": "scoring.request",
        "payload": {
            "items": [
                {"weight": 3, "count": 14},
                {"weight": 7, "count": 9},
                {"weight": 1, "count": 2},
            ],
        },
        "source": "fixture",
        "timestamp": "2026-01-01T00:00:00Z",
    });
    let baseline = script.process(leaf.clone()).unwrap();

    let mut workers = Vec::new();
    for _ in 0..10 {
        let script = script.clone();
        let leaf = leaf.clone();
        let baseline = baseline.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..100 {
                let output = script.process(leaf.clone()).unwrap();
                assert_eq!(output, baseline, "byte-equal output lists, including order");
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
}
