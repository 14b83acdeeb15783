//! Wind: the ephemeral, subject-addressed pub/sub bus.

use crate::leaf::Leaf;
use crate::routing::{subject_matches, validate_pattern, validate_subject};
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const WIND_TAG: &str = "Wind:";
const WIND_FN_PUBLISH_TAG: &str = "publish():";
const WIND_FN_UNSUBSCRIBE_TAG: &str = "unsubscribe():";

/// Subscriber-side contract: invoked once per delivered Leaf, sequentially
/// within one subscription.
#[async_trait]
pub trait LeafListener: Send + Sync {
    async fn on_leaf(&self, leaf: Arc<Leaf>);
}

/// Opaque handle identifying one live subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct WindSubscription {
    id: u64,
    pattern: String,
    group: Option<String>,
    sender: mpsc::Sender<Arc<Leaf>>,
    delivery: JoinHandle<()>,
}

/// Ephemeral pub/sub bus.
///
/// At-most-once: no persistence, no replay, no backpressure on the
/// publisher. Each subscription owns a bounded queue and one delivery task,
/// which gives per-subscription FIFO while different subscriptions run in
/// parallel. A full queue drops the message for that subscriber.
pub struct Wind {
    queue_size: usize,
    subscriptions: Mutex<HashMap<u64, WindSubscription>>,
    next_subscription_id: AtomicU64,
    group_cursors: Mutex<HashMap<String, usize>>,
    relays: Mutex<Vec<mpsc::Sender<Arc<Leaf>>>>,
    closed: AtomicBool,
}

impl Wind {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            group_cursors: Mutex::new(HashMap::new()),
            relays: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes a Leaf to every current matching subscriber and forwards it
    /// once to each connected peer relay. Returns after handoff.
    pub async fn publish(&self, leaf: Leaf) -> Result<(), ForestError> {
        let leaf = Arc::new(leaf);
        self.deliver_local(leaf.clone()).await?;

        let relays = self.relays.lock().await;
        for relay in relays.iter() {
            if relay.try_send(leaf.clone()).is_err() {
                warn!(
                    "{WIND_TAG}{WIND_FN_PUBLISH_TAG} peer relay queue full, dropping {:?}",
                    leaf.subject
                );
            }
        }
        Ok(())
    }

    /// Delivers a Leaf received from a peer node. Not re-forwarded, so a
    /// two-node mesh cannot loop traffic.
    pub(crate) async fn publish_remote(&self, leaf: Leaf) -> Result<(), ForestError> {
        self.deliver_local(Arc::new(leaf)).await
    }

    async fn deliver_local(&self, leaf: Arc<Leaf>) -> Result<(), ForestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                "wind is shut down",
            ));
        }
        validate_subject(&leaf.subject)?;

        let subscriptions = self.subscriptions.lock().await;

        // Plain subscriptions each get a copy; queue groups get one copy per
        // group, member picked round-robin.
        let mut group_members: HashMap<&str, Vec<&WindSubscription>> = HashMap::new();
        for subscription in subscriptions.values() {
            if !subject_matches(&subscription.pattern, &leaf.subject) {
                continue;
            }
            match &subscription.group {
                None => Self::handoff(subscription, leaf.clone(), &leaf.subject),
                Some(group) => group_members.entry(group).or_default().push(subscription),
            }
        }

        if !group_members.is_empty() {
            let mut cursors = self.group_cursors.lock().await;
            for (group, mut members) in group_members {
                // Stable member order so the round-robin cursor is meaningful.
                members.sort_by_key(|member| member.id);
                let cursor = cursors.entry(group.to_string()).or_insert(0);
                let picked = &members[*cursor % members.len()];
                *cursor = cursor.wrapping_add(1);
                Self::handoff(picked, leaf.clone(), &leaf.subject);
            }
        }
        Ok(())
    }

    fn handoff(subscription: &WindSubscription, leaf: Arc<Leaf>, subject: &str) {
        if let Err(mpsc::error::TrySendError::Full(_)) = subscription.sender.try_send(leaf) {
            warn!(
                "{WIND_TAG}{WIND_FN_PUBLISH_TAG} slow subscriber on {:?}, dropping {subject:?}",
                subscription.pattern
            );
        }
    }

    /// Subscribes a listener to every Leaf matching `pattern`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<SubscriptionHandle, ForestError> {
        self.subscribe_inner(pattern, None, listener).await
    }

    /// Subscribes into a queue group: each matching Leaf is delivered to one
    /// member of `group`, distributing load across subscribers.
    pub async fn subscribe_queue(
        &self,
        pattern: &str,
        group: &str,
        listener: Arc<dyn LeafListener>,
    ) -> Result<SubscriptionHandle, ForestError> {
        self.subscribe_inner(pattern, Some(group.to_string()), listener)
            .await
    }

    async fn subscribe_inner(
        &self,
        pattern: &str,
        group: Option<String>,
        listener: Arc<dyn LeafListener>,
    ) -> Result<SubscriptionHandle, ForestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                "wind is shut down",
            ));
        }
        validate_pattern(pattern)?;

        let (sender, mut receiver) = mpsc::channel::<Arc<Leaf>>(self.queue_size);
        let delivery = tokio::spawn(async move {
            while let Some(leaf) = receiver.recv().await {
                listener.on_leaf(leaf).await;
            }
        });

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().await.insert(
            id,
            WindSubscription {
                id,
                pattern: pattern.to_string(),
                group,
                sender,
                delivery,
            },
        );
        debug!("{WIND_TAG} subscribed {pattern:?} as {id}");
        Ok(SubscriptionHandle(id))
    }

    /// Removes a subscription, draining in-flight handler invocations before
    /// returning. Leaves published after this returns are never delivered to
    /// the removed listener.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let removed = self.subscriptions.lock().await.remove(&handle.0);
        let Some(subscription) = removed else {
            warn!("{WIND_TAG}{WIND_FN_UNSUBSCRIBE_TAG} no such subscription: {handle:?}");
            return;
        };
        drop(subscription.sender);
        if let Err(err) = subscription.delivery.await {
            warn!("{WIND_TAG}{WIND_FN_UNSUBSCRIBE_TAG} delivery task failed: {err}");
        }
    }

    /// Registers a peer relay; every locally published Leaf is handed off to
    /// it once. Used by cluster peer links.
    pub(crate) async fn register_relay(&self, relay: mpsc::Sender<Arc<Leaf>>) {
        self.relays.lock().await.push(relay);
    }

    /// Drains and removes every subscription, then refuses further traffic.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<WindSubscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, sub)| sub).collect()
        };
        let tasks: Vec<_> = drained
            .into_iter()
            .map(|subscription| {
                drop(subscription.sender);
                subscription.delivery
            })
            .collect();
        futures::future::join_all(tasks).await;
        self.relays.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{LeafListener, Wind};
    use crate::leaf::Leaf;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::timeout;

    struct RecordingListener {
        name: &'static str,
        delivered: mpsc::UnboundedSender<(&'static str, String)>,
    }

    #[async_trait]
    impl LeafListener for RecordingListener {
        async fn on_leaf(&self, leaf: Arc<Leaf>) {
            let payload = String::from_utf8_lossy(&leaf.payload).to_string();
            let _ = self.delivered.send((self.name, payload));
        }
    }

    fn recording(
        name: &'static str,
    ) -> (
        Arc<RecordingListener>,
        mpsc::UnboundedReceiver<(&'static str, String)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(RecordingListener {
                name,
                delivered: tx,
            }),
            rx,
        )
    }

    async fn next(
        rx: &mut mpsc::UnboundedReceiver<(&'static str, String)>,
    ) -> (&'static str, String) {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let wind = Wind::new(16);
        let (match_listener, mut matched) = recording("match");
        let (miss_listener, mut missed) = recording("miss");

        wind.subscribe("payment.>", match_listener).await.unwrap();
        wind.subscribe("ticket.>", miss_listener).await.unwrap();

        wind.publish(Leaf::new("payment.completed", b"one".to_vec(), "test"))
            .await
            .unwrap();

        assert_eq!(next(&mut matched).await.1, "one");
        assert!(missed.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_order_is_fifo_per_subscription() {
        let wind = Wind::new(64);
        let (listener, mut rx) = recording("fifo");
        wind.subscribe("orders.*", listener).await.unwrap();

        for index in 0..10 {
            wind.publish(Leaf::new(
                "orders.created",
                format!("{index}").into_bytes(),
                "test",
            ))
            .await
            .unwrap();
        }

        for index in 0..10 {
            assert_eq!(next(&mut rx).await.1, format!("{index}"));
        }
    }

    #[tokio::test]
    async fn queue_group_delivers_each_leaf_to_one_member() {
        let wind = Wind::new(16);
        let (left, mut left_rx) = recording("left");
        let (right, mut right_rx) = recording("right");

        wind.subscribe_queue("scores.*", "scoring", left)
            .await
            .unwrap();
        wind.subscribe_queue("scores.*", "scoring", right)
            .await
            .unwrap();

        for index in 0..6 {
            wind.publish(Leaf::new(
                "scores.updated",
                format!("{index}").into_bytes(),
                "test",
            ))
            .await
            .unwrap();
        }

        let mut total = 0;
        for _ in 0..6 {
            tokio::select! {
                Some(_) = left_rx.recv() => total += 1,
                Some(_) = right_rx.recv() => total += 1,
            }
        }
        assert_eq!(total, 6);
        assert!(left_rx.try_recv().is_err());
        assert!(right_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let wind = Wind::new(16);
        let (listener, mut rx) = recording("gone");
        let handle = wind.subscribe("alerts.>", listener).await.unwrap();

        wind.publish(Leaf::new("alerts.cpu", b"before".to_vec(), "test"))
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await.1, "before");

        wind.unsubscribe(handle).await;
        wind.publish(Leaf::new("alerts.cpu", b"after".to_vec(), "test"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    struct StalledListener {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl LeafListener for StalledListener {
        async fn on_leaf(&self, _leaf: Arc<Leaf>) {
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn publisher_is_never_blocked_by_a_slow_subscriber() {
        let wind = Wind::new(1);
        let release = Arc::new(Notify::new());
        wind.subscribe(
            "slow.>",
            Arc::new(StalledListener {
                release: release.clone(),
            }),
        )
        .await
        .unwrap();

        // Far more publishes than queue capacity; all must return promptly.
        for _ in 0..32 {
            timeout(
                Duration::from_millis(200),
                wind.publish(Leaf::new("slow.feed", b"x".to_vec(), "test")),
            )
            .await
            .expect("publish must not block")
            .unwrap();
        }
        release.notify_waiters();
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails_with_bus_error() {
        let wind = Wind::new(4);
        wind.shutdown().await;
        let err = wind
            .publish(Leaf::new("a.b", b"x".to_vec(), "test"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::status::ErrorKind::Bus);
    }
}
