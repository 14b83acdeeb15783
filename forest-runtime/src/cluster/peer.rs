//! Peer links: line-JSON Leaf relay over TCP between forest nodes.
//!
//! Every locally published Leaf is forwarded once to each connected peer;
//! a Leaf arriving from a peer is delivered locally and never re-forwarded,
//! so a mesh cannot loop traffic. Outbound links reconnect with backoff;
//! traffic lost while a link is down stays lost (Wind is at-most-once).

use crate::data_plane::wind::Wind;
use crate::leaf::Leaf;
use crate::status::{ErrorKind, ForestError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PEER_TAG: &str = "PeerLinks:";
const PEER_FN_LISTEN_TAG: &str = "listen():";
const PEER_FN_LINK_TAG: &str = "link():";

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const RELAY_QUEUE: usize = 1024;

/// The running peer fabric of one node.
pub struct PeerLinks {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
}

impl PeerLinks {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            local_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the inbound listener and delivers received Leaves locally.
    pub async fn listen(&mut self, wind: Arc<Wind>, address: &str) -> Result<(), ForestError> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("unable to bind peer listener on {address:?}: {err}"),
            )
        })?;
        self.local_addr = listener.local_addr().ok();
        debug!("{PEER_TAG}{PEER_FN_LISTEN_TAG} listening on {:?}", self.local_addr);

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("{PEER_TAG}{PEER_FN_LISTEN_TAG} accept failed: {err}");
                        continue;
                    }
                };
                debug!("{PEER_TAG}{PEER_FN_LISTEN_TAG} peer connected from {peer_addr}");
                let wind = wind.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = read_leaves(stream, wind, cancel).await {
                        warn!("{PEER_TAG}{PEER_FN_LISTEN_TAG} link from {peer_addr} closed: {err}");
                    }
                });
            }
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }

    /// Opens an outbound link to one peer and registers it as a Wind relay.
    pub async fn link(&self, wind: &Arc<Wind>, peer_address: &str) {
        let (relay_tx, mut relay_rx) = mpsc::channel::<Arc<Leaf>>(RELAY_QUEUE);
        wind.register_relay(relay_tx).await;

        let address = peer_address.to_string();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut connection: Option<TcpStream> = None;
            loop {
                let leaf = tokio::select! {
                    _ = cancel.cancelled() => return,
                    leaf = relay_rx.recv() => match leaf {
                        Some(leaf) => leaf,
                        None => return,
                    },
                };
                let line = match serde_json::to_string(&*leaf) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    Err(err) => {
                        warn!("{PEER_TAG}{PEER_FN_LINK_TAG} unserializable leaf: {err}");
                        continue;
                    }
                };

                if connection.is_none() {
                    match TcpStream::connect(&address).await {
                        Ok(stream) => connection = Some(stream),
                        Err(err) => {
                            // Drop this leaf and back off; Wind is lossy by
                            // contract while a link is down.
                            warn!(
                                "{PEER_TAG}{PEER_FN_LINK_TAG} {address:?} unreachable: {err}"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                            }
                            continue;
                        }
                    }
                }
                if let Some(stream) = connection.as_mut() {
                    if let Err(err) = stream.write_all(line.as_bytes()).await {
                        warn!("{PEER_TAG}{PEER_FN_LINK_TAG} write to {address:?} failed: {err}");
                        connection = None;
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        futures::future::join_all(tasks).await;
    }
}

impl Default for PeerLinks {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_leaves(
    stream: TcpStream,
    wind: Arc<Wind>,
    cancel: CancellationToken,
) -> Result<(), ForestError> {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line,
        };
        let Some(line) = line.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("peer read failed: {err}"))
        })?
        else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Leaf>(&line) {
            Ok(leaf) => {
                if let Err(err) = wind.publish_remote(leaf).await {
                    warn!("{PEER_TAG} remote delivery failed: {err}");
                }
            }
            Err(err) => {
                warn!("{PEER_TAG} malformed peer frame: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PeerLinks;
    use crate::data_plane::wind::{LeafListener, Wind};
    use crate::leaf::Leaf;
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
    async fn leaves_cross_a_two_node_link_without_looping() {
        let wind_a = Arc::new(Wind::new(32));
        let wind_b = Arc::new(Wind::new(32));

        let mut links_b = PeerLinks::new();
        links_b.listen(wind_b.clone(), "127.0.0.1:0").await.unwrap();
        let addr_b = links_b.local_addr().unwrap();

        let links_a = PeerLinks::new();
        links_a.link(&wind_a, &addr_b.to_string()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        wind_b
            .subscribe("alerts.>", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        wind_a
            .publish(Leaf::new("alerts.cpu", br#"{"pct":97}"#.to_vec(), "node-a"))
            .await
            .unwrap();

        let leaf = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("leaf crossed the link")
            .unwrap();
        assert_eq!(leaf.subject, "alerts.cpu");
        assert_eq!(leaf.source, "node-a");

        links_a.shutdown().await;
        links_b.shutdown().await;
    }
}
