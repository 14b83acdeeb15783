//! Node bootstrap: discover peers, bring up the peer fabric, size
//! replication.

use crate::cluster::node::NodeDescriptor;
use crate::cluster::peer::PeerLinks;
use crate::cluster::registry::registry_for;
use crate::data_plane::wind::Wind;
use crate::status::ForestError;
use std::sync::Arc;
use tracing::{info, warn};

const BOOT_TAG: &str = "ClusterBoot:";

/// Replication ceiling regardless of cluster size.
const MAX_REPLICAS: usize = 3;

/// The outcome of cluster bootstrap, owned by the node for its lifetime.
pub struct ClusterHandle {
    pub node_id: String,
    pub peer_count: usize,
    /// `min(peers_known_at_create + 1, 3)`, recorded on stream creation.
    pub replicas: usize,
    links: Option<PeerLinks>,
}

impl ClusterHandle {
    pub async fn shutdown(&self) {
        if let Some(links) = &self.links {
            links.shutdown().await;
        }
    }
}

/// Boots cluster membership. Without a node descriptor the node runs
/// standalone. With one, the registry is queried once for peers in the same
/// forest; the bus's own gossip (the peer links' reconnect behavior) covers
/// later topology changes.
pub async fn bootstrap(
    node: Option<NodeDescriptor>,
    wind: Arc<Wind>,
) -> Result<ClusterHandle, ForestError> {
    let Some(node) = node else {
        info!("{BOOT_TAG} no node descriptor, running standalone");
        return Ok(ClusterHandle {
            node_id: "standalone".to_string(),
            peer_count: 0,
            replicas: 1,
            links: None,
        });
    };

    let node_id = node.node_id();
    let registry = registry_for(&node.registry_locator, node.registry_credentials.clone());
    let entries = registry.nodes(&node.forest_id).await?;
    let peers: Vec<String> = entries
        .iter()
        .filter(|entry| entry.node_id != node_id && entry.status == "up")
        .map(|entry| entry.address.clone())
        .collect();

    let mut links = PeerLinks::new();
    if let Some(address) = &node.address {
        links.listen(wind.clone(), address).await?;
    } else {
        warn!("{BOOT_TAG} node {node_id:?} announces no address; inbound links disabled");
    }
    for peer in &peers {
        links.link(&wind, peer).await;
    }

    let replicas = (peers.len() + 1).min(MAX_REPLICAS);
    info!(
        "{BOOT_TAG} node {node_id:?} joined forest {:?} with {} peers, replicas {replicas}",
        node.forest_id,
        peers.len()
    );
    Ok(ClusterHandle {
        node_id,
        peer_count: peers.len(),
        replicas,
        links: Some(links),
    })
}

#[cfg(test)]
mod tests {
    use super::bootstrap;
    use crate::cluster::node::NodeDescriptor;
    use crate::cluster::registry::RegistryEntry;
    use crate::data_plane::wind::Wind;
    use std::sync::Arc;

    fn registry_dir(entries: &[RegistryEntry]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for entry in entries {
            std::fs::write(
                dir.path().join(format!("{}.json", entry.node_id)),
                serde_json::to_string(entry).unwrap(),
            )
            .unwrap();
        }
        dir
    }

    fn entry(node: &str, status: &str) -> RegistryEntry {
        RegistryEntry {
            node_id: node.to_string(),
            forest_id: "prod".to_string(),
            address: "127.0.0.1:0".to_string(),
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn standalone_without_a_descriptor() {
        let handle = bootstrap(None, Arc::new(Wind::new(8))).await.unwrap();
        assert_eq!(handle.peer_count, 0);
        assert_eq!(handle.replicas, 1);
    }

    #[tokio::test]
    async fn replication_counts_live_peers_and_caps_at_three() {
        let dir = registry_dir(&[
            entry("self", "up"),
            entry("peer-1", "up"),
            entry("peer-2", "up"),
            entry("peer-3", "up"),
            entry("peer-down", "down"),
        ]);
        let node = NodeDescriptor {
            forest_id: "prod".to_string(),
            node_id: Some("self".to_string()),
            registry_locator: dir.path().display().to_string(),
            registry_credentials: None,
            address: Some("127.0.0.1:0".to_string()),
        };
        let handle = bootstrap(Some(node), Arc::new(Wind::new(8))).await.unwrap();
        assert_eq!(handle.peer_count, 3);
        assert_eq!(handle.replicas, 3);
        handle.shutdown().await;
    }
}
