//! The per-machine node descriptor.

use crate::status::{ErrorKind, ForestError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Identity and registry binding of one node. Absence of the descriptor
/// file means the node runs standalone, with no peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub forest_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub registry_locator: String,
    #[serde(default)]
    pub registry_credentials: Option<String>,
    /// Address this node announces for inbound peer links.
    #[serde(default)]
    pub address: Option<String>,
}

impl NodeDescriptor {
    /// The node id, minting a random one when the descriptor leaves it out.
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Reads the node descriptor; `Ok(None)` when the file is absent.
pub fn load_node_descriptor(path: impl AsRef<Path>) -> Result<Option<NodeDescriptor>, ForestError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            format!("unable to read node descriptor {}: {err}", path.display()),
        )
    })?;
    let descriptor: NodeDescriptor = json5::from_str(&raw).map_err(|err| {
        ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            format!("unparsable node descriptor: {err}"),
        )
    })?;
    if descriptor.forest_id.is_empty() {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            "node descriptor requires a forestId",
        ));
    }
    Ok(Some(descriptor))
}
