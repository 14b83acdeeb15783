//! Humus: the durable change-log of state-change intents.

use crate::data_plane::consumer::{ConsumerHandle, RecordHandler};
use crate::data_plane::stream::{DurableStream, StreamConfig};
use crate::status::{ErrorKind, ForestError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const HUMUS_STREAM_NAME: &str = "HUMUS";
pub const HUMUS_SUBJECT_FILTER: &str = "humus.>";

/// Name of the pinned consumer reserved for the Decomposer.
pub(crate) const DECOMPOSER_CONSUMER: &str = "DECOMPOSER";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompostAction {
    Create,
    Update,
    Delete,
}

/// One state-change intent on the change-log.
///
/// `entity` is a key path such as `tasks/followup-xyz`; per-entity write
/// order equals slot order because the stream assigns slots monotonically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compost {
    pub entity: String,
    pub action: CompostAction,
    #[serde(
        serialize_with = "crate::leaf::serialize_payload",
        deserialize_with = "crate::leaf::deserialize_payload"
    )]
    pub payload: Vec<u8>,
    pub producer: String,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the stream; zero until appended.
    #[serde(default)]
    pub slot: u64,
}

/// Maps an entity key path to its change-log subject.
fn entity_subject(entity: &str) -> Result<String, ForestError> {
    if entity.is_empty()
        || entity
            .split('/')
            .any(|token| token.is_empty() || token.contains('.'))
    {
        return Err(ForestError::fail_with_kind(
            ErrorKind::Bus,
            format!("invalid entity path {entity:?}"),
        ));
    }
    Ok(format!("humus.{}", entity.replace('/', ".")))
}

/// Durable stream of state-change intents, applied to Soil by the
/// Decomposer and by nothing else.
pub struct Humus {
    stream: Arc<DurableStream>,
}

impl Humus {
    pub async fn open(
        data_dir: impl AsRef<Path>,
        mut config: StreamConfig,
    ) -> Result<Arc<Self>, ForestError> {
        config.name = HUMUS_STREAM_NAME.to_string();
        config.subject_filter = HUMUS_SUBJECT_FILTER.to_string();
        let stream = DurableStream::open(data_dir, config).await?;
        Ok(Arc::new(Self { stream }))
    }

    /// Appends one intent and returns its monotonic slot.
    pub async fn add(
        &self,
        producer: &str,
        entity: &str,
        action: CompostAction,
        payload: &[u8],
    ) -> Result<u64, ForestError> {
        let subject = entity_subject(entity)?;
        let compost = Compost {
            entity: entity.to_string(),
            action,
            payload: payload.to_vec(),
            producer: producer.to_string(),
            timestamp: Utc::now(),
            slot: 0,
        };
        let bytes = serde_json::to_vec(&compost)
            .map_err(|err| ForestError::fail_with_kind(ErrorKind::Internal, err.to_string()))?;
        self.stream.append(&subject, &bytes).await
    }

    /// Opens the pinned consumer the Decomposer drains. At most one holder
    /// is active per forest; later openers stand by.
    pub async fn decompose(
        &self,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ConsumerHandle, ForestError> {
        self.stream
            .observe_pinned(DECOMPOSER_CONSUMER, HUMUS_SUBJECT_FILTER, handler)
            .await
    }

    pub fn stream(&self) -> &Arc<DurableStream> {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::{entity_subject, CompostAction, Humus};
    use crate::data_plane::stream::StreamConfig;

    #[test]
    fn entity_paths_map_to_humus_subjects() {
        assert_eq!(
            entity_subject("tasks/followup-cus_alice").unwrap(),
            "humus.tasks.followup-cus_alice"
        );
        assert!(entity_subject("").is_err());
        assert!(entity_subject("tasks//x").is_err());
        assert!(entity_subject("tasks/a.b").is_err());
    }

    #[tokio::test]
    async fn add_returns_monotonic_slots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let humus = Humus::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();

        let first = humus
            .add("nim-a", "tasks/one", CompostAction::Create, b"{}")
            .await
            .unwrap();
        let second = humus
            .add("nim-a", "tasks/two", CompostAction::Create, b"{}")
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
