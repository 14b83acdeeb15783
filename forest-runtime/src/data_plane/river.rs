//! River: the durable stream of raw external inputs.

use crate::data_plane::consumer::{ConsumerHandle, RecordHandler};
use crate::data_plane::stream::{DurableStream, StreamConfig};
use crate::routing::validate_subject;
use crate::status::{ErrorKind, ForestError};
use std::path::Path;
use std::sync::Arc;

pub const RIVER_STREAM_NAME: &str = "RIVER";
pub const RIVER_SUBJECT_FILTER: &str = "river.>";

/// Durable, replayable stream of external inputs. Everything entering the
/// forest from the outside flows through here first.
pub struct River {
    stream: Arc<DurableStream>,
}

impl River {
    /// Opens the RIVER stream under the bus data directory. Idempotent for a
    /// matching configuration.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        mut config: StreamConfig,
    ) -> Result<Arc<Self>, ForestError> {
        config.name = RIVER_STREAM_NAME.to_string();
        config.subject_filter = RIVER_SUBJECT_FILTER.to_string();
        let stream = DurableStream::open(data_dir, config).await?;
        Ok(Arc::new(Self { stream }))
    }

    /// Appends an external input; returns its slot after durable commit.
    pub async fn flow(&self, subject: &str, bytes: &[u8]) -> Result<u64, ForestError> {
        validate_subject(subject)?;
        if subject == "river" || !subject.starts_with("river.") {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("river subjects must live under river., got {subject:?}"),
            ));
        }
        self.stream.append(subject, bytes).await
    }

    /// Creates (or resumes) the durable consumer named from `group`,
    /// delivering matching records in slot order with explicit ack.
    pub async fn observe(
        &self,
        pattern: &str,
        group: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ConsumerHandle, ForestError> {
        self.stream.observe(group, pattern, handler).await
    }

    pub fn stream(&self) -> &Arc<DurableStream> {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::River;
    use crate::data_plane::stream::StreamConfig;
    use crate::status::ErrorKind;

    #[tokio::test]
    async fn flow_requires_river_prefixed_subjects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let river = River::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();

        assert_eq!(river.flow("river.stripe.webhook", b"{}").await.unwrap(), 1);
        let err = river.flow("payment.completed", b"{}").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bus);
        assert!(river.flow("river", b"{}").await.is_err());
    }
}
