//! The Source contract shared by the three input-adapter variants.

use crate::status::ForestError;
use async_trait::async_trait;

/// An input adapter feeding the River from the outside world.
///
/// All three variants (webhook, poller, ceremony) ultimately call
/// `river.flow(subject, bytes)`.
#[async_trait]
pub trait Source: Send + Sync {
    async fn start(&self) -> Result<(), ForestError>;
    async fn stop(&self);
    fn is_running(&self) -> bool;
}
