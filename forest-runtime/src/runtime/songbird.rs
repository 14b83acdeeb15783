//! Songbird: the non-blocking two-way human channel.
//!
//! `send` returns once the outbound transport accepts the message; the
//! human's reply re-enters the forest asynchronously as a Leaf on the
//! message's `reply_to` subject, correlated by id. No shared state and no
//! back-references between the sender and the transport.

use crate::routing::HUMAN_RESPONSE_PREFIX;
use crate::status::ForestError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const SONGBIRD_TAG: &str = "TracingSongbird:";

/// Subject on which the reply for correlation id `id` arrives.
pub fn response_subject(id: &str) -> String {
    format!("{HUMAN_RESPONSE_PREFIX}.{id}")
}

/// One outbound human-facing message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SongbirdMessage {
    pub id: String,
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub reply_to: String,
}

impl SongbirdMessage {
    /// New message with a fresh correlation id and the conventional
    /// `human.response.<id>` reply subject.
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let reply_to = response_subject(&id);
        Self {
            id,
            to: to.into(),
            text: text.into(),
            options: Vec::new(),
            reply_to,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

/// Pluggable outbound human transport (Telegram, Slack, email, ...).
#[async_trait]
pub trait Songbird: Send + Sync {
    /// Delivers `msg` to a person. Non-blocking with respect to the reply:
    /// returns after the transport accepts the message.
    async fn send(&self, cancel: &CancellationToken, msg: SongbirdMessage)
        -> Result<(), ForestError>;
}

/// Development bird: logs the message instead of delivering it anywhere.
pub struct TracingSongbird;

#[async_trait]
impl Songbird for TracingSongbird {
    async fn send(
        &self,
        _cancel: &CancellationToken,
        msg: SongbirdMessage,
    ) -> Result<(), ForestError> {
        info!(
            "{SONGBIRD_TAG} to {:?}: {:?} (reply on {:?})",
            msg.to, msg.text, msg.reply_to
        );
        Ok(())
    }
}
