//! The asker seam: how a Nim reaches its brain.

use crate::runtime::worker::DEFAULT_ASK_DEADLINE;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const ASKER_TAG: &str = "HttpAsker:";

/// One-shot question/answer against an external model (or a fake in tests).
#[async_trait]
pub trait AiAsker: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String, ForestError>;
}

#[derive(Serialize)]
struct AskRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
}

/// JSON-over-HTTP asker: POSTs `{model?, prompt}` to the brain endpoint and
/// reads `text` (or `completion`, or the raw body) from the reply.
pub struct HttpAsker {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    deadline: Duration,
}

impl HttpAsker {
    pub fn new(endpoint: impl Into<String>, model: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model,
            api_key,
            deadline: DEFAULT_ASK_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl AiAsker for HttpAsker {
    async fn ask(&self, prompt: &str) -> Result<String, ForestError> {
        let request = self
            .client
            .post(&self.endpoint)
            .timeout(self.deadline)
            .json(&AskRequest {
                model: self.model.as_deref(),
                prompt,
            });
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ForestError::fail_with_kind(
                    ErrorKind::ExternalTimeout,
                    format!("ask exceeded {:?}", self.deadline),
                )
            } else {
                ForestError::fail_with_kind(ErrorKind::Bus, format!("brain unreachable: {err}"))
            }
        })?;
        if !response.status().is_success() {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("brain returned {}", response.status()),
            ));
        }

        let body = response.text().await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("brain reply unreadable: {err}"))
        })?;
        debug!("{ASKER_TAG} reply of {} bytes", body.len());

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            for field in ["text", "completion"] {
                if let Some(text) = value.get(field).and_then(|text| text.as_str()) {
                    return Ok(text.to_string());
                }
            }
        }
        Ok(body)
    }
}
