//! HttpPoll source: tick-driven HTTP polling into the River.
//!
//! An optional cursor is extracted from each response by a dotted JSON path
//! and persisted through a Humus intent under `sources/<name>/cursor`, so a
//! restarted poller resumes where the last cycle left off. The cursor is
//! written via the change-log rather than directly to Soil; the Decomposer
//! stays the only writer to state.

use crate::data_plane::humus::{CompostAction, Humus};
use crate::data_plane::river::River;
use crate::data_plane::soil::Soil;
use crate::runtime::source::Source;
use crate::runtime::worker::DEFAULT_HTTP_DEADLINE;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_TAG: &str = "HttpPollSource:";
const POLL_FN_CYCLE_TAG: &str = "cycle():";

/// URL placeholder replaced with the current cursor value on each cycle.
const CURSOR_PLACEHOLDER: &str = "{{cursor}}";

fn cursor_entity(name: &str) -> String {
    format!("sources/{name}/cursor")
}

/// Dotted-path lookup into a JSON document.
fn extract_cursor(body: &serde_json::Value, dotted_path: &str) -> Option<serde_json::Value> {
    let mut current = body;
    for token in dotted_path.split('.') {
        current = current.get(token)?;
    }
    Some(current.clone())
}

fn cursor_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

struct PollWorker {
    name: String,
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    publishes: String,
    cursor_path: Option<String>,
    river: Arc<River>,
    soil: Arc<Soil>,
    humus: Arc<Humus>,
    client: reqwest::Client,
}

impl PollWorker {
    /// Seeds the in-flight cursor from Soil so a restart resumes where the
    /// last acknowledged cycle left off.
    async fn load_cursor(&self) -> Option<serde_json::Value> {
        let entry = self.soil.get(&cursor_entity(&self.name)).await.ok()?;
        let value: serde_json::Value = serde_json::from_slice(&entry.bytes).ok()?;
        value.get("cursor").cloned()
    }

    async fn cycle(&self, cursor: &mut Option<serde_json::Value>) {
        let url = match cursor {
            Some(value) => self.url.replace(CURSOR_PLACEHOLDER, &cursor_text(value)),
            None => self.url.replace(CURSOR_PLACEHOLDER, ""),
        };

        let method = match self.method.as_str() {
            "POST" => reqwest::Method::POST,
            _ => reqwest::Method::GET,
        };
        let mut request = self
            .client
            .request(method, &url)
            .timeout(DEFAULT_HTTP_DEADLINE);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                // Skip the cycle; the next tick tries again.
                warn!("{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} request failed: {err}", self.name);
                return;
            }
        };
        if !response.status().is_success() {
            warn!(
                "{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} got {}",
                self.name,
                response.status()
            );
            return;
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!("{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} body unreadable: {err}", self.name);
                return;
            }
        };

        if let Err(err) = self.river.flow(&self.publishes, &body).await {
            warn!("{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} flow failed: {err}", self.name);
            return;
        }

        if let Some(path) = &self.cursor_path {
            let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) else {
                return;
            };
            let Some(next) = extract_cursor(&parsed, path) else {
                return;
            };
            if cursor.as_ref() == Some(&next) {
                return;
            }
            let action = if cursor.is_some() {
                CompostAction::Update
            } else {
                CompostAction::Create
            };
            let payload = serde_json::to_vec(&json!({"cursor": next})).unwrap_or_default();
            match self
                .humus
                .add(&self.name, &cursor_entity(&self.name), action, &payload)
                .await
            {
                Ok(_) => {
                    debug!(
                        "{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} cursor advanced to {next}",
                        self.name
                    );
                    *cursor = Some(next);
                }
                Err(err) => {
                    warn!(
                        "{POLL_TAG}{POLL_FN_CYCLE_TAG} {:?} cursor intent failed: {err}",
                        self.name
                    );
                }
            }
        }
    }
}

pub struct HttpPollSource {
    worker: Arc<PollWorker>,
    interval: Duration,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpPollSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        url: &str,
        method: &str,
        headers: BTreeMap<String, String>,
        interval: Duration,
        publishes: &str,
        cursor_path: Option<String>,
        river: Arc<River>,
        soil: Arc<Soil>,
        humus: Arc<Humus>,
    ) -> Self {
        Self {
            worker: Arc::new(PollWorker {
                name: name.to_string(),
                url: url.to_string(),
                method: method.to_uppercase(),
                headers,
                publishes: publishes.to_string(),
                cursor_path,
                river,
                soil,
                humus,
                client: reqwest::Client::new(),
            }),
            interval,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for HttpPollSource {
    async fn start(&self) -> Result<(), ForestError> {
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Internal,
                format!("poll source {:?} already started", self.worker.name),
            ));
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());
        let worker = self.worker.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut cursor = worker.load_cursor().await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                worker.cycle(&mut cursor).await;
            }
        });
        *task_slot = Some(task);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{cursor_entity, cursor_text, extract_cursor};
    use serde_json::json;

    #[test]
    fn cursor_extraction_walks_dotted_paths() {
        let body = json!({"meta": {"page": {"next": "abc123"}}});
        assert_eq!(
            extract_cursor(&body, "meta.page.next"),
            Some(json!("abc123"))
        );
        assert_eq!(extract_cursor(&body, "meta.missing"), None);
    }

    #[test]
    fn cursor_text_renders_strings_bare() {
        assert_eq!(cursor_text(&json!("abc")), "abc");
        assert_eq!(cursor_text(&json!(42)), "42");
    }

    #[test]
    fn cursor_entity_is_scoped_per_source() {
        assert_eq!(cursor_entity("orders"), "sources/orders/cursor");
    }
}
