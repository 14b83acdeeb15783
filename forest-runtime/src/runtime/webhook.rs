//! HTTP webhook sources and the shared webhook server.
//!
//! One axum service hosts every webhook source: endpoints register and
//! deregister at runtime and a catch-all route dispatches by path, so hot
//! add/remove needs no server restart. Each endpoint carries a pluggable
//! signature verifier and a conservative token bucket.

use crate::data_plane::river::River;
use crate::runtime::source::Source;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const WEBHOOK_TAG: &str = "WebhookServer:";
const WEBHOOK_FN_DISPATCH_TAG: &str = "dispatch():";

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for timestamped signature schemes.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Pluggable request-signature verification schemes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SignatureVerifier {
    #[default]
    None,
    /// `X-Hub-Signature-256: sha256=<hex hmac of body>`.
    Github,
    /// `Stripe-Signature: t=<unix>,v1=<hex hmac of "t.body">` with tolerance.
    Stripe,
    /// `X-Slack-Signature: v0=<hex hmac of "v0:ts:body">` with tolerance.
    Slack,
    /// Generic hex HMAC of the body in a configured header.
    Hmac { header: String },
}

impl SignatureVerifier {
    pub fn verify(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: Option<&str>,
    ) -> Result<(), ForestError> {
        let fail = |message: String| ForestError::fail_with_kind(ErrorKind::ConfigInvalid, message);
        if matches!(self, SignatureVerifier::None) {
            return Ok(());
        }
        let secret = secret.ok_or_else(|| fail("no secret configured".to_string()))?;

        match self {
            SignatureVerifier::None => Ok(()),
            SignatureVerifier::Github => {
                let given = header_str(headers, "x-hub-signature-256")
                    .and_then(|value| value.strip_prefix("sha256="))
                    .ok_or_else(|| fail("missing X-Hub-Signature-256".to_string()))?;
                verify_hex_hmac(secret.as_bytes(), body, given)
            }
            SignatureVerifier::Stripe => {
                let header = header_str(headers, "stripe-signature")
                    .ok_or_else(|| fail("missing Stripe-Signature".to_string()))?;
                let mut timestamp = None;
                let mut signature = None;
                for part in header.split(',') {
                    match part.trim().split_once('=') {
                        Some(("t", value)) => timestamp = Some(value.to_string()),
                        Some(("v1", value)) => signature = Some(value.to_string()),
                        _ => {}
                    }
                }
                let timestamp =
                    timestamp.ok_or_else(|| fail("Stripe-Signature missing t".to_string()))?;
                let signature =
                    signature.ok_or_else(|| fail("Stripe-Signature missing v1".to_string()))?;
                check_tolerance(&timestamp)?;
                let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
                message.extend_from_slice(timestamp.as_bytes());
                message.push(b'.');
                message.extend_from_slice(body);
                verify_hex_hmac(secret.as_bytes(), &message, &signature)
            }
            SignatureVerifier::Slack => {
                let signature = header_str(headers, "x-slack-signature")
                    .and_then(|value| value.strip_prefix("v0="))
                    .ok_or_else(|| fail("missing X-Slack-Signature".to_string()))?;
                let timestamp = header_str(headers, "x-slack-request-timestamp")
                    .ok_or_else(|| fail("missing X-Slack-Request-Timestamp".to_string()))?;
                check_tolerance(timestamp)?;
                let mut message = format!("v0:{timestamp}:").into_bytes();
                message.extend_from_slice(body);
                verify_hex_hmac(secret.as_bytes(), &message, signature)
            }
            SignatureVerifier::Hmac { header } => {
                let given = header_str(headers, header)
                    .ok_or_else(|| fail(format!("missing {header}")))?;
                verify_hex_hmac(secret.as_bytes(), body, given)
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn check_tolerance(timestamp: &str) -> Result<(), ForestError> {
    let given: i64 = timestamp.parse().map_err(|_| {
        ForestError::fail_with_kind(ErrorKind::ConfigInvalid, "unparsable signature timestamp")
    })?;
    if (Utc::now().timestamp() - given).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            "signature timestamp outside tolerance",
        ));
    }
    Ok(())
}

fn verify_hex_hmac(secret: &[u8], message: &[u8], given_hex: &str) -> Result<(), ForestError> {
    let given = hex::decode(given_hex).map_err(|_| {
        ForestError::fail_with_kind(ErrorKind::ConfigInvalid, "signature is not hex")
    })?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| ForestError::fail_with_kind(ErrorKind::Internal, err.to_string()))?;
    mac.update(message);
    mac.verify_slice(&given).map_err(|_| {
        ForestError::fail_with_kind(ErrorKind::ConfigInvalid, "signature mismatch")
    })
}

/// Per-path token bucket (Instant-based, conservative defaults).
pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last: Instant::now(),
        }
    }

    pub(crate) fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub(crate) struct WebhookEndpoint {
    pub(crate) name: String,
    pub(crate) publishes: String,
    pub(crate) verifier: SignatureVerifier,
    pub(crate) secret: Option<String>,
    pub(crate) include_headers: Vec<String>,
    pub(crate) river: Arc<River>,
    pub(crate) bucket: Mutex<TokenBucket>,
}

impl WebhookEndpoint {
    /// Constructs the River payload: the raw body, or a JSON wrapper with
    /// the selected headers when any are configured.
    fn build_payload(&self, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
        if self.include_headers.is_empty() {
            return body.to_vec();
        }
        let mut selected = BTreeMap::new();
        for name in &self.include_headers {
            if let Some(value) = header_str(headers, name) {
                selected.insert(name.to_ascii_lowercase(), value.to_string());
            }
        }
        serde_json::to_vec(&json!({
            "headers": selected,
            "body": String::from_utf8_lossy(body),
        }))
        .unwrap_or_else(|_| body.to_vec())
    }
}

type EndpointMap = Arc<Mutex<HashMap<String, Arc<WebhookEndpoint>>>>;

/// The shared webhook HTTP surface: endpoints come and go at runtime.
pub struct WebhookServer {
    endpoints: EndpointMap,
}

impl Default for WebhookServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookServer {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/*path", post(dispatch))
            .with_state(self.endpoints.clone())
    }

    pub(crate) async fn register(
        &self,
        path: &str,
        endpoint: Arc<WebhookEndpoint>,
    ) -> Result<(), ForestError> {
        let mut endpoints = self.endpoints.lock().await;
        if endpoints.contains_key(path) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::NameConflict,
                format!("webhook path {path:?} already mounted"),
            ));
        }
        debug!("{WEBHOOK_TAG} mounting {path:?} for {:?}", endpoint.name);
        endpoints.insert(path.to_string(), endpoint);
        Ok(())
    }

    pub(crate) async fn deregister(&self, path: &str) {
        self.endpoints.lock().await.remove(path);
    }
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({"code": code, "message": message}))).into_response()
}

async fn dispatch(
    State(endpoints): State<EndpointMap>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/{path}");
    let endpoint = {
        let endpoints = endpoints.lock().await;
        endpoints.get(&path).cloned()
    };
    let Some(endpoint) = endpoint else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_path",
            format!("no webhook mounted at {path:?}"),
        );
    };

    if !endpoint.bucket.lock().await.allow() {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!("webhook {path:?} over its rate budget"),
        );
    }

    if let Err(err) = endpoint
        .verifier
        .verify(&headers, &body, endpoint.secret.as_deref())
    {
        warn!(
            "{WEBHOOK_TAG}{WEBHOOK_FN_DISPATCH_TAG} signature rejected on {path:?}: {err}"
        );
        return error_response(
            StatusCode::UNAUTHORIZED,
            "signature_invalid",
            err.message().to_string(),
        );
    }

    let payload = endpoint.build_payload(&headers, &body);
    match endpoint.river.flow(&endpoint.publishes, &payload).await {
        Ok(slot) => (StatusCode::OK, Json(json!({"slot": slot}))).into_response(),
        Err(err) => {
            warn!("{WEBHOOK_TAG}{WEBHOOK_FN_DISPATCH_TAG} flow failed on {path:?}: {err}");
            error_response(StatusCode::BAD_GATEWAY, "bus", err.message().to_string())
        }
    }
}

/// One webhook source: mounts its path on the shared server while running.
pub struct HttpWebhookSource {
    path: String,
    server: Arc<WebhookServer>,
    endpoint: Arc<WebhookEndpoint>,
    running: AtomicBool,
}

impl HttpWebhookSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        path: &str,
        publishes: &str,
        verifier: SignatureVerifier,
        secret: Option<String>,
        include_headers: Vec<String>,
        rate_capacity: f64,
        rate_refill_per_sec: f64,
        river: Arc<River>,
        server: Arc<WebhookServer>,
    ) -> Self {
        let endpoint = Arc::new(WebhookEndpoint {
            name: name.to_string(),
            publishes: publishes.to_string(),
            verifier,
            secret,
            include_headers,
            river,
            bucket: Mutex::new(TokenBucket::new(rate_capacity, rate_refill_per_sec)),
        });
        Self {
            path: path.to_string(),
            server,
            endpoint,
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Source for HttpWebhookSource {
    async fn start(&self) -> Result<(), ForestError> {
        self.server.register(&self.path, self.endpoint.clone()).await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.server.deregister(&self.path).await;
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
