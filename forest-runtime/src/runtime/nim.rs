//! Nim: the non-deterministic decision-maker.
//!
//! A Nim renders a prompt template from each triggering Leaf, asks its
//! brain, and turns the reply into result Leaves and/or Humus intents. The
//! advisory AAA surface (`advice` / `action` / `automate`) lets the
//! supervisor drive a Nim directly; a component answering `not_supported`
//! to all three is a TreeHouse wearing the wrong hat.

use crate::control_plane::descriptor::{ComponentDescriptor, ComponentKind};
use crate::data_plane::humus::{CompostAction, Humus};
use crate::data_plane::wind::{LeafListener, SubscriptionHandle, Wind};
use crate::leaf::Leaf;
use crate::runtime::artifact::{LeafSpec, PromptArtifact};
use crate::runtime::asker::AiAsker;
use crate::runtime::songbird::{Songbird, SongbirdMessage};
use crate::runtime::worker::{run_with_deadline, DEFAULT_HANDLER_DEADLINE, DEFAULT_HTTP_DEADLINE};
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NIM_TAG: &str = "Nim:";
const NIM_FN_ON_LEAF_TAG: &str = "on_leaf():";
const NIM_FN_ACTION_TAG: &str = "action():";

/// Declarative agent binding available to a Nim's `action` operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentSpec {
    /// Dispatch back into the brain as a one-shot process.
    Ai,
    /// Ask a person through a Songbird; the reply re-enters as a Leaf.
    Human { songbird: String, to: String },
    /// POST the parameters to an external endpoint.
    Webhook { url: String },
    /// Reserved; not implemented by this runtime.
    Browser,
}

/// Outcome of one `action` dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome {
    /// The agent completed synchronously.
    Done(String),
    /// A human was asked; the reply will arrive on `reply_to`.
    Pending {
        correlation_id: String,
        reply_to: String,
    },
}

/// Result of an `automate` submission.
#[derive(Clone, Debug, PartialEq)]
pub struct AutomationResult {
    pub kind: ComponentKind,
    pub name: String,
    pub enabled: bool,
}

/// Seam through which a Nim submits generated components to the supervisor
/// without the runtime layer owning control-plane policy.
#[async_trait]
pub trait Automator: Send + Sync {
    async fn submit(&self, descriptor: ComponentDescriptor) -> Result<(), ForestError>;
    async fn withdraw(&self, kind: ComponentKind, name: &str) -> Result<(), ForestError>;
}

/// Reply directives a brain may return instead of plain text.
#[derive(Debug, Default, Deserialize)]
struct ReplyDirectives {
    #[serde(default)]
    leaves: Vec<LeafSpec>,
    #[serde(default)]
    compost: Vec<CompostDirective>,
}

#[derive(Debug, Deserialize)]
struct CompostDirective {
    entity: String,
    action: CompostAction,
    payload: serde_json::Value,
}

struct NimWorker {
    name: String,
    publishes: Option<String>,
    prompt: Arc<PromptArtifact>,
    asker: Arc<dyn AiAsker>,
    wind: Arc<Wind>,
    humus: Arc<Humus>,
}

impl NimWorker {
    async fn handle(&self, leaf: &Leaf) {
        let payload = leaf
            .payload_json()
            .unwrap_or_else(|_| json!({"text": String::from_utf8_lossy(&leaf.payload).to_string()}));
        let prompt = self.prompt.render(&payload);

        let reply = match self.asker.ask(&prompt).await {
            Ok(reply) => reply,
            Err(err) if err.kind() == ErrorKind::ExternalTimeout => {
                // Deadline exceeded: log, emit nothing.
                warn!(
                    "{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?} ask timed out on {:?}: {err}",
                    self.name, leaf.subject
                );
                return;
            }
            Err(err) => {
                warn!(
                    "{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?} ask failed on {:?}: {err}",
                    self.name, leaf.subject
                );
                return;
            }
        };

        let directives = parse_directives(&reply);
        let Some(directives) = directives else {
            // An answer-shaped reply still enters the forest.
            if let Some(publishes) = &self.publishes {
                self.publish_spec(LeafSpec {
                    subject: Some(publishes.clone()),
                    payload: json!({"text": reply}),
                })
                .await;
            }
            return;
        };

        for spec in directives.leaves {
            self.publish_spec(spec).await;
        }
        for compost in directives.compost {
            let payload = match serde_json::to_vec(&compost.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?}: {err}", self.name);
                    continue;
                }
            };
            if let Err(err) = self
                .humus
                .add(&self.name, &compost.entity, compost.action, &payload)
                .await
            {
                warn!(
                    "{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?} compost on {:?} failed: {err}",
                    self.name, compost.entity
                );
            }
        }
    }

    async fn publish_spec(&self, spec: LeafSpec) {
        let Some(subject) = spec.subject.or_else(|| self.publishes.clone()) else {
            warn!(
                "{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?} leaf without subject and no output configured",
                self.name
            );
            return;
        };
        let payload = match serde_json::to_vec(&spec.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?}: {err}", self.name);
                return;
            }
        };
        if let Err(err) = self
            .wind
            .publish(Leaf::new(subject, payload, self.name.clone()))
            .await
        {
            warn!("{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {:?} publish failed: {err}", self.name);
        }
    }
}

/// A directive document must carry at least one recognized section;
/// anything else is treated as prose.
fn parse_directives(reply: &str) -> Option<ReplyDirectives> {
    let value: serde_json::Value = serde_json::from_str(reply).ok()?;
    if value.get("leaves").is_none() && value.get("compost").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[async_trait]
impl LeafListener for NimWorker {
    async fn on_leaf(&self, leaf: Arc<Leaf>) {
        if let Err(err) =
            run_with_deadline(&self.name, DEFAULT_HANDLER_DEADLINE, self.handle(&leaf)).await
        {
            warn!("{NIM_TAG}{NIM_FN_ON_LEAF_TAG} {err}");
        }
    }
}

/// Shared wiring the supervisor hands to every Nim it starts.
#[derive(Clone)]
pub struct NimContext {
    pub wind: Arc<Wind>,
    pub humus: Arc<Humus>,
    pub asker: Arc<dyn AiAsker>,
    pub songbirds: HashMap<String, Arc<dyn Songbird>>,
    pub automator: Option<Arc<dyn Automator>>,
}

/// A running Nim and its advisory surface.
pub struct Nim {
    name: String,
    worker: Arc<NimWorker>,
    context: NimContext,
    agents: HashMap<String, AgentSpec>,
    subscription: SubscriptionHandle,
    reply_subscriptions: Mutex<Vec<SubscriptionHandle>>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl Nim {
    pub async fn start(
        name: &str,
        subscribes: &str,
        publishes: Option<String>,
        prompt: Arc<PromptArtifact>,
        agents: HashMap<String, AgentSpec>,
        context: NimContext,
    ) -> Result<Self, ForestError> {
        let worker = Arc::new(NimWorker {
            name: name.to_string(),
            publishes,
            prompt,
            asker: context.asker.clone(),
            wind: context.wind.clone(),
            humus: context.humus.clone(),
        });
        let subscription = context
            .wind
            .subscribe_queue(subscribes, &format!("nim.{name}"), worker.clone())
            .await?;
        debug!("{NIM_TAG} {name:?} subscribed to {subscribes:?}");
        Ok(Self {
            name: name.to_string(),
            worker,
            context,
            agents,
            subscription,
            reply_subscriptions: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            http: reqwest::Client::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One-shot question and answer against the Nim's brain.
    pub async fn advice(&self, query: &str) -> Result<String, ForestError> {
        self.context.asker.ask(query).await
    }

    /// Dispatches a named agent. Human agents are non-blocking: the reply
    /// arrives later as a Leaf on the returned `reply_to` subject.
    pub async fn action(
        &self,
        agent: &str,
        params: serde_json::Value,
    ) -> Result<ActionOutcome, ForestError> {
        let spec = self.agents.get(agent).ok_or_else(|| {
            ForestError::fail_with_kind(
                ErrorKind::NotSupported,
                format!("no agent {agent:?} on nim {:?}", self.name),
            )
        })?;

        match spec {
            AgentSpec::Ai => {
                let prompt = format!("Perform action {agent:?} with parameters {params}");
                self.context.asker.ask(&prompt).await.map(ActionOutcome::Done)
            }
            AgentSpec::Human { songbird, to } => {
                let bird = self.context.songbirds.get(songbird).ok_or_else(|| {
                    ForestError::fail_with_kind(
                        ErrorKind::NotFound,
                        format!("no songbird {songbird:?}"),
                    )
                })?;
                let text = params
                    .get("text")
                    .and_then(|text| text.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| params.to_string());
                let msg = SongbirdMessage::new(to.clone(), text);

                // Subscribe before sending so the reply cannot be missed.
                let reply_subscription = self
                    .context
                    .wind
                    .subscribe(&msg.reply_to, self.worker.clone())
                    .await?;
                self.reply_subscriptions
                    .lock()
                    .await
                    .push(reply_subscription);

                debug!(
                    "{NIM_TAG}{NIM_FN_ACTION_TAG} {:?} asking {to:?} via {songbird:?}, reply on {:?}",
                    self.name, msg.reply_to
                );
                let outcome = ActionOutcome::Pending {
                    correlation_id: msg.id.clone(),
                    reply_to: msg.reply_to.clone(),
                };
                bird.send(&self.cancel, msg).await?;
                Ok(outcome)
            }
            AgentSpec::Webhook { url } => {
                let response = self
                    .http
                    .post(url)
                    .timeout(DEFAULT_HTTP_DEADLINE)
                    .json(&params)
                    .send()
                    .await
                    .map_err(|err| {
                        if err.is_timeout() {
                            ForestError::fail_with_kind(
                                ErrorKind::ExternalTimeout,
                                format!("webhook agent {agent:?} timed out"),
                            )
                        } else {
                            ForestError::fail_with_kind(
                                ErrorKind::Bus,
                                format!("webhook agent {agent:?} failed: {err}"),
                            )
                        }
                    })?;
                let body = response.text().await.unwrap_or_default();
                Ok(ActionOutcome::Done(body))
            }
            AgentSpec::Browser => Err(ForestError::fail_with_kind(
                ErrorKind::NotSupported,
                "browser agents are not implemented",
            )),
        }
    }

    /// Submits (or withdraws) a generated TreeHouse or Nim descriptor.
    pub async fn automate(
        &self,
        descriptor: ComponentDescriptor,
        enable: bool,
    ) -> Result<AutomationResult, ForestError> {
        let automator = self.context.automator.as_ref().ok_or_else(|| {
            ForestError::fail_with_kind(ErrorKind::NotSupported, "no automator attached")
        })?;
        let kind = descriptor.kind();
        if !matches!(kind, ComponentKind::TreeHouse | ComponentKind::Nim) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::ConfigInvalid,
                format!("automate may generate treehouses and nims, not {kind}"),
            ));
        }
        let name = descriptor.name.clone();
        if enable {
            automator.submit(descriptor).await?;
        } else {
            automator.withdraw(kind, &name).await?;
        }
        Ok(AutomationResult {
            kind,
            name,
            enabled: enable,
        })
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.context.wind.unsubscribe(self.subscription).await;
        let replies: Vec<SubscriptionHandle> =
            self.reply_subscriptions.lock().await.drain(..).collect();
        for subscription in replies {
            self.context.wind.unsubscribe(subscription).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_directives, AgentSpec, Nim, NimContext};
    use crate::data_plane::humus::Humus;
    use crate::data_plane::stream::StreamConfig;
    use crate::data_plane::wind::{LeafListener, Wind};
    use crate::leaf::Leaf;
    use crate::runtime::artifact::PromptArtifact;
    use crate::runtime::asker::AiAsker;
    use crate::runtime::songbird::{Songbird, SongbirdMessage};
    use crate::status::{ErrorKind, ForestError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex as TokioMutex};
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    struct CannedAsker {
        prompts: TokioMutex<Vec<String>>,
        reply: String,
    }

    #[async_trait]
    impl AiAsker for CannedAsker {
        async fn ask(&self, prompt: &str) -> Result<String, ForestError> {
            self.prompts.lock().await.push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    struct CollectingListener {
        leaves: mpsc::UnboundedSender<Leaf>,
    }

    #[async_trait]
    impl LeafListener for CollectingListener {
        async fn on_leaf(&self, leaf: Arc<Leaf>) {
            let _ = self.leaves.send((*leaf).clone());
        }
    }

    async fn context(reply: &str) -> (NimContext, Arc<CannedAsker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let humus = Humus::open(dir.path(), StreamConfig::new("", ""))
            .await
            .unwrap();
        let asker = Arc::new(CannedAsker {
            prompts: TokioMutex::new(Vec::new()),
            reply: reply.to_string(),
        });
        (
            NimContext {
                wind: Arc::new(Wind::new(16)),
                humus,
                asker: asker.clone(),
                songbirds: HashMap::new(),
                automator: None,
            },
            asker,
            dir,
        )
    }

    #[tokio::test]
    async fn directive_replies_produce_leaves_and_compost() {
        let reply = r#"{
            "leaves": [{"subject": "followup.scheduled", "payload": {"customer": "cus_alice"}}],
            "compost": [{"entity": "tasks/followup-cus_alice", "action": "create", "payload": {"kind": "followup"}}]
        }"#;
        let (context, asker, _dir) = context(reply).await;
        let humus = context.humus.clone();
        let wind = context.wind.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("followup.scheduled", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        let prompt = Arc::new(PromptArtifact::from_template(
            "Customer {{customer_id}} paid {{amount}}.",
        ));
        let nim = Nim::start(
            "aftersales",
            "payment.completed",
            Some("followup.scheduled".to_string()),
            prompt,
            HashMap::new(),
            context,
        )
        .await
        .unwrap();

        wind.publish(Leaf::new(
            "payment.completed",
            br#"{"customer_id":"cus_alice","amount":150.0}"#.to_vec(),
            "payment",
        ))
        .await
        .unwrap();

        let leaf = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.source, "aftersales");
        assert_eq!(leaf.payload_json().unwrap()["customer"], "cus_alice");

        // The compost intent landed on the change-log.
        let record = humus
            .stream()
            .fetch_from(1, "humus.>")
            .await
            .expect("compost appended");
        assert!(record.subject.contains("followup-cus_alice"));

        // The prompt was rendered from the leaf payload.
        let prompts = asker.prompts.lock().await;
        assert_eq!(prompts[0], "Customer cus_alice paid 150.0.");
        nim.stop().await;
    }

    #[tokio::test]
    async fn prose_replies_publish_as_text_payload() {
        let (context, _asker, _dir) = context("just schedule it").await;
        let wind = context.wind.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        wind.subscribe("decisions.out", Arc::new(CollectingListener { leaves: tx }))
            .await
            .unwrap();

        let nim = Nim::start(
            "decider",
            "decisions.in",
            Some("decisions.out".to_string()),
            Arc::new(PromptArtifact::from_template("{{question}}")),
            HashMap::new(),
            context,
        )
        .await
        .unwrap();

        wind.publish(Leaf::new(
            "decisions.in",
            br#"{"question":"ship it?"}"#.to_vec(),
            "test",
        ))
        .await
        .unwrap();

        let leaf = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.payload_json().unwrap()["text"], "just schedule it");
        nim.stop().await;
    }

    #[test]
    fn non_directive_json_is_treated_as_prose() {
        assert!(parse_directives(r#"{"answer": 42}"#).is_none());
        assert!(parse_directives("plain text").is_none());
        let directives = parse_directives(r#"{"leaves": []}"#).unwrap();
        assert!(directives.leaves.is_empty());
    }

    struct RecordingBird {
        sent: TokioMutex<Vec<SongbirdMessage>>,
    }

    #[async_trait]
    impl Songbird for RecordingBird {
        async fn send(
            &self,
            _cancel: &CancellationToken,
            msg: SongbirdMessage,
        ) -> Result<(), ForestError> {
            self.sent.lock().await.push(msg);
            Ok(())
        }
    }

    #[tokio::test]
    async fn human_action_is_non_blocking_and_correlated() {
        let (mut context, _asker, _dir) = context("{}").await;
        let bird = Arc::new(RecordingBird {
            sent: TokioMutex::new(Vec::new()),
        });
        context
            .songbirds
            .insert("dev".to_string(), bird.clone() as Arc<dyn Songbird>);

        let mut agents = HashMap::new();
        agents.insert(
            "approve".to_string(),
            AgentSpec::Human {
                songbird: "dev".to_string(),
                to: "@ops".to_string(),
            },
        );

        let nim = Nim::start(
            "approver",
            "approvals.in",
            None,
            Arc::new(PromptArtifact::from_template("x")),
            agents,
            context,
        )
        .await
        .unwrap();

        let outcome = nim
            .action("approve", serde_json::json!({"text": "refund cus_alice?"}))
            .await
            .unwrap();
        let super::ActionOutcome::Pending {
            correlation_id,
            reply_to,
        } = outcome
        else {
            panic!("human action must be pending");
        };
        assert_eq!(reply_to, format!("human.response.{correlation_id}"));

        let sent = bird.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "@ops");
        assert_eq!(sent[0].text, "refund cus_alice?");
        drop(sent);
        nim.stop().await;
    }

    #[tokio::test]
    async fn unknown_agents_and_browser_agents_are_not_supported() {
        let (context, _asker, _dir) = context("{}").await;
        let mut agents = HashMap::new();
        agents.insert("surf".to_string(), AgentSpec::Browser);

        let nim = Nim::start(
            "plain",
            "in.a",
            None,
            Arc::new(PromptArtifact::from_template("x")),
            agents,
            context,
        )
        .await
        .unwrap();

        assert_eq!(
            nim.action("missing", serde_json::json!({}))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            nim.action("surf", serde_json::json!({}))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotSupported
        );
        nim.stop().await;
    }
}
