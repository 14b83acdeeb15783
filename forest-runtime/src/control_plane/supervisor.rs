//! The component supervisor: loads declarative config, starts and stops
//! components, and services hot add/remove/reload.

use crate::control_plane::config::ForestConfig;
use crate::control_plane::descriptor::{
    ComponentDescriptor, ComponentKind, ComponentSpec, SongbirdSpec, SourceSpec,
};
use crate::control_plane::table::{
    ComponentState, ComponentStatus, DescriptorTable, RunningComponent,
};
use crate::data_plane::humus::Humus;
use crate::data_plane::river::River;
use crate::data_plane::soil::Soil;
use crate::data_plane::wind::Wind;
use crate::runtime::artifact::ArtifactLoader;
use crate::runtime::asker::{AiAsker, HttpAsker};
use crate::runtime::ceremony::{CeremonyPayload, CeremonySource};
use crate::runtime::nim::{Automator, Nim, NimContext};
use crate::runtime::poll::HttpPollSource;
use crate::runtime::songbird::{Songbird, TracingSongbird};
use crate::runtime::source::Source;
use crate::runtime::tree::Tree;
use crate::runtime::treehouse::TreeHouse;
use crate::runtime::webhook::{HttpWebhookSource, WebhookServer};
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SUPERVISOR_TAG: &str = "Supervisor:";
const SUPERVISOR_FN_ADD_TAG: &str = "add():";
const SUPERVISOR_FN_RELOAD_TAG: &str = "reload():";
const SUPERVISOR_FN_STOP_TAG: &str = "stop_all():";

const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Default webhook rate budget: 60 burst, 1 request/second refill.
const DEFAULT_WEBHOOK_RATE: (f64, f64) = (60.0, 1.0);

/// Everything a supervisor needs to start components against the substrate.
pub struct SupervisorContext {
    pub wind: Arc<Wind>,
    pub river: Arc<River>,
    pub humus: Arc<Humus>,
    pub soil: Arc<Soil>,
    pub artifacts: ArtifactLoader,
    pub webhook_server: Arc<WebhookServer>,
    /// Conductor tempo used to convert ceremony intervals to beat counts.
    pub tempo_hz: f64,
    /// Test seam: overrides every Nim's brain when set.
    pub asker_override: Option<Arc<dyn AiAsker>>,
    pub drain_deadline: Duration,
    pub webhook_rate: (f64, f64),
}

impl SupervisorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wind: Arc<Wind>,
        river: Arc<River>,
        humus: Arc<Humus>,
        soil: Arc<Soil>,
        artifacts: ArtifactLoader,
        webhook_server: Arc<WebhookServer>,
        tempo_hz: f64,
    ) -> Self {
        Self {
            wind,
            river,
            humus,
            soil,
            artifacts,
            webhook_server,
            tempo_hz,
            asker_override: None,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            webhook_rate: DEFAULT_WEBHOOK_RATE,
        }
    }
}

/// Summary of one reload diff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReloadOutcome {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

/// Owns component lifecycles and subscription handles; nothing else touches
/// them.
pub struct Supervisor {
    context: SupervisorContext,
    table: DescriptorTable,
    songbirds: Mutex<HashMap<String, Arc<dyn Songbird>>>,
    running: AtomicBool,
    weak_self: Weak<Supervisor>,
}

/// Automator handed to Nims: holds the supervisor weakly so stopped
/// supervisors drop cleanly.
struct WeakAutomator {
    supervisor: Weak<Supervisor>,
}

#[async_trait]
impl Automator for WeakAutomator {
    async fn submit(&self, descriptor: ComponentDescriptor) -> Result<(), ForestError> {
        let supervisor = self.supervisor.upgrade().ok_or_else(|| {
            ForestError::fail_with_kind(ErrorKind::Cancelled, "supervisor is gone")
        })?;
        supervisor.add(descriptor).await
    }

    async fn withdraw(&self, kind: ComponentKind, name: &str) -> Result<(), ForestError> {
        let supervisor = self.supervisor.upgrade().ok_or_else(|| {
            ForestError::fail_with_kind(ErrorKind::Cancelled, "supervisor is gone")
        })?;
        supervisor.remove(kind, name).await
    }
}

impl Supervisor {
    pub fn new(context: SupervisorContext) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            context,
            table: DescriptorTable::new(),
            songbirds: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            weak_self: weak.clone(),
        })
    }

    /// Registers an externally built Songbird implementation (Telegram,
    /// Slack, ...) under a name Nim agents can reference.
    pub async fn register_songbird(&self, name: &str, bird: Arc<dyn Songbird>) {
        self.songbirds.lock().await.insert(name.to_string(), bird);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Vec<ComponentStatus> {
        self.table.status()
    }

    pub async fn descriptors(&self, kind: ComponentKind) -> Vec<ComponentDescriptor> {
        self.table.descriptors(kind).await
    }

    /// Validates, registers, and starts one component. A start failure
    /// leaves the entry in `Stopped` with the error recorded and surfaces
    /// the error to the caller; other components are unaffected.
    pub async fn add(&self, descriptor: ComponentDescriptor) -> Result<(), ForestError> {
        descriptor.validate()?;
        let kind = descriptor.kind();
        let name = descriptor.name.clone();
        self.table.reserve(descriptor.clone()).await?;
        self.table
            .update(kind, &name, ComponentState::Starting, None, None)
            .await;

        match self.start_component(&descriptor).await {
            Ok(runner) => {
                self.table
                    .update(kind, &name, ComponentState::Running, None, Some(runner))
                    .await;
                info!("{SUPERVISOR_TAG}{SUPERVISOR_FN_ADD_TAG} {kind} {name:?} running");
                Ok(())
            }
            Err(err) => {
                self.table
                    .update(
                        kind,
                        &name,
                        ComponentState::Stopped,
                        Some(err.to_string()),
                        None,
                    )
                    .await;
                warn!("{SUPERVISOR_TAG}{SUPERVISOR_FN_ADD_TAG} {kind} {name:?} failed: {err}");
                Err(err)
            }
        }
    }

    /// Stops, drains, and unregisters one component.
    pub async fn remove(&self, kind: ComponentKind, name: &str) -> Result<(), ForestError> {
        let mut entry = self.table.take(kind, name).await?;
        self.table_stop(&mut entry.runner).await;
        if kind == ComponentKind::Songbird {
            self.songbirds.lock().await.remove(name);
        }
        debug!("{SUPERVISOR_TAG} removed {kind} {name:?}");
        Ok(())
    }

    async fn table_stop(&self, runner: &mut Option<RunningComponent>) {
        if let Some(runner) = runner.take() {
            runner.stop().await;
        }
    }

    /// Starts every component of a freshly loaded config, producers last.
    /// Individual start failures are recorded and do not stop the load.
    pub async fn load(&self, config: &ForestConfig) {
        for descriptor in config.descriptors() {
            let kind = descriptor.kind();
            let name = descriptor.name.clone();
            if let Err(err) = self.add(descriptor).await {
                warn!("{SUPERVISOR_TAG} {kind} {name:?} not started: {err}");
            }
        }
    }

    /// Diffs the descriptor table against `config`: obsolete components are
    /// removed, changed ones restarted, new ones added, in that order.
    pub async fn reload(&self, config: &ForestConfig) -> Result<ReloadOutcome, ForestError> {
        let desired = config.descriptors();
        let desired_keys: HashSet<(ComponentKind, String)> = desired
            .iter()
            .map(|descriptor| (descriptor.kind(), descriptor.name.clone()))
            .collect();

        let current: Vec<(ComponentKind, String, ComponentDescriptor)> = {
            let entries = self.table.entries().await;
            entries
                .iter()
                .map(|((kind, name), entry)| (*kind, name.clone(), entry.descriptor.clone()))
                .collect()
        };

        let mut outcome = ReloadOutcome::default();

        for (kind, name, _) in &current {
            if !desired_keys.contains(&(*kind, name.clone())) {
                self.remove(*kind, name).await?;
                outcome.removed += 1;
            }
        }

        let current_map: HashMap<(ComponentKind, String), ComponentDescriptor> = current
            .into_iter()
            .map(|(kind, name, descriptor)| ((kind, name), descriptor))
            .collect();

        // Every changed component restarts before any new one starts.
        for descriptor in &desired {
            let key = (descriptor.kind(), descriptor.name.clone());
            let Some(existing) = current_map.get(&key) else {
                continue;
            };
            if existing == descriptor {
                continue;
            }
            self.remove(key.0, &key.1).await?;
            if let Err(err) = self.add(descriptor.clone()).await {
                warn!(
                    "{SUPERVISOR_TAG}{SUPERVISOR_FN_RELOAD_TAG} {} {:?} restart failed: {err}",
                    key.0, key.1
                );
            }
            outcome.changed += 1;
        }

        for descriptor in &desired {
            let key = (descriptor.kind(), descriptor.name.clone());
            if current_map.contains_key(&key) {
                continue;
            }
            if let Err(err) = self.add(descriptor.clone()).await {
                warn!(
                    "{SUPERVISOR_TAG}{SUPERVISOR_FN_RELOAD_TAG} {} {:?} add failed: {err}",
                    key.0, key.1
                );
            }
            outcome.added += 1;
        }

        info!(
            "{SUPERVISOR_TAG}{SUPERVISOR_FN_RELOAD_TAG} added {}, removed {}, changed {}",
            outcome.added, outcome.removed, outcome.changed
        );
        Ok(outcome)
    }

    /// Stops everything, producers first, within the drain deadline. After
    /// this returns no component handler is invoked for new traffic.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let drain = async {
            // Sources first so nothing keeps producing into a draining forest.
            for kind in [
                ComponentKind::Source,
                ComponentKind::Nim,
                ComponentKind::TreeHouse,
                ComponentKind::Tree,
                ComponentKind::Songbird,
            ] {
                let names: Vec<String> = {
                    let entries = self.table.entries().await;
                    entries
                        .keys()
                        .filter(|(entry_kind, _)| *entry_kind == kind)
                        .map(|(_, name)| name.clone())
                        .collect()
                };
                for name in names {
                    if let Err(err) = self.remove(kind, &name).await {
                        warn!("{SUPERVISOR_TAG}{SUPERVISOR_FN_STOP_TAG} {kind} {name:?}: {err}");
                    }
                }
            }
        };
        if tokio::time::timeout(self.context.drain_deadline, drain)
            .await
            .is_err()
        {
            warn!(
                "{SUPERVISOR_TAG}{SUPERVISOR_FN_STOP_TAG} drain exceeded {:?}, abandoning",
                self.context.drain_deadline
            );
        }
    }

    async fn start_component(
        &self,
        descriptor: &ComponentDescriptor,
    ) -> Result<RunningComponent, ForestError> {
        match &descriptor.spec {
            ComponentSpec::Tree(spec) => {
                let script = self.context.artifacts.load_script(&spec.script)?;
                let tree = Tree::start(
                    &descriptor.name,
                    &spec.watches,
                    &spec.publishes,
                    script,
                    &self.context.river,
                    self.context.wind.clone(),
                )
                .await?;
                Ok(RunningComponent::Tree(tree))
            }
            ComponentSpec::TreeHouse(spec) => {
                let script = self.context.artifacts.load_script(&spec.script)?;
                let treehouse = TreeHouse::start(
                    &descriptor.name,
                    &spec.subscribes,
                    &spec.publishes,
                    script,
                    self.context.wind.clone(),
                )
                .await?;
                Ok(RunningComponent::TreeHouse(treehouse))
            }
            ComponentSpec::Nim(spec) => {
                let prompt = self.context.artifacts.load_prompt(&spec.prompt)?;
                let asker: Arc<dyn AiAsker> = match &self.context.asker_override {
                    Some(asker) => asker.clone(),
                    None => {
                        let brain = spec.brain.as_ref().ok_or_else(|| {
                            ForestError::fail_with_kind(
                                ErrorKind::ConfigInvalid,
                                format!("nim {:?} has no brain configured", descriptor.name),
                            )
                        })?;
                        Arc::new(HttpAsker::new(
                            brain.clone(),
                            spec.model.clone(),
                            std::env::var("FOREST_BRAIN_API_KEY").ok(),
                        ))
                    }
                };
                let nim_context = NimContext {
                    wind: self.context.wind.clone(),
                    humus: self.context.humus.clone(),
                    asker,
                    songbirds: self.songbirds.lock().await.clone(),
                    automator: Some(Arc::new(WeakAutomator {
                        supervisor: self.weak_self.clone(),
                    })),
                };
                let nim = Nim::start(
                    &descriptor.name,
                    &spec.subscribes,
                    spec.publishes.clone(),
                    prompt,
                    spec.agents.clone().into_iter().collect(),
                    nim_context,
                )
                .await?;
                Ok(RunningComponent::Nim(nim))
            }
            ComponentSpec::Source(spec) => {
                let source = self.build_source(&descriptor.name, spec)?;
                source.start().await?;
                Ok(RunningComponent::Source(source))
            }
            ComponentSpec::Songbird(spec) => {
                let bird: Arc<dyn Songbird> = match spec {
                    SongbirdSpec::Tracing => Arc::new(TracingSongbird),
                };
                self.songbirds
                    .lock()
                    .await
                    .insert(descriptor.name.clone(), bird.clone());
                Ok(RunningComponent::Songbird(bird))
            }
        }
    }

    fn build_source(
        &self,
        name: &str,
        spec: &SourceSpec,
    ) -> Result<Arc<dyn Source>, ForestError> {
        match spec {
            SourceSpec::HttpWebhook {
                path,
                publishes,
                verifier,
                secret,
                include_headers,
            } => Ok(Arc::new(HttpWebhookSource::new(
                name,
                path,
                publishes,
                verifier.clone(),
                secret.clone(),
                include_headers.clone(),
                self.context.webhook_rate.0,
                self.context.webhook_rate.1,
                self.context.river.clone(),
                self.context.webhook_server.clone(),
            ))),
            SourceSpec::HttpPoll {
                url,
                publishes,
                interval,
                method,
                headers,
                cursor,
            } => Ok(Arc::new(HttpPollSource::new(
                name,
                url,
                method,
                headers.clone(),
                Duration::from_secs_f64(*interval),
                publishes,
                cursor.clone(),
                self.context.river.clone(),
                self.context.soil.clone(),
                self.context.humus.clone(),
            ))),
            SourceSpec::Ceremony {
                interval,
                publishes,
                payload,
                script,
            } => {
                let payload = match (payload, script) {
                    (Some(value), None) => CeremonyPayload::Static(value.clone()),
                    (None, Some(script_ref)) => {
                        CeremonyPayload::Script(self.context.artifacts.load_script(script_ref)?)
                    }
                    _ => {
                        return Err(ForestError::fail_with_kind(
                            ErrorKind::ConfigInvalid,
                            "ceremony requires exactly one of payload or script",
                        ))
                    }
                };
                Ok(Arc::new(CeremonySource::new(
                    name,
                    Duration::from_secs_f64(*interval),
                    self.context.tempo_hz,
                    publishes,
                    payload,
                    self.context.river.clone(),
                    self.context.wind.clone(),
                )))
            }
        }
    }
}
