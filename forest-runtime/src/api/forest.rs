//! The outward [`Forest`] handle: construction, startup, shutdown.

use crate::cluster::{bootstrap, load_node_descriptor, ClusterHandle};
use crate::control_plane::config::load_config;
use crate::control_plane::management::management_router;
use crate::control_plane::supervisor::{Supervisor, SupervisorContext};
use crate::data_plane::decomposer::Decomposer;
use crate::data_plane::humus::Humus;
use crate::data_plane::river::River;
use crate::data_plane::soil::Soil;
use crate::data_plane::stream::StreamConfig;
use crate::data_plane::wind::Wind;
use crate::runtime::artifact::ArtifactLoader;
use crate::runtime::asker::AiAsker;
use crate::runtime::ceremony::{Conductor, DEFAULT_TEMPO_HZ};
use crate::runtime::webhook::WebhookServer;
use crate::status::ForestError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const FOREST_TAG: &str = "Forest:";

/// Everything configurable about one node's runtime.
pub struct ForestOptions {
    /// Bus data directory holding the RIVER and HUMUS streams and the SOIL
    /// bucket.
    pub data_dir: PathBuf,
    /// Base directory for script and prompt artifacts.
    pub artifact_dir: PathBuf,
    /// Per-subscription Wind queue depth.
    pub wind_queue_size: usize,
    /// Redelivery timeout for unacknowledged stream records.
    pub ack_wait: Duration,
    /// Stream retention bounds: whichever trips first evicts.
    pub retention_max_age: Duration,
    pub retention_max_bytes: u64,
    /// Conductor tempo; also sizes ceremony beat budgets.
    pub tempo_hz: f64,
    /// Whether this node runs the conductor. Exactly one node per forest
    /// should.
    pub conduct: bool,
    /// Node descriptor path; an absent file means standalone.
    pub node_descriptor: Option<PathBuf>,
    /// Declarative component config, loaded at start and re-read on reload.
    pub config_path: Option<PathBuf>,
    /// Test seam: overrides every Nim's brain.
    pub asker_override: Option<Arc<dyn AiAsker>>,
}

impl ForestOptions {
    pub fn new(data_dir: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            artifact_dir: artifact_dir.into(),
            wind_queue_size: 256,
            ack_wait: Duration::from_secs(30),
            retention_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            retention_max_bytes: 10 * 1024 * 1024 * 1024,
            tempo_hz: DEFAULT_TEMPO_HZ,
            conduct: true,
            node_descriptor: None,
            config_path: None,
            asker_override: None,
        }
    }
}

/// One running forest node.
pub struct Forest {
    wind: Arc<Wind>,
    river: Arc<River>,
    humus: Arc<Humus>,
    soil: Arc<Soil>,
    decomposer: Decomposer,
    supervisor: Arc<Supervisor>,
    webhook_server: Arc<WebhookServer>,
    conductor: Option<Conductor>,
    cluster: ClusterHandle,
    config_path: Option<PathBuf>,
}

impl Forest {
    /// Brings the node up: cluster membership first (replication depends on
    /// the peer count), then the substrate, the reconciliation worker, the
    /// supervisor with its config, and finally the conductor.
    pub async fn start(options: ForestOptions) -> Result<Self, ForestError> {
        let node = match &options.node_descriptor {
            Some(path) => load_node_descriptor(path)?,
            None => None,
        };

        let wind = Arc::new(Wind::new(options.wind_queue_size));
        let cluster = bootstrap(node, wind.clone()).await?;

        let mut stream_config = StreamConfig::new("", "");
        stream_config.ack_wait = options.ack_wait;
        stream_config.max_age = options.retention_max_age;
        stream_config.max_bytes = options.retention_max_bytes;
        stream_config.replicas = cluster.replicas;

        let river = River::open(&options.data_dir, stream_config.clone()).await?;
        let humus = Humus::open(&options.data_dir, stream_config).await?;
        let soil = Soil::open(options.data_dir.join("SOIL")).await?;

        let decomposer = Decomposer::new(humus.clone(), soil.clone());
        decomposer.start().await?;

        let webhook_server = Arc::new(WebhookServer::new());
        let mut context = SupervisorContext::new(
            wind.clone(),
            river.clone(),
            humus.clone(),
            soil.clone(),
            ArtifactLoader::new(&options.artifact_dir),
            webhook_server.clone(),
            options.tempo_hz,
        );
        context.asker_override = options.asker_override.clone();
        let supervisor = Supervisor::new(context);

        if let Some(config_path) = &options.config_path {
            let config = load_config(config_path)?;
            supervisor.load(&config).await;
        }

        let conductor = if options.conduct {
            let conductor = Conductor::new(wind.clone(), options.tempo_hz);
            conductor.start().await;
            Some(conductor)
        } else {
            None
        };

        info!(
            "{FOREST_TAG} node {:?} up with {} peers",
            cluster.node_id, cluster.peer_count
        );
        Ok(Self {
            wind,
            river,
            humus,
            soil,
            decomposer,
            supervisor,
            webhook_server,
            conductor,
            cluster,
            config_path: options.config_path,
        })
    }

    pub fn wind(&self) -> &Arc<Wind> {
        &self.wind
    }

    pub fn river(&self) -> &Arc<River> {
        &self.river
    }

    pub fn humus(&self) -> &Arc<Humus> {
        &self.humus
    }

    pub fn soil(&self) -> &Arc<Soil> {
        &self.soil
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Router for the loopback management API.
    pub fn management_router(&self) -> axum::Router {
        management_router(self.supervisor.clone(), self.config_path.clone())
    }

    /// Router for the webhook surface, bound separately from management.
    pub fn webhook_router(&self) -> axum::Router {
        self.webhook_server.router()
    }

    /// Ordered drain: producers stop first, then components, then the
    /// reconciliation worker, the conductor, the bus, and the peer fabric.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
        if let Some(conductor) = &self.conductor {
            conductor.stop().await;
        }
        self.decomposer.stop().await;
        self.wind.shutdown().await;
        self.cluster.shutdown().await;
        info!("{FOREST_TAG} node stopped");
    }
}
