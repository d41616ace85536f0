use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use docflow::{Extractor, Gateway, NullExtractor, Orchestrator, Services, TaskMetrics};
use fetch::SafeFetcher;
use guard::UrlGuard;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use store::{BackendConfig, IdempotencyStore, ResultStore, StoreBackend};
use webhook::WebhookDispatcher;

/// Outbound collaborators the job system runs against.
pub struct Components {
    pub guard: UrlGuard,
    pub fetcher: SafeFetcher,
    pub webhooks: WebhookDispatcher,
    pub extractor: Arc<dyn Extractor>,
    pub metrics: Arc<TaskMetrics>,
}

impl Components {
    /// Production wiring: system DNS, default HTTP clients, no model.
    pub fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        let guard = UrlGuard::new(&config.guard_config());
        let fetcher = SafeFetcher::new(guard.clone(), config.download_policy())
            .map_err(|e| ServerError::Config(format!("download client: {e}")))?;
        let webhooks = WebhookDispatcher::new(guard.clone(), config.webhook_config())
            .map_err(|e| ServerError::Config(format!("webhook client: {e}")))?;

        Ok(Self {
            guard,
            fetcher,
            webhooks,
            extractor: Arc::new(NullExtractor),
            metrics: TaskMetrics::global(),
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct ServerState {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// Worker pool, task handlers and the gateway in front of them
    pub orchestrator: Arc<Orchestrator>,

    /// Renderer for counters emitted through the `metrics` facade
    pub prometheus: Option<PrometheusHandle>,
}

impl ServerState {
    /// Create new server state. Starts the worker pool, so it must run
    /// inside a tokio runtime.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let components = Components::from_config(&config)?;
        Self::with_components(config, components)
    }

    pub fn with_components(config: ServerConfig, components: Components) -> ServerResult<Self> {
        config
            .jobs
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let backend_config = match &config.result_store_path {
            Some(path) => BackendConfig::redb(path.clone()),
            None => BackendConfig::in_memory(),
        };
        let backend: Arc<dyn StoreBackend> = Arc::from(backend_config.build()?);

        let ttl = config.jobs.result_ttl();
        let results = ResultStore::new(Arc::clone(&backend), ttl);
        let idempotency = IdempotencyStore::new(backend, ttl);

        let services = Services {
            fetcher: Arc::new(components.fetcher),
            extractor: components.extractor,
            results,
            webhooks: Arc::new(components.webhooks),
            metrics: components.metrics,
        };

        let orchestrator = Orchestrator::start(
            config.jobs.clone(),
            config.queue_config(),
            components.guard,
            services,
            idempotency,
        )
        .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            prometheus: None,
        })
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn gateway(&self) -> &Gateway {
        self.orchestrator.gateway()
    }
}
