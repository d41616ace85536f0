//! Wiring of the queue, the task handlers and the gateway.

use std::sync::Arc;
use std::time::Duration;

use fetch::SafeFetcher;
use guard::UrlGuard;
use queue::{InMemoryQueue, QueueConfig, TaskRegistry};
use store::{IdempotencyStore, ResultStore};
use tracing::{debug, warn};
use webhook::WebhookDispatcher;

use crate::batch::FinalizeBatch;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::extractor::Extractor;
use crate::gateway::Gateway;
use crate::jobs::ExtractDocument;
use crate::metrics::TaskMetrics;

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Collaborators the task handlers run against.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<SafeFetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub results: ResultStore,
    pub webhooks: Arc<WebhookDispatcher>,
    pub metrics: Arc<TaskMetrics>,
}

/// Registry with the extraction and batch finalization handlers.
pub fn task_registry(services: &Services, config: &OrchestratorConfig) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(ExtractDocument::new(services.clone(), config));
    registry.register(FinalizeBatch::new(services.clone(), config));
    registry
}

/// A running job system: worker pool plus the gateway in front of it.
pub struct Orchestrator {
    gateway: Gateway,
    queue: InMemoryQueue,
    services: Services,
}

impl Orchestrator {
    /// Start the worker pool and a periodic purge of expired results. Must be
    /// called inside a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        queue_config: QueueConfig,
        guard: UrlGuard,
        services: Services,
        idempotency: IdempotencyStore,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let queue = InMemoryQueue::start(task_registry(&services, &config), queue_config);
        let gateway = Gateway::new(
            Arc::new(queue.clone()),
            guard,
            idempotency,
            services.results.clone(),
            Arc::clone(&services.metrics),
            config,
        );
        tokio::spawn(purge_loop(queue.clone(), services.results.clone()));

        Ok(Self {
            gateway,
            queue,
            services,
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn queue(&self) -> &InMemoryQueue {
        &self.queue
    }

    pub fn results(&self) -> &ResultStore {
        &self.services.results
    }

    pub fn metrics(&self) -> &Arc<TaskMetrics> {
        &self.services.metrics
    }

    /// Stop the worker pool. In-flight tasks finish their current attempt.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

async fn purge_loop(queue: InMemoryQueue, results: ResultStore) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    interval.tick().await;
    while !queue.is_shutting_down() {
        interval.tick().await;
        match results.purge_expired() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired_results_purged"),
            Err(err) => warn!(error = %err, "result_purge_failed"),
        }
    }
}
