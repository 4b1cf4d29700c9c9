//! Assembles a gateway node from [`GatewayConfig`].

use crate::config::OrchestratorConfig;
use crate::orchestrator::StreamOrchestrator;
use crate::sink::EventStream;
use gateway_config::{GatewayConfig, ProviderKind, ProviderSettings};
use gateway_core::{GatewayError, Provider, StreamRequest};
use gateway_failover::{FailoverConfig, QueueProducer, QueueWorker, WorkerPool, WorkerStatsSnapshot};
use gateway_providers::{ProviderRegistry, SyntheticConfig, SyntheticProvider};
use gateway_resilience::{
    CacheConfig, CacheManager, CircuitBreakerConfig, CircuitBreakerManager, ConnectionPoolManager,
    PoolConfig, RateLimit, RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy, TimeoutConfig,
    TimeoutManager,
};
use gateway_routing::BackendDispatcher;
use gateway_store::{KeySpace, MemoryStore, SharedStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds a [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn SharedStore>>,
    providers: Vec<(Arc<dyn Provider>, u32)>,
}

impl GatewayBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            providers: Vec::new(),
        }
    }

    /// Use this store instead of a private in-process one
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an already constructed backend next to the configured ones
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>, priority: u32) -> Self {
        self.providers.push((provider, priority));
        self
    }

    /// Wire every component. Nothing is spawned until [`Gateway::start`].
    ///
    /// # Errors
    /// Returns a validation error when no backend is registered
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>);
        let keys = KeySpace::new(config.node.key_prefix.clone());
        let instance_id = config
            .node
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

        let registry = Arc::new(ProviderRegistry::new());
        for settings in config.enabled_providers() {
            register_configured(&registry, settings);
        }
        for (provider, priority) in self.providers {
            registry.register(provider, priority);
        }
        if registry.is_empty() {
            return Err(GatewayError::validation(
                "no backend providers registered",
                Some("providers".to_string()),
                "no_providers",
            ));
        }

        let timeouts = timeout_config(&config);
        let breakers = Arc::new(CircuitBreakerManager::new(
            breaker_config(&config),
            Arc::clone(&store),
            keys.clone(),
        ));
        let dispatcher = Arc::new(BackendDispatcher::new(
            Arc::clone(&registry),
            breakers,
            RetryPolicy::new(retry_config(&config)),
            TimeoutManager::new(timeouts.clone()),
        ));
        let cache = Arc::new(CacheManager::new(
            cache_config(&config),
            Arc::clone(&store),
            keys.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            rate_limiter_config(&config),
            Arc::clone(&store),
            keys.clone(),
        ));
        let pool = Arc::new(ConnectionPoolManager::new(
            pool_config(&config),
            Arc::clone(&store),
            keys.clone(),
        ));

        let failover = failover_config(&config);
        let (producer, worker) = if config.queue.enabled {
            let producer = QueueProducer::new(Arc::clone(&store), keys.clone(), failover.clone());
            let worker = QueueWorker::new(
                Arc::clone(&store),
                keys,
                failover,
                Arc::clone(&pool),
                Arc::clone(&dispatcher),
                Arc::clone(&cache),
            )
            .with_worker_id(format!("{instance_id}-worker"));
            (Some(producer), Some(worker))
        } else {
            (None, None)
        };

        let orchestrator = Arc::new(StreamOrchestrator::new(
            OrchestratorConfig::default()
                .with_queue_failover(config.queue.enabled)
                .with_timeouts(timeouts),
            cache,
            rate_limiter,
            pool,
            dispatcher,
            producer,
        ));

        info!(
            instance_id = %instance_id,
            providers = registry.len(),
            queue_failover = config.queue.enabled,
            global_capacity = config.pool.global_capacity,
            "Gateway built"
        );

        Ok(Gateway {
            instance_id,
            config,
            store,
            registry,
            orchestrator,
            worker,
            workers: None,
            janitors: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }
}

fn register_configured(registry: &ProviderRegistry, settings: &ProviderSettings) {
    match settings.kind {
        ProviderKind::Synthetic => {
            let id = settings.id.clone();
            let synthetic = SyntheticConfig::default()
                .with_chunk_delay(settings.synthetic.chunk_delay)
                .with_words_per_chunk(settings.synthetic.words_per_chunk)
                .with_failure_rate(settings.synthetic.failure_rate)
                .with_models(settings.models.clone());
            registry.register_factory(
                settings.id.clone(),
                settings.priority,
                settings.models.clone(),
                move || {
                    Ok(Arc::new(SyntheticProvider::new(id.clone(), synthetic.clone()))
                        as Arc<dyn Provider>)
                },
            );
        }
    }
}

fn cache_config(config: &GatewayConfig) -> CacheConfig {
    CacheConfig::default()
        .with_enabled(config.cache.enabled)
        .with_local_capacity(config.cache.local_capacity)
        .with_local_ttl(config.cache.local_ttl)
        .with_default_ttl(config.cache.response_ttl)
}

fn rate_limiter_config(config: &GatewayConfig) -> RateLimiterConfig {
    let settings = &config.rate_limit;
    RateLimiterConfig {
        enabled: settings.enabled,
        sync_interval: settings.sync_interval,
        high_water_ratio: settings.high_water_ratio,
        idle_eviction: settings.idle_eviction,
        authenticated: RateLimit::new(settings.authenticated.limit, settings.authenticated.window),
        anonymous: RateLimit::new(settings.anonymous.limit, settings.anonymous.window),
        ..RateLimiterConfig::default()
    }
}

fn pool_config(config: &GatewayConfig) -> PoolConfig {
    PoolConfig::default()
        .with_global_capacity(config.pool.global_capacity)
        .with_per_identity_capacity(config.pool.per_identity_capacity)
        .with_slot_ttl(config.pool.slot_ttl)
        .with_reconcile_interval(config.pool.reconcile_interval)
}

fn breaker_config(config: &GatewayConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(config.breaker.failure_threshold)
        .with_recovery_timeout(config.breaker.recovery_timeout)
        .with_failure_ttl(config.breaker.failure_ttl)
}

fn retry_config(config: &GatewayConfig) -> RetryConfig {
    RetryConfig {
        max_attempts: config.retry.max_attempts,
        base_delay: config.retry.base_delay,
        max_delay: config.retry.max_delay,
        jitter: config.retry.jitter,
        ..RetryConfig::default()
    }
}

fn timeout_config(config: &GatewayConfig) -> TimeoutConfig {
    TimeoutConfig::default()
        .with_first_chunk(config.timeouts.first_chunk)
        .with_total(config.timeouts.total)
        .with_queue_wait(config.timeouts.queue_wait)
        .with_keepalive(config.timeouts.keepalive)
}

fn failover_config(config: &GatewayConfig) -> FailoverConfig {
    let queue = &config.queue;
    FailoverConfig::default()
        .with_queue_name(queue.name.clone())
        .with_workers(queue.workers)
        .with_read_batch(queue.read_batch)
        .with_poll_interval(queue.poll_interval)
        .with_visibility_timeout(queue.visibility_timeout)
        .with_chunk_batching(queue.chunk_batch_size, queue.chunk_flush_interval)
        .with_retry(RetryConfig {
            max_attempts: queue.max_attempts,
            base_delay: queue.backoff_base,
            max_delay: queue.backoff_max,
            ..RetryConfig::queue_worker()
        })
        .with_admission_wait(queue.admission_wait)
        .with_max_deliveries(queue.max_deliveries)
        .with_heartbeat_interval(queue.heartbeat_interval)
        .with_queue_wait(config.timeouts.queue_wait)
        .with_keepalive(config.timeouts.keepalive)
}

/// A gateway node: the request pipeline plus its background tasks
pub struct Gateway {
    instance_id: String,
    config: GatewayConfig,
    store: Arc<dyn SharedStore>,
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<StreamOrchestrator>,
    worker: Option<QueueWorker>,
    workers: Option<WorkerPool>,
    janitors: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Spawn the queue workers, the rate limiter janitor and the admission
    /// reconciler. Idempotent.
    pub fn start(&mut self) {
        if self.janitors.is_empty() {
            self.janitors.push(
                self.orchestrator
                    .rate_limiter()
                    .spawn_janitor(self.cancel.child_token()),
            );
            self.janitors.push(
                self.orchestrator
                    .pool()
                    .spawn_reconciler(self.cancel.child_token()),
            );
        }
        if self.workers.is_none() {
            if let Some(worker) = &self.worker {
                let count = worker.config().workers;
                if count > 0 {
                    self.workers = Some(WorkerPool::start(worker.clone(), count));
                }
            }
        }
        info!(instance_id = %self.instance_id, "Gateway started");
    }

    /// Run a request; see [`StreamOrchestrator::handle`]
    pub fn handle(&self, request: StreamRequest) -> EventStream {
        self.orchestrator.handle(request)
    }

    /// Instance id
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Configuration the gateway was built from
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Shared store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Backend registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Request pipeline
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<StreamOrchestrator> {
        &self.orchestrator
    }

    /// Queue worker template, when queue failover is enabled
    #[must_use]
    pub fn worker(&self) -> Option<&QueueWorker> {
        self.worker.as_ref()
    }

    /// Queue worker counters, when queue failover is enabled
    #[must_use]
    pub fn worker_stats(&self) -> Option<WorkerStatsSnapshot> {
        self.worker.as_ref().map(|w| w.stats().snapshot())
    }

    /// Stop background tasks; in-flight queue messages finish first
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
        for task in self.janitors.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
        info!(instance_id = %self.instance_id, "Gateway stopped");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("instance_id", &self.instance_id)
            .field("providers", &self.registry.len())
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
