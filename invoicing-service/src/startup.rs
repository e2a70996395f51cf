//! Application startup and lifecycle management.
//!
//! Wires the store, broker, cache and realtime publisher into the core
//! services, starts the consumers and the retry sweep, and serves the HTTP
//! adapter until shutdown.

use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::messaging::{ConsumerSettings, MessageBroker, QueueConsumer, RedisBroker};
use service_core::middleware::request_context_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{InvoicingServiceConfig, QueueConfig, RetryConfig, SoftpymesConfig};
use crate::error::InvoicingError;
use crate::handlers;
use crate::middleware::metrics_middleware;
use crate::services::{
    BulkService, CompareService, ConfigCache, ConfigService, Database, Dispatcher,
    DomainEventPublisher, EventPublisher, InvoicingService, InvoicingStore, NoopConfigCache,
    NoopEventPublisher, RedisConfigCache, RedisEventPublisher, ResponseReconciler, RetryScheduler,
    SoftpymesClient,
};
use crate::workers::{BulkWorker, OrderEventHandler, ResponseHandler};

/// Shared state of the HTTP adapter.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InvoicingStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub configs: ConfigService,
    pub invoicing: InvoicingService,
    pub bulk: BulkService,
    pub compare: CompareService,
    pub softpymes: SoftpymesClient,
}

/// The core services built over one set of adapters.
#[derive(Clone)]
pub struct Components {
    pub state: AppState,
    pub reconciler: ResponseReconciler,
    pub queues: QueueConfig,
}

impl Components {
    pub fn assemble(
        store: Arc<dyn InvoicingStore>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn ConfigCache>,
        realtime: Arc<dyn EventPublisher>,
        queues: QueueConfig,
        softpymes: SoftpymesConfig,
    ) -> Result<Self, InvoicingError> {
        let configs = ConfigService::new(store.clone(), cache);
        let dispatcher = Dispatcher::new(broker.clone(), queues.requests.clone());
        let domain_events = DomainEventPublisher::new(broker.clone(), queues.domain_events.clone());

        let invoicing = InvoicingService::new(
            store.clone(),
            configs.clone(),
            dispatcher.clone(),
            realtime.clone(),
            domain_events.clone(),
        );
        let bulk = BulkService::new(
            store.clone(),
            invoicing.clone(),
            broker.clone(),
            queues.bulk_create.clone(),
            realtime.clone(),
        );
        let compare = CompareService::new(store.clone(), configs.clone(), dispatcher, realtime.clone());
        let reconciler = ResponseReconciler::new(
            store.clone(),
            invoicing.clone(),
            bulk.clone(),
            compare.clone(),
            realtime,
            domain_events,
        );

        Ok(Self {
            state: AppState {
                store,
                broker,
                configs,
                invoicing,
                bulk,
                compare,
                softpymes: SoftpymesClient::new(softpymes)?,
            },
            reconciler,
            queues,
        })
    }

    /// Retry budget for configs created over HTTP without one.
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.state.configs = self.state.configs.with_default_max_retries(max_retries);
        self
    }

    pub fn retry_scheduler(&self, config: RetryConfig) -> RetryScheduler {
        RetryScheduler::new(
            self.state.store.clone(),
            self.state.invoicing.clone(),
            config,
        )
    }

    /// Start one consumer per inbound queue.
    pub fn spawn_consumers(
        &self,
        settings: ConsumerSettings,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let broker = &self.state.broker;
        let consumers = [
            QueueConsumer::new(
                "order_events",
                self.queues.order_events.clone(),
                broker.clone(),
                Arc::new(OrderEventHandler::new(self.state.invoicing.clone())),
                settings.clone(),
                shutdown.clone(),
            ),
            QueueConsumer::new(
                "responses",
                self.queues.responses.clone(),
                broker.clone(),
                Arc::new(ResponseHandler::new(self.reconciler.clone())),
                settings.clone(),
                shutdown.clone(),
            ),
            QueueConsumer::new(
                "bulk_create",
                self.queues.bulk_create.clone(),
                broker.clone(),
                Arc::new(BulkWorker::new(self.state.bulk.clone())),
                settings,
                shutdown.clone(),
            ),
        ];
        consumers
            .into_iter()
            .map(|consumer| tokio::spawn(consumer.run()))
            .collect()
    }
}

/// The HTTP adapter: `/health`, `/ready` and `/metrics` at the root, the
/// invoicing API under `/api/v1/invoicing`.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route(
            "/invoices",
            post(handlers::invoices::create_invoice).get(handlers::invoices::list_invoices),
        )
        .route("/invoices/bulk", post(handlers::bulk::create_bulk))
        .route("/invoices/:id", get(handlers::invoices::get_invoice))
        .route("/invoices/:id/cancel", post(handlers::invoices::cancel_invoice))
        .route("/invoices/:id/retry", post(handlers::invoices::retry_invoice))
        .route(
            "/invoices/:id/credit-notes",
            post(handlers::invoices::create_credit_note),
        )
        .route("/invoices/:id/sync-logs", get(handlers::invoices::sync_logs))
        .route("/bulk-jobs", get(handlers::bulk::list_jobs))
        .route("/bulk-jobs/:id", get(handlers::bulk::get_job))
        .route(
            "/configs",
            post(handlers::configs::create_config).get(handlers::configs::list_configs),
        )
        .route(
            "/configs/:id",
            get(handlers::configs::get_config)
                .put(handlers::configs::update_config)
                .delete(handlers::configs::delete_config),
        )
        .route("/configs/:id/enable", post(handlers::configs::enable_config))
        .route("/configs/:id/disable", post(handlers::configs::disable_config))
        .route(
            "/configs/:id/auto-invoice",
            post(handlers::configs::set_auto_invoice),
        )
        .route("/compare", post(handlers::compare::request_comparison))
        .route("/summary", get(handlers::reports::summary))
        .route("/stats", get(handlers::reports::stats))
        .route("/trends", get(handlers::reports::trends))
        .route(
            "/providers/softpymes/test-connection",
            post(handlers::providers::test_softpymes_connection),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1/invoicing", api)
        .route_layer(from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    components: Components,
    config: InvoicingServiceConfig,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Application {
    /// Connect every adapter and bind the HTTP listener.
    pub async fn build(config: InvoicingServiceConfig) -> Result<Self, AppError> {
        let database = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        database.run_migrations().await?;
        let store: Arc<dyn InvoicingStore> = Arc::new(database);

        let broker: Arc<dyn MessageBroker> = Arc::new(RedisBroker::connect(&config.redis.url).await?);

        let cache: Arc<dyn ConfigCache> = match RedisConfigCache::connect(&config.redis).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::warn!(error = %e, "Config cache unavailable, reading configs from the store");
                Arc::new(NoopConfigCache)
            }
        };

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();
        let realtime: Arc<dyn EventPublisher> = match RedisEventPublisher::connect(
            &config.redis.url,
            &config.redis.events_channel,
            shutdown.clone(),
        )
        .await
        {
            Ok((publisher, task)) => {
                background.push(task);
                Arc::new(publisher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Realtime publisher unavailable, events will be dropped");
                Arc::new(NoopEventPublisher)
            }
        };

        let components = Components::assemble(
            store,
            broker,
            cache,
            realtime,
            config.queues.clone(),
            config.softpymes.clone(),
        )
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to assemble services: {}", e)))?
        .with_default_max_retries(config.retry.default_max_retries);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!(port, "Invoicing service listening");

        Ok(Self {
            port,
            listener,
            components,
            config,
            shutdown,
            background,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.components.state.clone()
    }

    /// Serve until `signal` resolves, then stop the background tasks.
    pub async fn run_until_stopped<F>(self, signal: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            listener,
            components,
            config,
            shutdown,
            mut background,
            ..
        } = self;

        background.push(components.state.configs.spawn_warm_up());
        background.extend(components.spawn_consumers(
            ConsumerSettings {
                prefetch: config.consumer.prefetch,
                poll_interval: config.consumer.poll_interval,
            },
            &shutdown,
        ));
        background.push(tokio::spawn(
            components
                .retry_scheduler(config.retry.clone())
                .run(shutdown.clone()),
        ));

        let app = router(
            components.state.clone(),
            Duration::from_secs(config.common.request_timeout_secs),
        );
        let token = shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                token.cancel();
            })
            .await;

        shutdown.cancel();
        for task in background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Invoicing service stopped");

        served.map_err(AppError::from)
    }
}
