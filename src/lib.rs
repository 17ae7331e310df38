//! # fanout: event ingestion and webhook fan-out
//!
//! `fanout` receives typed events over an HTTP API, persists them, matches
//! them against registered webhook subscriptions, and delivers each match
//! with HMAC signing, retries with backoff, per-endpoint health tracking,
//! and a dead-letter queue for deliveries that exhaust their budget.
//! Consumers can alternatively pull events with SQS-like visibility
//! timeouts or follow a real-time server-sent event stream.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); PostgreSQL
//! holds the authoritative rows (events, subscriptions, deliveries,
//! credentials) behind the repository types in [`db`], and Redis (the
//! "fast store", [`queue`]) carries the queues, idempotency cache, receipt
//! handles, rate-limit buckets, and the live-stream pub/sub topic.
//!
//! Three task families run concurrently:
//!
//! 1. **HTTP handlers** ([`api`]) — admission, reads, subscription
//!    management, pull-mode inbox, DLQ operations, SSE streaming.
//! 2. **Event processor** ([`processor`]) — scans pending events, asks the
//!    [`matcher`], and creates delivery rows.
//! 3. **Delivery dispatcher** ([`delivery`]) — claims due deliveries with
//!    `FOR UPDATE SKIP LOCKED`, signs payloads, POSTs them through a
//!    bounded sender pool, and advances the delivery state machine.
//!
//! Background services share a [`CancellationToken`]; shutdown stops the
//! claim loops, gives in-flight sends a bounded grace period, and lets
//! stale claims self-heal on the next start.

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info, instrument};

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod delivery;
pub mod dlq;
pub mod errors;
pub mod health;
pub mod inbox;
pub mod ingest;
pub mod limits;
pub mod matcher;
mod openapi;
pub mod processor;
pub mod queue;
pub mod stream;
pub mod telemetry;
pub mod types;

pub use config::Config;

use crate::db::handlers::ApiKeys;
use crate::db::models::api_keys::{ApiKeyCreateDBRequest, Scope};
use crate::delivery::WebhookDispatcher;
use crate::dlq::DlqService;
use crate::health::HealthService;
use crate::inbox::InboxService;
use crate::ingest::IngestService;
use crate::processor::EventProcessor;
use crate::queue::FastStore;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: FastStore,
    pub config: Config,
    pub ingest: IngestService,
    pub inbox: InboxService,
    pub dlq: DlqService,
    pub health: HealthService,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Get the database migrator (migrations are embedded at compile time).
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create a first admin-scoped API key when the credential table is empty.
///
/// The raw key is logged exactly once; only its salted hash is stored.
#[instrument(skip_all)]
pub async fn ensure_bootstrap_api_key(db: &PgPool, config: &Config) -> anyhow::Result<()> {
    let mut conn = db.acquire().await?;
    let mut repo = ApiKeys::new(&mut conn);

    if repo.count().await? > 0 {
        return Ok(());
    }

    let raw_key = auth::generate_api_key("live");
    let request = ApiKeyCreateDBRequest {
        id: types::api_key_id(),
        name: "bootstrap".to_string(),
        description: Some("created automatically on first startup".to_string()),
        key_hash: auth::hash_api_key(&raw_key, &config.server_secret),
        key_prefix: auth::key_prefix(&raw_key),
        environment: "live".to_string(),
        scopes: vec![Scope::Admin.as_str().to_string()],
        rate_limit: None,
        expires_at: None,
    };
    repo.create(&request).await?;

    tracing::warn!("bootstrap API key created: {raw_key} — store it now, it will not be shown again");
    Ok(())
}

/// Stamp every response with a request id.
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = types::generate_id("req");
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    if config.cors_allowed_origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::permissive());
    }

    let mut origins = Vec::new();
    for origin in &config.cors_allowed_origins {
        origins.push(origin.parse::<HeaderValue>().context("invalid CORS origin")?);
    }
    Ok(CorsLayer::new().allow_origin(origins))
}

/// Build the application router.
///
/// `/api/v1/*` sits behind authentication (innermost after it: the rate
/// limiter, so buckets key on the validated credential). Health and metrics
/// stay public for probes and scrapers.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    use api::handlers;

    let api_routes = Router::new()
        .route(
            "/events",
            post(handlers::events::create_event).get(handlers::events::list_events),
        )
        .route("/events/batch", post(handlers::events::create_events_batch))
        .route("/events/stream", get(handlers::events::stream_events))
        .route("/events/{id}", get(handlers::events::get_event))
        .route(
            "/events/{id}/deliveries",
            get(handlers::events::list_event_deliveries),
        )
        .route("/events/{id}/replay", post(handlers::events::replay_event))
        .route(
            "/subscriptions",
            post(handlers::subscriptions::create_subscription)
                .get(handlers::subscriptions::list_subscriptions),
        )
        .route(
            "/subscriptions/{id}",
            get(handlers::subscriptions::get_subscription)
                .patch(handlers::subscriptions::update_subscription)
                .delete(handlers::subscriptions::delete_subscription),
        )
        .route(
            "/subscriptions/{id}/rotate-secret",
            post(handlers::subscriptions::rotate_secret),
        )
        .route("/inbox", get(handlers::inbox::fetch))
        .route("/inbox/ack", post(handlers::inbox::ack))
        .route("/inbox/ack/batch", post(handlers::inbox::ack_batch))
        .route("/inbox/visibility", post(handlers::inbox::change_visibility))
        .route("/inbox/stats", get(handlers::inbox::stats))
        .route("/dlq", get(handlers::dlq::list))
        .route("/dlq/stats", get(handlers::dlq::stats))
        .route("/dlq/retry-batch", post(handlers::dlq::retry_batch))
        .route("/dlq/dismiss-batch", post(handlers::dlq::dismiss_batch))
        .route("/dlq/purge", post(handlers::dlq::purge))
        .route(
            "/dlq/{event_id}",
            get(handlers::dlq::get).delete(handlers::dlq::dismiss),
        )
        .route("/dlq/{event_id}/retry", post(handlers::dlq::retry))
        // Layer order: the last layer runs first, so authentication wraps
        // the rate limiter and the limiter sees the credential.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            limits::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/healthz", get(handlers::health::healthz))
        .route("/health", get(handlers::health::health))
        .route("/health/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .route("/internal/metrics", get(handlers::health::prometheus_metrics))
        .route("/api-docs/openapi.json", get(openapi::serve_openapi))
        .with_state(state.clone());

    let cors_layer = create_cors_layer(&state.config)?;

    let router = Router::new()
        .merge(public_routes)
        .nest("/api/v1", api_routes)
        .layer(cors_layer)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    Ok(router)
}

/// Container for background workers and their lifecycle.
pub struct BackgroundServices {
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    task_names: HashMap<tokio::task::Id, &'static str>,
    shutdown_token: CancellationToken,
    _drop_guard: tokio_util::sync::DropGuard,
}

impl BackgroundServices {
    /// Wait for any background task to exit (which is always a failure
    /// while the application runs). Cancel-safe.
    pub async fn wait_for_failure(&mut self) -> anyhow::Error {
        match self.tasks.join_next_with_id().await {
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Some(Ok((task_id, Ok(())))) => {
                let name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                anyhow::anyhow!("background task '{name}' exited early")
            }
            Some(Ok((task_id, Err(e)))) => {
                let name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                anyhow::anyhow!("background task '{name}' failed: {e}")
            }
            Some(Err(e)) => {
                let name = self.task_names.get(&e.id()).copied().unwrap_or("unknown");
                anyhow::anyhow!("background task '{name}' panicked: {e}")
            }
        }
    }

    /// Signal shutdown and drain every background task.
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();

        while let Some(result) = self.tasks.join_next_with_id().await {
            match result {
                Ok((task_id, Ok(()))) => {
                    let name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::debug!(task = name, "background task stopped");
                }
                Ok((task_id, Err(e))) => {
                    let name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::error!(task = name, error = %e, "background task failed during shutdown");
                }
                Err(e) => {
                    let name = self.task_names.get(&e.id()).copied().unwrap_or("unknown");
                    tracing::error!(task = name, error = %e, "background task panicked");
                }
            }
        }
    }
}

struct BackgroundTaskBuilder {
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    names: HashMap<tokio::task::Id, &'static str>,
}

impl BackgroundTaskBuilder {
    fn new() -> Self {
        Self {
            tasks: tokio::task::JoinSet::new(),
            names: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(future);
        self.names.insert(handle.id(), name);
    }
}

/// Start the event processor and the delivery dispatcher.
fn setup_background_services(
    pool: PgPool,
    store: FastStore,
    config: &Config,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut builder = BackgroundTaskBuilder::new();

    if config.processor.enabled {
        let processor = EventProcessor::new(pool.clone(), config.processor.clone());
        let token = shutdown_token.clone();
        builder.spawn("event-processor", async move {
            processor.run(token).await;
            Ok(())
        });
    } else {
        info!("event processor disabled by configuration");
    }

    if config.dispatcher.enabled {
        let dispatcher = WebhookDispatcher::spawn(
            pool.clone(),
            store.clone(),
            config.dispatcher.clone(),
            shutdown_token.clone(),
        );
        let token = shutdown_token.clone();
        builder.spawn("delivery-dispatcher", async move {
            dispatcher.run(token).await;
            Ok(())
        });
    } else {
        info!("delivery dispatcher disabled by configuration");
    }

    BackgroundServices {
        tasks: builder.tasks,
        task_names: builder.names,
        shutdown_token,
        _drop_guard: drop_guard,
    }
}

/// Main application struct owning all resources and lifecycle.
pub struct Application {
    router: Router,
    config: Config,
    background: BackgroundServices,
}

impl Application {
    /// Connect the stores, run migrations, seed the bootstrap credential,
    /// and start the background workers.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.database.acquire_timeout_secs,
            ))
            .connect(&config.database.url)
            .await
            .context("failed to connect to database")?;

        migrator().run(&pool).await.context("database migration failed")?;

        let store = FastStore::connect(&config.redis.url)
            .await
            .context("failed to connect to fast store")?;

        ensure_bootstrap_api_key(&pool, &config).await?;

        let metrics_handle = if config.enable_metrics {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install metrics recorder")?,
            )
        } else {
            None
        };

        let state = AppState {
            db: pool.clone(),
            store: store.clone(),
            config: config.clone(),
            ingest: IngestService::new(pool.clone(), store.clone()),
            inbox: InboxService::new(pool.clone(), store.clone()),
            dlq: DlqService::new(pool.clone(), store.clone()),
            health: HealthService::new(pool.clone(), store.clone(), Instant::now()),
            metrics_handle,
        };

        let router = build_router(state)?;

        let shutdown_token = CancellationToken::new();
        let background = setup_background_services(pool, store, &config, shutdown_token);

        Ok(Self {
            router,
            config,
            background,
        })
    }

    /// Serve until the shutdown future resolves or a background worker
    /// dies, then drain gracefully.
    pub async fn serve<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(%addr, version = env!("CARGO_PKG_VERSION"), "fanout listening");

        let token = self.background.shutdown_token.clone();
        {
            let token = token.clone();
            tokio::spawn(async move {
                shutdown.await;
                info!("shutdown signal received");
                token.cancel();
            });
        }

        let server = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(token.clone().cancelled_owned());

        tokio::select! {
            result = server => {
                result.context("server error")?;
            }
            failure = self.background.wait_for_failure() => {
                tracing::error!(error = %failure, "background worker failed, shutting down");
                token.cancel();
                self.background.shutdown().await;
                return Err(failure);
            }
        }

        self.background.shutdown().await;
        info!("fanout stopped");
        Ok(())
    }
}
