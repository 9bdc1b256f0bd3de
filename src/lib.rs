//! Windward - an ActivityPub federation engine
//!
//! Accepts signed activities from remote servers, verifies and
//! dispatches them into local state transitions, and signs and
//! reliably delivers outbound activities to remote inboxes.
//!
//! # Modules
//!
//! - `federation`: signature codec, audience resolution, inbound
//!   dispatch, delivery engine, inbox routing
//! - `data`: SQLite persistence enforcing the unique-identity
//!   invariants
//! - `jobs`: async job queue for deliveries, peer cleanup and poll
//!   expiration
//! - `config`: configuration management
//! - `error`: error types
//! - `metrics`: Prometheus instruments

pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod jobs;
pub mod metrics;

use std::sync::Arc;

use crate::federation::{
    ActorFetcher, DeliveryConfig, DeliveryEngine, HttpActorFetcher, RemoteActorResolver,
    SignatureRequiredCache,
};

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains shared
/// resources: database pool, remote actor resolver, delivery engine,
/// and the job queue handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Remote actor resolver (TTL cache + signed-fetch fallback)
    pub resolver: Arc<RemoteActorResolver>,

    /// Outbound delivery engine
    pub delivery: Arc<DeliveryEngine>,

    /// Job queue handle
    pub jobs: jobs::JobSender,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state with the production HTTP fetcher.
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        Self::build(config, None).await
    }

    /// Initialize application state with an injected actor fetcher.
    ///
    /// Tests use this to script remote actor documents without a
    /// network.
    pub async fn with_fetcher(
        config: config::AppConfig,
        fetcher: Arc<dyn ActorFetcher>,
    ) -> Result<Self, error::AppError> {
        Self::build(config, Some(fetcher)).await
    }

    async fn build(
        config: config::AppConfig,
        fetcher: Option<Arc<dyn ActorFetcher>>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Ensure the local actor exists (generates its keypair on
        //    first start)
        let local_actor = Self::ensure_local_actor(&db, &config).await?;
        let private_key_pem = local_actor
            .private_key_pem
            .clone()
            .ok_or_else(|| error::AppError::Config("Local actor has no private key".to_string()))?;

        // 3. HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(config.federation.user_agent.clone())
                .timeout(config.federation.request_timeout())
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 4. Remote actor resolver
        let fetcher = fetcher.unwrap_or_else(|| {
            Arc::new(HttpActorFetcher::new(
                http_client.clone(),
                local_actor.key_id(),
                private_key_pem.clone(),
            ))
        });
        let resolver = Arc::new(RemoteActorResolver::new(
            fetcher,
            SignatureRequiredCache::new(config.federation.signature_required_ttl()),
            config.federation.actor_cache_ttl(),
        ));

        // 5. Delivery engine and job queue
        let (job_sender, job_receiver) = jobs::channel();
        let delivery = Arc::new(DeliveryEngine::new(
            db.clone(),
            http_client.clone(),
            resolver.clone(),
            job_sender.clone(),
            local_actor.key_id(),
            private_key_pem,
            DeliveryConfig {
                timeout: config.federation.request_timeout(),
                max_attempts: config.federation.delivery_max_attempts,
                backoff_unit: config.federation.backoff_unit(),
                max_concurrent: config.federation.max_concurrent_deliveries,
            },
        ));
        jobs::spawn_worker(job_receiver, delivery.clone(), db.clone());

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            resolver,
            delivery,
            jobs: job_sender,
            http_client,
        })
    }

    /// Ensure the local actor exists with current configuration.
    ///
    /// Generates an RSA keypair when creating the actor; the keypair
    /// is immutable afterwards.
    async fn ensure_local_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<data::Actor, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let username = &config.federation.local_username;

        if let Some(actor) = db.find_local_actor_by_username(username).await? {
            tracing::info!(username = %actor.username, "Local actor exists");
            return Ok(actor);
        }

        tracing::info!(username = %username, "Creating local actor...");

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, config.federation.key_bits)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let base_url = config.server.base_url();
        let uri = format!("{}/users/{}", base_url, username);
        let actor = data::Actor {
            id: data::EntityId::new().0,
            uri: uri.clone(),
            username: username.clone(),
            domain: config.server.domain.clone(),
            inbox_url: format!("{}/inbox", uri),
            shared_inbox_url: Some(format!("{}/inbox", base_url)),
            public_key_pem,
            private_key_pem: Some(private_key_pem),
            is_local: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        db.upsert_actor(&actor).await?;

        tracing::info!(username = %actor.username, uri = %actor.uri, "Local actor created");
        Ok(actor)
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .route("/metrics", axum::routing::get(render_metrics))
        .merge(federation::federation_router())
        .merge(federation::wellknown_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn render_metrics() -> String {
    metrics::render()
}
