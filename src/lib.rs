//! MentionBridge - silo responses to webmentions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Retry, poll-now, feature removal                         │
//! │  - Push-feed ingress, publishing                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Service Layer + Task Runner                    │
//! │  - Poller, propagation worker                               │
//! │  - Original post discovery                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx), check-and-set transactions                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Business logic layer
//! - `tasks`: Task dispatch and bounded execution
//! - `scheduler`: Poll cadence
//! - `webmention`: Link classification, endpoint discovery and sending
//! - `silo`: Silo kinds and the adapter seam
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod silo;
pub mod tasks;
pub mod webmention;

use std::sync::Arc;
use std::time::Duration;

use service::{
    AccountService, DeliveryService, FeedCrawler, HttpFeedCrawler, OriginalPostDiscovery, Poller,
    PropagationWorker, PublishService,
};
use tasks::{Task, TaskDispatcher, TaskRunner};
use webmention::{HttpWebmentionSender, WebmentionSender};

/// Application state shared across all handlers
///
/// This struct is cloned for each request; everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Memoized per-account silo clients
    pub silos: Arc<silo::SiloClients>,

    pub dispatcher: Arc<dyn TaskDispatcher>,

    pub accounts: Arc<AccountService>,
    pub deliveries: Arc<DeliveryService>,
    pub publishes: Arc<PublishService>,
    pub poller: Arc<Poller>,
    pub worker: Arc<PropagationWorker>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP webmention sender and h-feed crawler
    /// 3. Wire the services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
        silos: silo::SiloClients,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        let sender = HttpWebmentionSender::from_config(&config.http)?;
        let crawler = HttpFeedCrawler::from_config(&config.http)?;
        tracing::info!(
            timeout_seconds = config.http.timeout_seconds,
            "HTTP clients initialized"
        );

        for kind in silo::SiloKind::ALL {
            if !silos.supports(kind) {
                tracing::warn!(silo = %kind, "No adapter registered, polls will fail");
            }
        }

        Ok(Self::with_collaborators(
            config,
            db,
            silos,
            Arc::new(sender),
            Arc::new(crawler),
            dispatcher,
        ))
    }

    /// Wire the services around explicit collaborators
    pub fn with_collaborators(
        config: config::AppConfig,
        db: data::Database,
        silos: silo::SiloClients,
        sender: Arc<dyn WebmentionSender>,
        crawler: Arc<dyn FeedCrawler>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        let db = Arc::new(db);
        let silos = Arc::new(silos);

        let discovery = Arc::new(OriginalPostDiscovery::new(
            db.clone(),
            crawler,
            Duration::from_secs(config.polling.refetch_period_seconds),
        ));
        let poller = Arc::new(Poller::new(
            db.clone(),
            silos.clone(),
            discovery,
            dispatcher.clone(),
            scheduler::Cadence::from(&config.polling),
            config.polling.jitter_percent,
        ));
        let worker = Arc::new(PropagationWorker::new(
            db.clone(),
            sender.clone(),
            config.propagation.clone(),
            config.server.base_url(),
        ));
        let accounts = Arc::new(AccountService::new(
            db.clone(),
            silos.clone(),
            sender,
            dispatcher.clone(),
        ));
        let deliveries = Arc::new(DeliveryService::new(db.clone(), dispatcher.clone()));
        let publishes = Arc::new(PublishService::new(db.clone(), silos.clone()));

        Self {
            config: Arc::new(config),
            db,
            silos,
            dispatcher,
            accounts,
            deliveries,
            publishes,
            poller,
            worker,
        }
    }

    /// Runner executing tasks with the configured concurrency
    pub fn task_runner(&self) -> TaskRunner {
        TaskRunner::new(
            self.poller.clone(),
            self.worker.clone(),
            self.config.propagation.task_concurrency,
        )
    }

    /// Dispatch a poll for every listening account.
    ///
    /// Start-up delays are spread over the fast interval so that a restart
    /// does not poll every silo at once.
    pub async fn resume_polling(&self) -> Result<usize, error::AppError> {
        use rand::Rng;

        let spread = self.config.polling.fast_interval_seconds.max(1);
        let mut dispatched = 0;
        for account in self.db.list_accounts().await? {
            if account.is_disabled() || !account.has_feature(data::Feature::Listen) {
                continue;
            }
            let delay = Duration::from_secs(rand::thread_rng().gen_range(0..spread));
            self.dispatcher
                .dispatch(
                    Task::Poll {
                        account: account.key(),
                        last_polled: account.last_polled,
                    },
                    Some(delay),
                )
                .await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::bridge_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
