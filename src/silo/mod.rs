//! Silo integration seam
//!
//! Handles:
//! - The closed set of supported silos ([`SiloKind`])
//! - The capability interface each silo adapter implements
//! - Lazy, memoized construction of per-account silo clients
//!
//! The adapters themselves (native API translation, OAuth) live outside
//! this crate and are plugged in through [`SiloConnector`].

mod activity;
mod kind;

pub use activity::{
    Activity, ActivityPage, ActivityResponse, FeedItem, PollCursor, activity_id_greater,
    parse_tag_uri, tag_uri,
};
pub use kind::{SiloKind, in_webmention_blocklist};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::data::{AccountKey, AccountRecord};

/// Failures reported by a silo adapter
#[derive(Debug, Error)]
pub enum SiloError {
    /// The user revoked our access inside the silo. Never retried.
    #[error("account deauthorized: {0}")]
    Deauthorized(String),

    /// The silo is throttling us
    #[error("rate limited by silo")]
    RateLimited,

    /// Any other HTTP failure from the silo API
    #[error("silo returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The silo has no such capability
    #[error("{0} is not supported by this silo")]
    NotSupported(String),

    #[error("{0}")]
    Other(String),
}

impl SiloError {
    /// Map a silo API status code to an error.
    ///
    /// 401 means the grant was revoked. Twitter throttles with 429,
    /// Instagram with 503 and Google+ with 403.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Deauthorized(message),
            403 | 429 | 503 => Self::RateLimited,
            _ => Self::Http { status, message },
        }
    }
}

/// Capabilities every silo adapter provides.
#[async_trait]
pub trait SiloAdapter: Send + Sync {
    fn kind(&self) -> SiloKind;

    /// Recent posts with their replies, likes, reposts and RSVPs.
    ///
    /// Must return [`SiloError::Deauthorized`] when the account's grant has
    /// been revoked.
    async fn fetch_recent_activity(
        &self,
        account: &AccountRecord,
        cursor: &PollCursor,
    ) -> Result<ActivityPage, SiloError>;

    /// Silo-specific readiness check, on top of webmention endpoint discovery.
    async fn verify(&self, _account: &AccountRecord) -> Result<bool, SiloError> {
        Ok(true)
    }

    /// Publish a comment on a silo post. Returns the silo's response payload,
    /// which must include an `id`.
    async fn create_comment(
        &self,
        _post_url: &str,
        _author_name: &str,
        _author_url: &str,
        _content: &str,
    ) -> Result<serde_json::Value, SiloError> {
        Err(SiloError::NotSupported("comments".to_string()))
    }

    /// RSS or Atom feed for hosted blogs
    fn feed_url(&self, _account: &AccountRecord) -> Option<String> {
        None
    }
}

/// Builds an authenticated adapter for one account.
#[async_trait]
pub trait SiloConnector: Send + Sync {
    fn kind(&self) -> SiloKind;

    async fn connect(&self, account: &AccountRecord) -> Result<Arc<dyn SiloAdapter>, SiloError>;
}

/// Per-account silo clients, constructed on first use and cached.
///
/// Each account gets its own `OnceCell`, so concurrent first calls for the
/// same account wait on a single initialization.
#[derive(Default)]
pub struct SiloClients {
    connectors: HashMap<SiloKind, Arc<dyn SiloConnector>>,
    clients: Mutex<HashMap<AccountKey, Arc<OnceCell<Arc<dyn SiloAdapter>>>>>,
}

impl SiloClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connector for a silo kind, replacing any previous one.
    pub fn with_connector(mut self, connector: Arc<dyn SiloConnector>) -> Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn supports(&self, kind: SiloKind) -> bool {
        self.connectors.contains_key(&kind)
    }

    /// Get the adapter for an account, connecting on first call.
    pub async fn client(&self, account: &AccountRecord) -> Result<Arc<dyn SiloAdapter>, SiloError> {
        let connector = self
            .connectors
            .get(&account.silo)
            .ok_or_else(|| SiloError::NotSupported(account.silo.to_string()))?;

        let cell = {
            let mut clients = self.clients.lock().await;
            clients.entry(account.key()).or_default().clone()
        };

        let client = cell
            .get_or_try_init(|| async {
                tracing::debug!(account = %account.key(), "Connecting silo client");
                connector.connect(account).await
            })
            .await?;

        Ok(client.clone())
    }

    /// Drop a cached client, e.g. after the account was deauthorized.
    pub async fn forget(&self, key: &AccountKey) {
        let mut clients = self.clients.lock().await;
        clients.remove(key);
    }
}
