//! Publishing into silos
//!
//! Each attempt is appended under its published page; a page gets at most
//! one complete publish per type.

use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::data::{AccountKey, Database, Feature, PublishRecord, PublishType};
use crate::error::AppError;
use crate::silo::{SiloClients, SiloError};

/// A request to publish a page from the user's site
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub silo: String,
    pub account_id: String,
    /// Page on the user's site
    pub source_url: String,
    pub publish_type: PublishType,
    /// Silo post being replied to
    pub in_reply_to: Option<String>,
    /// Plain text to publish
    pub content: String,
    /// Raw captured page content
    #[serde(default)]
    pub html: Option<String>,
}

pub struct PublishService {
    db: Arc<Database>,
    silos: Arc<SiloClients>,
}

impl PublishService {
    pub fn new(db: Arc<Database>, silos: Arc<SiloClients>) -> Self {
        Self { db, silos }
    }

    /// Publish a page into the account's silo.
    ///
    /// # Errors
    /// `Validation` for a bad request, a missing `publish` feature or an
    /// already completed publish of the same type; `NotImplemented` for
    /// types the silo interface cannot create; `Silo` when the silo call
    /// fails, after the attempt is marked failed
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishRecord, AppError> {
        let key = AccountKey::new(request.silo.parse()?, request.account_id.trim());
        let account = self.db.get_account(&key).await?.ok_or(AppError::NotFound)?;
        if account.is_disabled() || !account.has_feature(Feature::Publish) {
            return Err(AppError::Validation(format!(
                "{key} does not have the publish feature"
            )));
        }
        if request.publish_type != PublishType::Comment {
            return Err(AppError::NotImplemented(format!(
                "publishing {} to {}",
                request.publish_type.as_str(),
                key.silo
            )));
        }
        let source_url = source_page(&request.source_url)?;
        let in_reply_to = request
            .in_reply_to
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AppError::Validation("in_reply_to is required for comments".to_string()))?;

        let publish = self
            .db
            .begin_publish(&PublishRecord::new(
                source_url,
                key.clone(),
                request.publish_type,
                request.html.clone(),
            ))
            .await?;

        let adapter = self.silos.client(&account).await;
        let author_name = account.name.clone().unwrap_or_else(|| account.id.clone());
        let author_url = account
            .author_url()
            .unwrap_or(&publish.source_url)
            .to_string();
        let result = match adapter {
            Ok(adapter) => {
                adapter
                    .create_comment(in_reply_to, &author_name, &author_url, &request.content)
                    .await
            }
            Err(error) => Err(error),
        };

        let published = match result {
            Ok(published) if published.get("id").is_some() => published,
            Ok(_) => {
                let error = SiloError::Other("silo response has no id".to_string());
                return Err(self.fail(&publish, &key, error).await);
            }
            Err(error) => return Err(self.fail(&publish, &key, error).await),
        };

        self.db.complete_publish(&publish.id, &published).await?;
        tracing::info!(publish = %publish.id, source_url = %publish.source_url, account = %key, "Published");
        self.db.get_publish(&publish.id).await?.ok_or(AppError::NotFound)
    }

    /// Mark the attempt failed and convert the silo error.
    ///
    /// A revoked grant disables the account's silo features, as a poll does.
    async fn fail(&self, publish: &PublishRecord, key: &AccountKey, error: SiloError) -> AppError {
        tracing::warn!(publish = %publish.id, error = %error, "Publish failed");
        if let Err(db_error) = self.db.fail_publish(&publish.id).await {
            tracing::error!(publish = %publish.id, error = %db_error, "Could not mark publish failed");
        }

        if let SiloError::Deauthorized(reason) = &error {
            tracing::warn!(account = %key, reason = %reason, "Deauthorized, disabling account");
            if let Err(db_error) = self
                .db
                .remove_features(key, &[Feature::Listen, Feature::Publish], true)
                .await
            {
                tracing::error!(account = %key, error = %db_error, "Could not disable account");
            }
            self.silos.forget(key).await;
        }
        AppError::Silo(error)
    }

    /// All attempts for a page, oldest first
    pub async fn history(&self, source_url: &str) -> Result<Vec<PublishRecord>, AppError> {
        self.db.publishes_for_page(source_url).await
    }
}

/// The published page, which must be an absolute http(s) URL
fn source_page(source_url: &str) -> Result<&str, AppError> {
    let source_url = source_url.trim();
    let parsed = Url::parse(source_url)
        .map_err(|e| AppError::Validation(format!("invalid source_url {source_url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(AppError::Validation(format!(
            "source_url must be an http(s) URL: {source_url}"
        )));
    }
    Ok(source_url)
}
