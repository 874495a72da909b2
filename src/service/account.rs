//! Account service
//!
//! Linking, verification and feature removal for silo accounts.

use std::sync::Arc;

use crate::data::{AccountKey, AccountRecord, Database, Feature};
use crate::error::AppError;
use crate::silo::{SiloClients, SiloError};
use crate::tasks::{Task, TaskDispatcher};
use crate::webmention::WebmentionSender;

/// Account service
pub struct AccountService {
    db: Arc<Database>,
    silos: Arc<SiloClients>,
    sender: Arc<dyn WebmentionSender>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl AccountService {
    pub fn new(
        db: Arc<Database>,
        silos: Arc<SiloClients>,
        sender: Arc<dyn WebmentionSender>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            db,
            silos,
            sender,
            dispatcher,
        }
    }

    pub async fn get_account(&self, key: &AccountKey) -> Result<AccountRecord, AppError> {
        self.db.get_account(key).await?.ok_or(AppError::NotFound)
    }

    /// Store a freshly linked account, verify it and start polling.
    ///
    /// # Errors
    /// `Validation` if the account has no features
    pub async fn create_or_update(&self, account: AccountRecord) -> Result<AccountRecord, AppError> {
        if account.features.is_empty() {
            return Err(AppError::Validation(
                "account must enable at least one feature".to_string(),
            ));
        }

        let stored = self.db.create_or_update_account(&account).await?;
        tracing::info!(account = %stored.label(), features = ?stored.features, "Account linked");

        let stored = self.verify(stored, false).await?;
        if stored.has_feature(Feature::Listen) {
            self.dispatcher
                .dispatch(
                    Task::Poll {
                        account: stored.key(),
                        last_polled: stored.last_polled,
                    },
                    None,
                )
                .await?;
        }
        Ok(stored)
    }

    /// Check that the account's home page advertises a webmention endpoint.
    ///
    /// Skipped when already verified (unless `force`), when disabled, or
    /// when no author URL is configured. A failed discovery clears the
    /// stored endpoint.
    pub async fn verify(
        &self,
        mut account: AccountRecord,
        force: bool,
    ) -> Result<AccountRecord, AppError> {
        if (account.verified() && !force) || account.is_disabled() {
            return Ok(account);
        }
        let Some(author_url) = account.author_url().map(str::to_string) else {
            return Ok(account);
        };

        let key = account.key();
        let mut endpoint = match self.sender.discover_endpoint(&author_url).await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::warn!(account = %key, author_url, error = %error, "Endpoint discovery failed");
                None
            }
        };
        if endpoint.is_some() && !self.silo_verifies(&account).await {
            endpoint = None;
        }

        tracing::info!(account = %key, endpoint = ?endpoint, "Verification finished");
        self.db
            .set_webmention_endpoint(&key, endpoint.as_deref())
            .await?;
        account.webmention_endpoint = endpoint;
        Ok(account)
    }

    /// Silo-specific readiness. Silos without a connector have no extra check.
    async fn silo_verifies(&self, account: &AccountRecord) -> bool {
        match self.silos.client(account).await {
            Ok(adapter) => match adapter.verify(account).await {
                Ok(verified) => verified,
                Err(error) => {
                    tracing::warn!(account = %account.key(), error = %error, "Silo verification failed");
                    false
                }
            },
            Err(SiloError::NotSupported(_)) => true,
            Err(error) => {
                tracing::warn!(account = %account.key(), error = %error, "Could not connect silo client");
                false
            }
        }
    }

    /// User-initiated feature removal. The account is kept, disabled once
    /// no features remain.
    pub async fn disable_feature(
        &self,
        key: &AccountKey,
        feature: Feature,
    ) -> Result<AccountRecord, AppError> {
        let account = self
            .db
            .remove_features(key, &[feature], false)
            .await?
            .ok_or(AppError::NotFound)?;

        if account.is_disabled() {
            self.silos.forget(key).await;
        }
        tracing::info!(account = %key, feature = feature.as_str(), status = account.status.as_str(), "Feature disabled");
        Ok(account)
    }
}
