//! Delivery service
//!
//! User-facing retry and the push-feed ingress for hosted blog posts.

use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::data::{AccountKey, Database, DeliveryKind, DeliveryRecord, DeliveryStatus, Feature};
use crate::error::AppError;
use crate::metrics::DELIVERIES_CREATED_TOTAL;
use crate::silo::FeedItem;
use crate::tasks::{Task, TaskDispatcher};
use crate::webmention::{LinkClassifier, html};

fn propagate_task(record: &DeliveryRecord) -> Task {
    match record.kind {
        DeliveryKind::Response { .. } => Task::Propagate {
            id: record.id.clone(),
        },
        DeliveryKind::BlogPost { .. } => Task::PropagateBlogPost {
            id: record.id.clone(),
        },
    }
}

pub struct DeliveryService {
    db: Arc<Database>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl DeliveryService {
    pub fn new(db: Arc<Database>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self { db, dispatcher }
    }

    pub async fn get(&self, id: &str) -> Result<DeliveryRecord, AppError> {
        self.db.get_delivery(id).await?.ok_or(AppError::NotFound)
    }

    /// Reset a delivery record and dispatch a new propagation round.
    ///
    /// Failed links get another chance; a record leased by a live worker is
    /// left as is, but the task is dispatched regardless.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `UnexpectedKind` if the stored record
    /// is neither a response nor a blog post
    pub async fn retry(&self, id: &str) -> Result<DeliveryRecord, AppError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(AppError::Validation("key is required".to_string()));
        }

        let record = self.db.reset_delivery_for_retry(id, Utc::now()).await?;
        tracing::info!(delivery = %record.label(), status = record.status.as_str(), "Retry requested");
        self.dispatcher
            .dispatch(propagate_task(&record), None)
            .await?;
        Ok(record)
    }

    /// Turn a push-feed notification into a blog post delivery record.
    ///
    /// # Errors
    /// `NotFound` for an unknown account, `Validation` if the account does
    /// not send webmentions or the item has no usable permalink
    pub async fn on_feed_item(
        &self,
        key: &AccountKey,
        item: &FeedItem,
    ) -> Result<DeliveryRecord, AppError> {
        let account = self.db.get_account(key).await?.ok_or(AppError::NotFound)?;
        if account.is_disabled() || !account.has_feature(Feature::Webmention) {
            return Err(AppError::Validation(format!(
                "{key} does not have the webmention feature"
            )));
        }

        let permalink = item
            .permalink_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AppError::Validation("feed item has no permalink".to_string()))?;
        let base = Url::parse(permalink)
            .map_err(|e| AppError::Validation(format!("invalid permalink {permalink}: {e}")))?;

        let mut links = item.links.clone();
        if let Some(content) = &item.content {
            links.extend(html::anchor_hrefs(content, Some(&base)));
        }
        links.retain(|link| link.trim() != permalink);
        let links = LinkClassifier::partition_outbound(&account, &links);

        let feed_item = serde_json::to_value(item).map_err(|e| AppError::Internal(e.into()))?;
        let record = DeliveryRecord::blog_post(permalink, key.clone(), feed_item, links);
        let (stored, created) = self.db.get_or_create_delivery(&record).await?;

        if created {
            DELIVERIES_CREATED_TOTAL.with_label_values(&["blog_post"]).inc();
            tracing::info!(
                delivery = %stored.label(),
                unsent = stored.links.unsent.len(),
                "Blog post received"
            );
            if stored.status == DeliveryStatus::New {
                self.dispatcher
                    .dispatch(propagate_task(&stored), None)
                    .await?;
            }
        }
        Ok(stored)
    }
}
