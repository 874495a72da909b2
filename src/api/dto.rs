//! Request and response DTOs for the bridge API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{AccountRecord, DeliveryRecord, Feature, PublishRecord};
use crate::silo::FeedItem;

/// Body of `POST /retry`
#[derive(Debug, Clone, Deserialize)]
pub struct RetryRequest {
    /// Delivery record id
    pub key: String,
}

/// Body of `POST /poll-now`
#[derive(Debug, Clone, Deserialize)]
pub struct PollNowRequest {
    pub silo: String,
    pub id: String,
}

/// Body of `POST /feed/{silo}/{id}`, as sent by the push-feed notifier
#[derive(Debug, Clone, Deserialize)]
pub struct FeedNotification {
    #[serde(default)]
    pub items: Vec<FeedItem>,
}

/// Body of `POST /accounts/{silo}/{id}/disable`
#[derive(Debug, Clone, Deserialize)]
pub struct DisableFeatureRequest {
    pub feature: Feature,
}

/// Body of `POST /accounts`, sent once the silo grant has been obtained
#[derive(Debug, Clone, Deserialize)]
pub struct LinkAccountRequest {
    pub silo: String,
    pub id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub features: Vec<Feature>,
    #[serde(default)]
    pub domain_urls: Vec<String>,
}

/// Query of `GET /deliveries`
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryQuery {
    pub key: String,
}

/// Query of `GET /publishes`
#[derive(Debug, Clone, Deserialize)]
pub struct PublishQuery {
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub silo: String,
    pub id: String,
    pub name: Option<String>,
    pub status: String,
    pub features: Vec<String>,
    pub domain_urls: Vec<String>,
    pub webmention_endpoint: Option<String>,
    pub verified: bool,
    pub last_polled: DateTime<Utc>,
    pub last_webmention_sent: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AccountRecord> for AccountResponse {
    fn from(account: AccountRecord) -> Self {
        Self {
            verified: account.verified(),
            silo: account.silo.to_string(),
            status: account.status.as_str().to_string(),
            features: account
                .features
                .iter()
                .map(|feature| feature.as_str().to_string())
                .collect(),
            id: account.id,
            name: account.name,
            domain_urls: account.domain_urls,
            webmention_endpoint: account.webmention_endpoint,
            last_polled: account.last_polled,
            last_webmention_sent: account.last_webmention_sent,
            created_at: account.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResponse {
    pub key: String,
    pub kind: String,
    pub account: String,
    pub status: String,
    pub leased_until: Option<DateTime<Utc>>,
    pub sent: Vec<String>,
    pub unsent: Vec<String>,
    pub error: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryRecord> for DeliveryResponse {
    fn from(record: DeliveryRecord) -> Self {
        let links = record.links;
        Self {
            kind: record.kind.as_str().to_string(),
            account: record.account.to_string(),
            status: record.status.as_str().to_string(),
            key: record.id,
            leased_until: record.leased_until,
            sent: links.sent.into_iter().collect(),
            unsent: links.unsent.into_iter().collect(),
            error: links.error.into_iter().collect(),
            failed: links.failed.into_iter().collect(),
            skipped: links.skipped.into_iter().collect(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResponse {
    pub id: String,
    pub source_url: String,
    pub publish_type: String,
    pub type_label: String,
    pub status: String,
    pub published: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl From<PublishRecord> for PublishResponse {
    fn from(publish: PublishRecord) -> Self {
        Self {
            publish_type: publish.publish_type.as_str().to_string(),
            status: publish.status.as_str().to_string(),
            id: publish.id,
            source_url: publish.source_url,
            type_label: publish.type_label,
            published: publish.published,
            created_at: publish.created_at,
        }
    }
}
