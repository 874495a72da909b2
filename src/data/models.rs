//! Data models
//!
//! Rust structs representing stored entities.
//! Child rows use ULID for IDs and all timestamps are chrono UTC.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::silo::{SiloKind, parse_tag_uri};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a linked silo account: silo type plus the silo-native id.
///
/// Immutable once the account exists. Every other record is scoped under one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub silo: SiloKind,
    pub id: String,
}

impl AccountKey {
    pub fn new(silo: SiloKind, id: impl Into<String>) -> Self {
        Self {
            silo,
            id: id.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.silo, self.id)
    }
}

/// Start of time for "never happened" timestamps
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

// =============================================================================
// Account
// =============================================================================

/// What the user signed the account up for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Poll the silo for responses and send them as webmentions
    Listen,
    /// Publish into the silo from the user's site
    Publish,
    /// Hosted blog: send webmentions for links in new posts
    Webmention,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Publish => "publish",
            Self::Webmention => "webmention",
        }
    }
}

impl FromStr for Feature {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listen" => Ok(Self::Listen),
            "publish" => Ok(Self::Publish),
            "webmention" => Ok(Self::Webmention),
            other => Err(AppError::Validation(format!("unknown feature: {other}"))),
        }
    }
}

/// Account health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Enabled,
    Disabled,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "error" => Ok(Self::Error),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown account status: {other}"
            ))),
        }
    }
}

/// One linked silo account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub silo: SiloKind,
    /// Silo-native account id
    pub id: String,
    /// Full human-readable name
    pub name: Option<String>,
    /// Silo profile URL
    pub url: Option<String>,
    pub status: AccountStatus,
    pub features: BTreeSet<Feature>,
    /// Lower-cased domains of the user's own web sites
    pub domains: Vec<String>,
    /// The user's own web sites, first one is the author URL
    pub domain_urls: Vec<String>,
    /// Discovered webmention endpoint on the author URL
    pub webmention_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_polled: DateTime<Utc>,
    pub last_poll_attempt: DateTime<Utc>,
    pub last_webmention_sent: Option<DateTime<Utc>>,
    /// Last time the author's h-feed was crawled for syndication links
    pub last_hfeed_fetch: DateTime<Utc>,
    /// Last time a syndication link was seen for this account
    pub last_syndication_url: Option<DateTime<Utc>>,
    pub last_activity_id: Option<String>,
    pub last_activities_etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRecord {
    /// A fresh, enabled account with no features
    pub fn new(silo: SiloKind, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            silo,
            id: id.into(),
            name: None,
            url: None,
            status: AccountStatus::Enabled,
            features: BTreeSet::new(),
            domains: Vec::new(),
            domain_urls: Vec::new(),
            webmention_endpoint: None,
            created_at: now,
            last_polled: epoch(),
            last_poll_attempt: epoch(),
            last_webmention_sent: None,
            last_hfeed_fetch: epoch(),
            last_syndication_url: None,
            last_activity_id: None,
            last_activities_etag: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.silo, self.id.clone())
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn is_disabled(&self) -> bool {
        self.status == AccountStatus::Disabled
    }

    /// The author's home page, if any web site is configured
    pub fn author_url(&self) -> Option<&str> {
        self.domain_urls.first().map(String::as_str)
    }

    /// Human-readable label for log messages
    pub fn label(&self) -> String {
        format!(
            "{} ({})",
            self.name.as_deref().unwrap_or(&self.id),
            self.silo.display_name()
        )
    }

    /// Whether this account is ready to be used.
    ///
    /// Requires web sites to be known. Webmention accounts additionally need a
    /// discovered endpoint; listen accounts need an endpoint or at least one
    /// previously sent webmention, which counts as proof of capability even if
    /// rediscovery later fails.
    pub fn verified(&self) -> bool {
        if self.domains.is_empty() || self.domain_urls.is_empty() {
            return false;
        }
        if self.has_feature(Feature::Webmention) && self.webmention_endpoint.is_none() {
            return false;
        }
        if self.has_feature(Feature::Listen)
            && self.webmention_endpoint.is_none()
            && self.last_webmention_sent.is_none()
        {
            return false;
        }
        true
    }

    /// Set the user's web sites, deriving the lower-cased domain list.
    pub fn set_domain_urls(&mut self, urls: Vec<String>) {
        let mut domains: Vec<String> = Vec::new();
        for url in &urls {
            let Some(host) = url::Url::parse(url)
                .ok()
                .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
            else {
                continue;
            };
            if !domains.contains(&host) {
                domains.push(host);
            }
        }
        self.domains = domains;
        self.domain_urls = urls;
    }

    /// Whether `url` points at one of the user's own sites
    pub fn is_self_link(&self, url: &str) -> bool {
        let Some(host) = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.domains.iter().any(|domain| {
            host == *domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

// =============================================================================
// Delivery records
// =============================================================================

/// Propagation status of a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    New,
    Processing,
    Complete,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Classification bucket of a webmention target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkBucket {
    /// Delivered and acknowledged
    Sent,
    /// Known, not attempted yet
    Unsent,
    /// Transient failure, retried
    Error,
    /// Permanent failure, manual retry only
    Failed,
    /// Target does not take webmentions
    Skipped,
}

impl LinkBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Unsent => "unsent",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal buckets are never left by automatic processing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Skipped)
    }
}

/// The five disjoint target sets of a delivery record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSets {
    pub sent: BTreeSet<String>,
    pub unsent: BTreeSet<String>,
    pub error: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
}

impl LinkSets {
    pub fn with_unsent<I, S>(links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sets = Self::default();
        for link in links {
            sets.insert(link.into(), LinkBucket::Unsent);
        }
        sets
    }

    pub fn bucket(&self, bucket: LinkBucket) -> &BTreeSet<String> {
        match bucket {
            LinkBucket::Sent => &self.sent,
            LinkBucket::Unsent => &self.unsent,
            LinkBucket::Error => &self.error,
            LinkBucket::Failed => &self.failed,
            LinkBucket::Skipped => &self.skipped,
        }
    }

    fn bucket_mut(&mut self, bucket: LinkBucket) -> &mut BTreeSet<String> {
        match bucket {
            LinkBucket::Sent => &mut self.sent,
            LinkBucket::Unsent => &mut self.unsent,
            LinkBucket::Error => &mut self.error,
            LinkBucket::Failed => &mut self.failed,
            LinkBucket::Skipped => &mut self.skipped,
        }
    }

    /// Which bucket holds `link`, if any
    pub fn bucket_of(&self, link: &str) -> Option<LinkBucket> {
        [
            LinkBucket::Sent,
            LinkBucket::Unsent,
            LinkBucket::Error,
            LinkBucket::Failed,
            LinkBucket::Skipped,
        ]
        .into_iter()
        .find(|bucket| self.bucket(*bucket).contains(link))
    }

    /// Put `link` in `bucket`, removing it from wherever it was.
    pub fn insert(&mut self, link: String, bucket: LinkBucket) {
        self.remove(&link);
        self.bucket_mut(bucket).insert(link);
    }

    pub fn remove(&mut self, link: &str) {
        self.sent.remove(link);
        self.unsent.remove(link);
        self.error.remove(link);
        self.failed.remove(link);
        self.skipped.remove(link);
    }

    /// Every known link, across all buckets
    pub fn all(&self) -> BTreeSet<String> {
        self.sent
            .iter()
            .chain(&self.unsent)
            .chain(&self.error)
            .chain(&self.failed)
            .chain(&self.skipped)
            .cloned()
            .collect()
    }

    /// Links still owed a delivery attempt: unsent plus error
    pub fn pending(&self) -> Vec<String> {
        self.unsent.iter().chain(&self.error).cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.unsent.is_empty() || !self.error.is_empty()
    }

    /// Status of a record holding these links once no round is running.
    ///
    /// Complete once nothing is pending and nothing failed. Any transient
    /// error means `error`. Failed links with nothing else pending park the
    /// record in `processing` until a user retries it.
    pub fn settled_status(&self) -> DeliveryStatus {
        if !self.error.is_empty() {
            DeliveryStatus::Error
        } else if !self.unsent.is_empty() {
            DeliveryStatus::New
        } else if !self.failed.is_empty() {
            DeliveryStatus::Processing
        } else {
            DeliveryStatus::Complete
        }
    }

    /// True if no link appears in more than one bucket
    pub fn is_disjoint(&self) -> bool {
        let total = self.sent.len()
            + self.unsent.len()
            + self.error.len()
            + self.failed.len()
            + self.skipped.len();
        total == self.all().len()
    }
}

/// Response verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Comment,
    Like,
    Repost,
    Rsvp,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Like => "like",
            Self::Repost => "repost",
            Self::Rsvp => "rsvp",
        }
    }
}

/// Kind-specific payload of a delivery record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryKind {
    /// A comment, like, repost or RSVP found on a silo.
    ///
    /// Keyed by the response's tag URI.
    Response {
        response_type: ResponseType,
        /// The silo post(s) the response belongs to
        activities: Vec<serde_json::Value>,
        response: serde_json::Value,
    },
    /// A hosted blog post whose links get webmentions.
    ///
    /// Keyed by the post URL.
    BlogPost { feed_item: serde_json::Value },
}

impl DeliveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::BlogPost { .. } => "blog_post",
        }
    }
}

/// A bundle of links needing webmention delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    /// Tag URI for responses, canonical URL for blog posts
    pub id: String,
    pub account: AccountKey,
    pub kind: DeliveryKind,
    pub status: DeliveryStatus,
    pub leased_until: Option<DateTime<Utc>>,
    pub links: LinkSets,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    fn with_kind(id: String, account: AccountKey, kind: DeliveryKind, links: LinkSets) -> Self {
        let now = Utc::now();
        Self {
            id,
            account,
            kind,
            status: DeliveryStatus::New,
            leased_until: None,
            links,
            created_at: now,
            updated_at: now,
        }
    }

    /// New response record with every target unsent
    pub fn response(
        id: impl Into<String>,
        account: AccountKey,
        response_type: ResponseType,
        activities: Vec<serde_json::Value>,
        response: serde_json::Value,
        links: LinkSets,
    ) -> Self {
        Self::with_kind(
            id.into(),
            account,
            DeliveryKind::Response {
                response_type,
                activities,
                response,
            },
            links,
        )
    }

    /// New blog post record
    pub fn blog_post(
        url: impl Into<String>,
        account: AccountKey,
        feed_item: serde_json::Value,
        links: LinkSets,
    ) -> Self {
        Self::with_kind(url.into(), account, DeliveryKind::BlogPost { feed_item }, links)
    }

    /// Whether another worker currently holds a live lease
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Processing
            && self.leased_until.is_some_and(|until| now < until)
    }

    /// The URL webmentions for this record are sent from.
    ///
    /// Responses are rendered by the bridge at
    /// `{base}/{type}/{silo}/{account}/{post id}/{response id}`; blog posts
    /// are their own source.
    pub fn source_url(&self, base_url: &str) -> Option<String> {
        match &self.kind {
            DeliveryKind::BlogPost { .. } => Some(self.id.clone()),
            DeliveryKind::Response {
                response_type,
                activities,
                ..
            } => {
                let (_, mut response_id) = parse_tag_uri(&self.id)?;
                if *response_type != ResponseType::Comment {
                    response_id = response_id.rsplit('_').next().unwrap_or(response_id);
                }
                let activity_id = activities.first()?.get("id")?.as_str()?;
                let (_, post_id) = parse_tag_uri(activity_id)?;
                Some(format!(
                    "{}/{}/{}/{}/{}/{}",
                    base_url.trim_end_matches('/'),
                    response_type.as_str(),
                    self.account.silo,
                    self.account.id,
                    post_id,
                    response_id
                ))
            }
        }
    }

    /// Human-readable label for log messages
    pub fn label(&self) -> String {
        format!("{} {} [{}]", self.kind.as_str(), self.id, self.account)
    }
}

// =============================================================================
// Publishing
// =============================================================================

/// What a publish creates in the silo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishType {
    Post,
    Comment,
    Like,
    Repost,
    Rsvp,
}

impl PublishType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Like => "like",
            Self::Repost => "repost",
            Self::Rsvp => "rsvp",
        }
    }
}

impl FromStr for PublishType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            "like" => Ok(Self::Like),
            "repost" => Ok(Self::Repost),
            "rsvp" => Ok(Self::Rsvp),
            other => Err(AppError::Validation(format!("unknown publish type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    New,
    Complete,
    Failed,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PublishStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unknown publish status: {other}"
            ))),
        }
    }
}

/// Root of all publish attempts for one page on the user's site
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PublishedPage {
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

/// One attempt to publish a page from the user's site into a silo.
///
/// Child of the published page identified by `source_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub id: String,
    pub source_url: String,
    pub account: AccountKey,
    pub publish_type: PublishType,
    /// Silo-specific label, e.g. "favorite"
    pub type_label: String,
    pub status: PublishStatus,
    /// Raw content captured from the source page
    pub html: Option<String>,
    /// Silo response for a completed publish
    pub published: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishRecord {
    pub fn new(
        source_url: impl Into<String>,
        account: AccountKey,
        publish_type: PublishType,
        html: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            source_url: source_url.into(),
            type_label: account.silo.type_label(publish_type).to_string(),
            account,
            publish_type,
            status: PublishStatus::New,
            html,
            published: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Syndication
// =============================================================================

/// A discovered relationship between a syndicated copy and its original.
///
/// Either side may be blank, meaning "looked, found nothing yet".
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SyndicatedPost {
    pub id: String,
    pub syndication: Option<String>,
    pub original: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyndicatedPost {
    pub fn is_blank(&self) -> bool {
        self.syndication.is_none() || self.original.is_none()
    }
}
