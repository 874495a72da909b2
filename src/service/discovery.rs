//! Original post discovery
//!
//! Maps syndicated silo URLs back to the original posts on the user's site,
//! crawling the author's h-feed for syndication links when nothing is known
//! yet. Results are kept in the syndication relationship table through
//! [`SyndicationResolver`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::HttpConfig;
use crate::data::{AccountKey, AccountRecord, Database, SyndicatedPost};
use crate::error::AppError;
use crate::metrics::SYNDICATION_INSERTS_TOTAL;
use crate::silo::Activity;
use crate::webmention::html::{self, HEntry};

/// Fetches the h-entries on an author's home page
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedCrawler: Send + Sync {
    async fn fetch_entries(&self, author_url: &str) -> Result<Vec<HEntry>, AppError>;
}

/// reqwest-backed [`FeedCrawler`]
pub struct HttpFeedCrawler {
    client: reqwest::Client,
}

impl HttpFeedCrawler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl FeedCrawler for HttpFeedCrawler {
    async fn fetch_entries(&self, author_url: &str) -> Result<Vec<HEntry>, AppError> {
        let response = self
            .client
            .get(author_url)
            .send()
            .await?
            .error_for_status()?;
        let base = response.url().clone();
        let body = response.text().await?;
        Ok(html::h_entries(&body, &base))
    }
}

/// Account-scoped syndication relationships.
///
/// Every write is a check-and-set transaction; losing a race is a no-op.
#[derive(Clone)]
pub struct SyndicationResolver {
    db: Arc<Database>,
}

impl SyndicationResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn insert_original_blank(
        &self,
        account: &AccountKey,
        original: &str,
    ) -> Result<bool, AppError> {
        let inserted = self.db.insert_original_blank(account, original).await?;
        if inserted {
            SYNDICATION_INSERTS_TOTAL
                .with_label_values(&["original_blank"])
                .inc();
        }
        Ok(inserted)
    }

    pub async fn insert_syndication_blank(
        &self,
        account: &AccountKey,
        syndication: &str,
    ) -> Result<bool, AppError> {
        let inserted = self.db.insert_syndication_blank(account, syndication).await?;
        if inserted {
            SYNDICATION_INSERTS_TOTAL
                .with_label_values(&["syndication_blank"])
                .inc();
        }
        Ok(inserted)
    }

    pub async fn insert(
        &self,
        account: &AccountKey,
        syndication: &str,
        original: &str,
    ) -> Result<SyndicatedPost, AppError> {
        let (post, inserted) = self
            .db
            .insert_syndication(account, syndication, original)
            .await?;
        if inserted {
            tracing::debug!(account = %account, syndication, original, "Recorded syndication link");
            SYNDICATION_INSERTS_TOTAL.with_label_values(&["concrete"]).inc();
        }
        Ok(post)
    }

    /// Everything known about a syndicated URL, blanks included
    pub async fn lookup(
        &self,
        account: &AccountKey,
        syndication: &str,
    ) -> Result<Vec<SyndicatedPost>, AppError> {
        self.db.find_by_syndication(account, syndication).await
    }
}

/// Finds webmention targets for silo activities
pub struct OriginalPostDiscovery {
    db: Arc<Database>,
    resolver: SyndicationResolver,
    crawler: Arc<dyn FeedCrawler>,
    refetch_period: chrono::Duration,
}

impl OriginalPostDiscovery {
    pub fn new(
        db: Arc<Database>,
        crawler: Arc<dyn FeedCrawler>,
        refetch_period: Duration,
    ) -> Self {
        Self {
            resolver: SyndicationResolver::new(db.clone()),
            db,
            crawler,
            refetch_period: chrono::Duration::seconds(refetch_period.as_secs() as i64),
        }
    }

    pub fn resolver(&self) -> &SyndicationResolver {
        &self.resolver
    }

    /// Candidate webmention targets for one activity: the links the silo
    /// adapter found plus any originals the activity was syndicated from.
    ///
    /// `account.last_hfeed_fetch` is advanced when the h-feed is crawled.
    pub async fn targets_for(
        &self,
        account: &mut AccountRecord,
        activity: &Activity,
    ) -> Result<Vec<String>, AppError> {
        let mut targets = activity.links.clone();
        let Some(url) = activity.url.as_deref() else {
            return Ok(targets);
        };

        let key = account.key();
        let syndication = account.silo.canonicalize_syndication_url(url);
        let mut known = self.resolver.lookup(&key, &syndication).await?;

        if known.is_empty() {
            if self.refetch_due(account) {
                self.crawl(account).await?;
                known = self.resolver.lookup(&key, &syndication).await?;
            }
            if known.is_empty() {
                self.resolver
                    .insert_syndication_blank(&key, &syndication)
                    .await?;
            }
        }

        for post in known {
            if let Some(original) = post.original {
                if !targets.contains(&original) {
                    targets.push(original);
                }
            }
        }
        Ok(targets)
    }

    fn refetch_due(&self, account: &AccountRecord) -> bool {
        account.author_url().is_some() && Utc::now() - account.last_hfeed_fetch >= self.refetch_period
    }

    /// Crawl the author's h-feed and record every relationship on it
    async fn crawl(&self, account: &mut AccountRecord) -> Result<(), AppError> {
        let Some(author_url) = account.author_url().map(str::to_string) else {
            return Ok(());
        };
        let key = account.key();
        let now = Utc::now();

        let entries = match self.crawler.fetch_entries(&author_url).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(account = %key, author_url, error = %error, "h-feed fetch failed");
                account.last_hfeed_fetch = now;
                self.db.mark_hfeed_fetched(&key, now, false).await?;
                return Ok(());
            }
        };

        let mut found_syndication = false;
        for entry in entries {
            let Some(original) = entry.url else {
                continue;
            };
            if entry.syndication.is_empty() {
                self.resolver.insert_original_blank(&key, &original).await?;
                continue;
            }
            for syndication in entry.syndication {
                let syndication = account.silo.canonicalize_syndication_url(&syndication);
                self.resolver.insert(&key, &syndication, &original).await?;
                found_syndication = true;
            }
        }

        tracing::debug!(account = %key, author_url, found_syndication, "Crawled h-feed");
        account.last_hfeed_fetch = now;
        self.db.mark_hfeed_fetched(&key, now, found_syndication).await?;
        Ok(())
    }
}
