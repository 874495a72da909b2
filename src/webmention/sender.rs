//! Webmention endpoint discovery and sending
//!
//! Endpoints are discovered from the target page's `Link` header or its
//! first `rel=webmention` element, then sent a form-encoded
//! `source`/`target` POST.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, LINK};
use tokio::sync::RwLock;
use url::Url;

use super::classifier::SendOutcome;
use super::html;
use super::target::domain_of;
use crate::config::HttpConfig;
use crate::error::AppError;

/// Default lifetime of a per-domain discovery result
const ENDPOINT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Sends webmentions on behalf of the propagation worker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebmentionSender: Send + Sync {
    /// Deliver one webmention. Never fails: every problem is an outcome.
    async fn send(&self, source: &str, target: &str) -> SendOutcome;

    /// Discover the endpoint a page advertises, bypassing any cache.
    ///
    /// # Returns
    /// `Ok(None)` if the page advertises no endpoint
    async fn discover_endpoint(&self, url: &str) -> Result<Option<String>, AppError>;
}

/// Cached discovery result
#[derive(Debug, Clone)]
struct CachedEndpoint {
    /// `None` means the domain advertised no endpoint
    endpoint: Option<String>,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedEndpoint {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Per-domain endpoint cache
///
/// Negative results are cached too, so domains without webmention support
/// are not refetched on every response.
pub struct EndpointCache {
    cache: Arc<RwLock<HashMap<String, CachedEndpoint>>>,
    default_ttl: Duration,
}

impl EndpointCache {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(ENDPOINT_CACHE_TTL),
        }
    }

    /// `Some(result)` on a valid cache hit. An expired entry is dropped.
    pub async fn get(&self, domain: &str) -> Option<Option<String>> {
        {
            let cache = self.cache.read().await;
            match cache.get(domain) {
                Some(cached) if cached.is_valid() => return Some(cached.endpoint.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut cache = self.cache.write().await;
        // another task may have refreshed it between the two locks
        match cache.get(domain) {
            Some(cached) if cached.is_valid() => Some(cached.endpoint.clone()),
            Some(_) => {
                cache.remove(domain);
                None
            }
            None => None,
        }
    }

    /// Store a lookup result and sweep out every expired entry.
    pub async fn insert(&self, domain: &str, endpoint: Option<String>) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, cached| cached.is_valid());
        if cache.len() < before {
            tracing::debug!(
                evicted = before - cache.len(),
                "Evicted expired webmention endpoints"
            );
        }
        cache.insert(
            domain.to_string(),
            CachedEndpoint {
                endpoint,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn invalidate(&self, domain: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(domain);
        tracing::debug!(domain, "Invalidated webmention endpoint cache");
    }
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Endpoint from a `Link` header, e.g. `<https://x/wm>; rel="webmention"`
fn endpoint_from_link_header(headers: &HeaderMap, base: &Url) -> Option<String> {
    for value in headers.get_all(LINK) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for link in value.split(',') {
            let mut parts = link.split(';');
            let Some(target) = parts
                .next()
                .map(str::trim)
                .and_then(|t| t.strip_prefix('<'))
                .and_then(|t| t.strip_suffix('>'))
            else {
                continue;
            };
            let is_webmention = parts.any(|param| {
                let Some((name, rels)) = param.split_once('=') else {
                    return false;
                };
                name.trim().eq_ignore_ascii_case("rel")
                    && rels
                        .trim()
                        .trim_matches('"')
                        .split_ascii_whitespace()
                        .any(|rel| rel.eq_ignore_ascii_case("webmention"))
            });
            if is_webmention {
                if let Ok(endpoint) = base.join(target) {
                    return Some(endpoint.into());
                }
            }
        }
    }
    None
}

/// Outcome of fetching a target page for discovery
enum Discovery {
    Endpoint(String),
    Missing,
    NotHtml,
}

/// reqwest-backed [`WebmentionSender`]
pub struct HttpWebmentionSender {
    client: reqwest::Client,
    cache: EndpointCache,
}

impl HttpWebmentionSender {
    pub fn new(client: reqwest::Client, cache: EndpointCache) -> Self {
        Self { client, cache }
    }

    /// Build a client with the configured timeout and user agent
    pub fn from_config(config: &HttpConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::new(client, EndpointCache::default()))
    }

    async fn fetch_and_discover(&self, url: &str) -> Result<Discovery, reqwest::Error> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let final_url = response.url().clone();

        if let Some(endpoint) = endpoint_from_link_header(response.headers(), &final_url) {
            return Ok(Discovery::Endpoint(endpoint));
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/html"));
        if !is_html {
            return Ok(Discovery::NotHtml);
        }

        let body = response.text().await?;
        Ok(match html::find_rel(&body, "webmention", &final_url) {
            Some(endpoint) => Discovery::Endpoint(endpoint),
            None => Discovery::Missing,
        })
    }
}

fn outcome_from_error(error: &reqwest::Error) -> SendOutcome {
    match error.status() {
        Some(status) => SendOutcome::Http {
            status: status.as_u16(),
        },
        None => SendOutcome::Transport(error.to_string()),
    }
}

#[async_trait]
impl WebmentionSender for HttpWebmentionSender {
    async fn send(&self, source: &str, target: &str) -> SendOutcome {
        let Some(domain) = domain_of(target) else {
            return SendOutcome::Ineligible;
        };

        let endpoint = match self.cache.get(&domain).await {
            Some(Some(endpoint)) => endpoint,
            Some(None) => {
                tracing::debug!(link = target, "Cached: no webmention endpoint");
                return SendOutcome::NoEndpoint;
            }
            None => match self.fetch_and_discover(target).await {
                Ok(Discovery::Endpoint(endpoint)) => {
                    self.cache.insert(&domain, Some(endpoint.clone())).await;
                    endpoint
                }
                Ok(Discovery::Missing) => {
                    self.cache.insert(&domain, None).await;
                    return SendOutcome::NoEndpoint;
                }
                Ok(Discovery::NotHtml) => return SendOutcome::NotHtml,
                Err(error) => {
                    tracing::warn!(link = target, error = %error, "Webmention discovery failed");
                    return outcome_from_error(&error);
                }
            },
        };

        tracing::debug!(source, link = target, endpoint = %endpoint, "Sending webmention");
        let result = self
            .client
            .post(&endpoint)
            .form(&[("source", source), ("target", target)])
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => SendOutcome::Delivered { endpoint },
            Err(error) => {
                tracing::warn!(link = target, endpoint = %endpoint, error = %error, "Webmention rejected");
                // rediscover next time, the endpoint may have moved
                self.cache.invalidate(&domain).await;
                outcome_from_error(&error)
            }
        }
    }

    async fn discover_endpoint(&self, url: &str) -> Result<Option<String>, AppError> {
        match self.fetch_and_discover(url).await? {
            Discovery::Endpoint(endpoint) => Ok(Some(endpoint)),
            Discovery::Missing | Discovery::NotHtml => Ok(None),
        }
    }
}
