//! Common activity representation produced by silo adapters
//!
//! Adapters translate each platform's native API into these types; the
//! rest of the bridge only ever sees this shape.

use serde::{Deserialize, Serialize};

use crate::data::ResponseType;

/// One post on the silo, with the responses attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Tag URI, e.g. `tag:twitter.com,2013:1234`
    pub id: String,
    /// Silo permalink
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Whether the silo reports the post as publicly visible
    #[serde(default = "default_public")]
    pub public: bool,
    /// Original post links the adapter found in the post itself
    #[serde(default)]
    pub links: Vec<String>,
    /// Replies, likes, reposts and RSVPs
    #[serde(default)]
    pub responses: Vec<ActivityResponse>,
}

/// A reply, like, repost or RSVP on an [`Activity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResponse {
    /// Tag URI, unique per response
    pub id: String,
    pub response_type: ResponseType,
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_public")]
    pub public: bool,
    /// Author display name
    #[serde(default)]
    pub author: Option<String>,
}

fn default_public() -> bool {
    true
}

/// One page of recent activity.
#[derive(Debug, Clone, Default)]
pub struct ActivityPage {
    pub items: Vec<Activity>,
    /// ETag to send on the next fetch, if the silo supports it
    pub etag: Option<String>,
}

/// Incremental fetch state passed to the adapter.
#[derive(Debug, Clone, Default)]
pub struct PollCursor {
    pub etag: Option<String>,
    pub min_id: Option<String>,
}

/// A new post delivered by the push-feed notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    #[serde(rename = "permalinkUrl", alias = "permalink_url")]
    pub permalink_url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Explicit links the notifier extracted
    #[serde(default)]
    pub links: Vec<String>,
}

/// Split a tag URI into its domain and name parts.
///
/// `tag:twitter.com,2013:1234` -> `("twitter.com", "1234")`
pub fn parse_tag_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("tag:")?;
    let (authority, name) = rest.split_once(':')?;
    let domain = authority.split(',').next()?;
    if domain.is_empty() || name.is_empty() {
        return None;
    }
    Some((domain, name))
}

/// Build a tag URI in the fixed-year form used for all stored keys.
pub fn tag_uri(domain: &str, name: &str) -> String {
    format!("tag:{domain},2013:{name}")
}

/// Compare activity ids, numerically when both parse as integers.
pub fn activity_id_greater(candidate: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return true;
    };
    match (candidate.parse::<u128>(), current.parse::<u128>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate > current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_uri_splits_domain_and_name() {
        assert_eq!(
            parse_tag_uri("tag:twitter.com,2013:1234_5678"),
            Some(("twitter.com", "1234_5678"))
        );
        assert_eq!(parse_tag_uri("https://twitter.com/1"), None);
        assert_eq!(parse_tag_uri("tag:twitter.com,2013:"), None);
    }

    #[test]
    fn tag_uri_round_trips() {
        let uri = tag_uri("facebook.com", "99");
        assert_eq!(parse_tag_uri(&uri), Some(("facebook.com", "99")));
    }

    #[test]
    fn activity_ids_compare_numerically_when_possible() {
        assert!(activity_id_greater("10", Some("9")));
        assert!(!activity_id_greater("9", Some("10")));
        assert!(activity_id_greater("b", Some("a")));
        assert!(activity_id_greater("1", None));
    }

    #[test]
    fn feed_item_accepts_notifier_field_names() {
        let item: FeedItem = serde_json::from_value(serde_json::json!({
            "permalinkUrl": "https://blog.example.org/post",
            "content": "<a href=\"https://other.example.net/\">hi</a>"
        }))
        .unwrap();
        assert_eq!(
            item.permalink_url.as_deref(),
            Some("https://blog.example.org/post")
        );
        assert!(item.links.is_empty());
    }
}
