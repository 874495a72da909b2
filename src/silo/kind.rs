//! Supported silo types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::PublishType;
use crate::error::AppError;

/// Domains that never accept webmentions. Mostly the silos themselves.
///
/// Subdomains are covered too, see [`in_webmention_blocklist`].
const WEBMENTION_BLOCKLIST: &[&str] = &[
    "about.me",
    "amazon.com",
    "amzn.com",
    "disqus.com",
    "example.com",
    "facebook.com",
    "flickr.com",
    "foursquare.com",
    "friendfeed.com",
    "getsatisfaction.com",
    "ggpht.com",
    "goodreads.com",
    "google.com",
    "instagr.am",
    "instagram.com",
    "intensedebate.com",
    "last.fm",
    "linkedin.com",
    "myspace.com",
    "openstreetmap.org",
    "quora.com",
    "stackexchange.com",
    "stackoverflow.com",
    "stumbleupon.com",
    "twitter.com",
    "typepad.com",
    "wikipedia.org",
    "ycombinator.com",
    "youtu.be",
    "youtube.com",
    // shortener and media hosts whose expanded URLs we get from silo entities
    "t.co",
    "twitpic.com",
    // category and tag links inside wordpress.com feed content
    "feeds.wordpress.com",
    "stats.wordpress.com",
];

/// Returns true if the domain or its parent domain is on the blocklist.
pub fn in_webmention_blocklist(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || WEBMENTION_BLOCKLIST.contains(&domain.as_str()) {
        return true;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() > 2 {
        let parent = labels[labels.len() - 2..].join(".");
        return WEBMENTION_BLOCKLIST.contains(&parent.as_str());
    }

    false
}

/// A third-party platform an account can be linked from.
///
/// This is a closed set: dispatch goes through this enum rather than
/// string lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiloKind {
    Blogger,
    Facebook,
    GooglePlus,
    Instagram,
    Tumblr,
    Twitter,
    WordPress,
}

impl SiloKind {
    pub const ALL: [SiloKind; 7] = [
        SiloKind::Blogger,
        SiloKind::Facebook,
        SiloKind::GooglePlus,
        SiloKind::Instagram,
        SiloKind::Tumblr,
        SiloKind::Twitter,
        SiloKind::WordPress,
    ];

    /// Short name used in URLs and storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blogger => "blogger",
            Self::Facebook => "facebook",
            Self::GooglePlus => "googleplus",
            Self::Instagram => "instagram",
            Self::Tumblr => "tumblr",
            Self::Twitter => "twitter",
            Self::WordPress => "wordpress",
        }
    }

    /// Human readable platform name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Blogger => "Blogger",
            Self::Facebook => "Facebook",
            Self::GooglePlus => "Google+",
            Self::Instagram => "Instagram",
            Self::Tumblr => "Tumblr",
            Self::Twitter => "Twitter",
            Self::WordPress => "WordPress.com",
        }
    }

    /// Hosted blog platforms deliver new posts through the feed notifier
    /// instead of being polled.
    pub fn is_blog(&self) -> bool {
        matches!(self, Self::Blogger | Self::Tumblr | Self::WordPress)
    }

    /// Silo-specific label for a publish type, e.g. a Twitter like is a "favorite".
    pub fn type_label(&self, publish_type: PublishType) -> &'static str {
        match (self, publish_type) {
            (Self::Twitter, PublishType::Post) => "tweet",
            (Self::Twitter, PublishType::Comment) => "@-reply",
            (Self::Twitter, PublishType::Repost) => "retweet",
            (Self::Twitter, PublishType::Like) => "favorite",
            (_, other) => other.as_str(),
        }
    }

    /// Standardize a syndicated URL so that different URLs for the same silo
    /// content compare equal during original post discovery.
    ///
    /// All silos collapse `http://`, `https://` and `www.` to `https://`.
    /// Facebook additionally rewrites `permalink.php` links to the
    /// `facebook.com/<user>/posts/<id>` form.
    pub fn canonicalize_syndication_url(&self, syndication_url: &str) -> String {
        let mut url = syndication_url.trim().to_string();

        if *self == Self::Facebook {
            if let Some(rewritten) = facebook_permalink_to_post(&url) {
                url = rewritten;
            }
        }

        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        match rest {
            Some(rest) => {
                let rest = rest.strip_prefix("www.").unwrap_or(rest);
                format!("https://{rest}")
            }
            None => url,
        }
    }
}

fn facebook_permalink_to_post(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if !(host == "facebook.com" || host.ends_with(".facebook.com")) {
        return None;
    }
    if parsed.path() != "/permalink.php" {
        return None;
    }

    let mut story_fbid = None;
    let mut user_id = None;
    for (name, value) in parsed.query_pairs() {
        match name.as_ref() {
            "story_fbid" => story_fbid = Some(value.into_owned()),
            "id" => user_id = Some(value.into_owned()),
            _ => {}
        }
    }

    Some(format!(
        "{}://{}/{}/posts/{}",
        parsed.scheme(),
        host,
        user_id?,
        story_fbid?
    ))
}

impl fmt::Display for SiloKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiloKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SiloKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown silo: {s}")))
    }
}
