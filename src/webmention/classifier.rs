//! Link classification
//!
//! Pure functions that decide which of the five buckets each webmention
//! target belongs in. Nothing here does I/O.

use crate::data::{AccountRecord, LinkBucket, LinkSets};

use super::target::eligible_target;

/// Result of one webmention delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint acknowledged with a 2xx
    Delivered { endpoint: String },
    /// The target advertises no webmention endpoint
    NoEndpoint,
    /// The target is not an HTML page
    NotHtml,
    /// Malformed or blocklisted target
    Ineligible,
    /// HTTP error status from the target page or its endpoint
    Http { status: u16 },
    /// Connect failure, timeout or other transport problem
    Transport(String),
}

impl SendOutcome {
    /// Exhaustive mapping from delivery outcome to bucket.
    ///
    /// 408 and 429 are the only 4xx statuses treated as transient.
    pub fn bucket(&self) -> LinkBucket {
        match self {
            Self::Delivered { .. } => LinkBucket::Sent,
            Self::NoEndpoint | Self::NotHtml | Self::Ineligible => LinkBucket::Skipped,
            Self::Http { status: 408 | 429 } => LinkBucket::Error,
            Self::Http { status } if (400..500).contains(status) => LinkBucket::Failed,
            Self::Http { .. } => LinkBucket::Error,
            Self::Transport(_) => LinkBucket::Error,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.bucket() == LinkBucket::Error
    }
}

/// Partitions webmention targets into the delivery buckets.
pub struct LinkClassifier;

impl LinkClassifier {
    /// Initial link sets for newly discovered targets.
    ///
    /// Eligible links start `unsent`; ineligible ones are kept in `skipped`
    /// rather than dropped.
    pub fn partition<I, S>(links: I) -> LinkSets
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sets = LinkSets::default();
        for link in links {
            let link = link.as_ref().trim();
            if link.is_empty() {
                continue;
            }
            match eligible_target(link) {
                Ok(target) => {
                    // an earlier duplicate may have been skipped under its raw form
                    if sets.bucket_of(&target).is_none() {
                        sets.insert(target, LinkBucket::Unsent);
                    }
                }
                Err(_) => {
                    if sets.bucket_of(link).is_none() {
                        sets.insert(link.to_string(), LinkBucket::Skipped);
                    }
                }
            }
        }
        sets
    }

    /// Link sets for a post on one of the account's own sites.
    ///
    /// Links back to the account's own domains are excluded.
    pub fn partition_outbound<I, S>(account: &AccountRecord, links: I) -> LinkSets
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let links: Vec<String> = links
            .into_iter()
            .map(|link| link.as_ref().trim().to_string())
            .filter(|link| !account.is_self_link(link))
            .collect();
        Self::partition(links)
    }

    /// Apply one attempt's outcomes to the previous link sets.
    ///
    /// Every link with an outcome moves to that outcome's bucket; all other
    /// links keep theirs, so no discovered link is ever lost.
    pub fn classify<'a, I>(previous: &LinkSets, outcomes: I) -> LinkSets
    where
        I: IntoIterator<Item = &'a (String, SendOutcome)>,
    {
        let mut sets = previous.clone();
        for (link, outcome) in outcomes {
            sets.insert(link.clone(), outcome.bucket());
        }
        sets
    }
}
