//! Webmention target eligibility

use url::Url;

use crate::silo::in_webmention_blocklist;

/// Google Analytics tracking parameters stripped from targets
const UTM_PARAMS: &[&str] = &[
    "utm_campaign",
    "utm_content",
    "utm_medium",
    "utm_source",
    "utm_term",
];

/// Why a link will never get a webmention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    BadUrl,
    Blocklisted(String),
}

/// Decide whether `link` may receive a webmention.
///
/// # Returns
/// The cleaned target URL, with `utm_*` parameters removed
pub fn eligible_target(link: &str) -> Result<String, Ineligible> {
    let mut url = Url::parse(link.trim()).map_err(|_| Ineligible::BadUrl)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Ineligible::BadUrl);
    }
    let domain = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or(Ineligible::BadUrl)?;
    if in_webmention_blocklist(&domain) {
        return Err(Ineligible::Blocklisted(domain));
    }

    strip_utm_params(&mut url);
    Ok(url.into())
}

/// Remove `utm_*` query parameters, dropping the query entirely if nothing is left.
pub fn strip_utm_params(url: &mut Url) {
    if url.query().is_none() {
        return;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !UTM_PARAMS.contains(&name.as_ref()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

/// Lower-cased host of a URL
pub fn domain_of(link: &str) -> Option<String> {
    Url::parse(link)
        .ok()?
        .host_str()
        .map(str::to_ascii_lowercase)
}
