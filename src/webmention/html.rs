//! Lightweight HTML scanning
//!
//! Just enough tag and attribute matching to find links, `rel` values and
//! h-entry permalinks/syndication links. Not a general HTML parser.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

lazy_static! {
    static ref LINK_TAG: Regex =
        Regex::new(r#"(?is)<(a|link|area)\b([^>]*)>"#).expect("static regex is valid");
    static ref ANY_TAG: Regex =
        Regex::new(r#"(?is)<([a-z][a-z0-9]*)\b([^>]*)>"#).expect("static regex is valid");
    static ref ATTRIBUTE: Regex = Regex::new(
        r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#
    )
    .expect("static regex is valid");
}

/// An opening tag and its attributes
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub attrs: HashMap<String, String>,
}

impl Tag {
    fn parse(name: &str, raw_attrs: &str) -> Self {
        let attrs = ATTRIBUTE
            .captures_iter(raw_attrs)
            .filter_map(|caps| {
                let key = caps.get(1)?.as_str().to_ascii_lowercase();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| decode_entities(m.as_str()))
                    .unwrap_or_default();
                Some((key, value))
            })
            .collect();

        Self {
            name: name.to_ascii_lowercase(),
            attrs,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// True if the whitespace-separated attribute contains `token`
    pub fn has_token(&self, attr: &str, token: &str) -> bool {
        self.attr(attr)
            .is_some_and(|value| value.split_ascii_whitespace().any(|t| t.eq_ignore_ascii_case(token)))
    }
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// All `<a>`, `<link>` and `<area>` tags, in document order
pub fn link_tags(html: &str) -> Vec<Tag> {
    LINK_TAG
        .captures_iter(html)
        .map(|caps| Tag::parse(&caps[1], &caps[2]))
        .collect()
}

/// Absolute http(s) `href`s of every `<a>` tag, resolved against `base` when given
pub fn anchor_hrefs(html: &str, base: Option<&Url>) -> Vec<String> {
    link_tags(html)
        .into_iter()
        .filter(|tag| tag.name == "a")
        .filter_map(|tag| resolve(tag.attr("href")?, base))
        .collect()
}

/// First `<link>`/`<a>` whose `rel` contains `rel`, resolved against `base`
pub fn find_rel(html: &str, rel: &str, base: &Url) -> Option<String> {
    link_tags(html)
        .into_iter()
        .filter(|tag| tag.has_token("rel", rel))
        .find_map(|tag| {
            // an empty href points at the page itself
            let href = tag.attr("href")?;
            base.join(href.trim()).ok().map(String::from)
        })
}

fn resolve(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.into())
}

/// One h-entry found on a page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HEntry {
    /// First `u-url` in the entry
    pub url: Option<String>,
    /// `u-syndication` and `rel=syndication` links
    pub syndication: Vec<String>,
}

/// Scan an h-feed page for its h-entries.
///
/// Each entry spans from its opening `h-entry` element to the next one.
pub fn h_entries(html: &str, base: &Url) -> Vec<HEntry> {
    let starts: Vec<usize> = ANY_TAG
        .captures_iter(html)
        .filter(|caps| Tag::parse(&caps[1], &caps[2]).has_token("class", "h-entry"))
        .filter_map(|caps| caps.get(0).map(|m| m.start()))
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = starts.get(i + 1).copied().unwrap_or(html.len());
            parse_entry(&html[*start..end], base)
        })
        .collect()
}

fn parse_entry(fragment: &str, base: &Url) -> HEntry {
    let mut entry = HEntry::default();
    for tag in link_tags(fragment) {
        let Some(href) = tag.attr("href").and_then(|href| resolve(href, Some(base))) else {
            continue;
        };
        if entry.url.is_none() && tag.has_token("class", "u-url") {
            entry.url = Some(href.clone());
        }
        if (tag.has_token("class", "u-syndication") || tag.has_token("rel", "syndication"))
            && !entry.syndication.contains(&href)
        {
            entry.syndication.push(href);
        }
    }
    entry
}
