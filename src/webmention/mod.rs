//! Webmention delivery
//!
//! Handles:
//! - Target eligibility and cleanup
//! - Link classification into the five delivery buckets
//! - Endpoint discovery and sending over HTTP
//! - HTML scanning for links and h-entries

mod classifier;
pub mod html;
mod sender;
mod target;

pub use classifier::{LinkClassifier, SendOutcome};
pub use sender::{EndpointCache, HttpWebmentionSender, WebmentionSender};
pub use target::{Ineligible, domain_of, eligible_target, strip_utm_params};

#[cfg(test)]
pub use sender::MockWebmentionSender;
