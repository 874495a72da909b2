//! API layer
//!
//! HTTP handlers for:
//! - User actions and the push-feed notifier
//! - Metrics (Prometheus)

mod bridge;
mod dto;
pub mod metrics;

pub use dto::*;

pub use bridge::bridge_router;
pub use metrics::metrics_router;
