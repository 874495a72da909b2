//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Polling
    pub static ref POLLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_polls_total", "Total number of poll tasks handled"),
        &["silo", "outcome"]
    ).expect("metric can be created");

    // Deliveries
    pub static ref DELIVERIES_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_deliveries_created_total", "Delivery records created by get-or-create"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref PROPAGATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_propagations_total", "Propagation attempts by final record status"),
        &["kind", "status"]
    ).expect("metric can be created");
    pub static ref LEASE_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "mentionbridge_lease_conflicts_total",
        "Propagation tasks that found the record leased by another worker"
    ).expect("metric can be created");
    pub static ref WEBMENTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_webmentions_total", "Webmention targets by classification bucket"),
        &["bucket"]
    ).expect("metric can be created");

    // Original post discovery
    pub static ref SYNDICATION_INSERTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_syndication_inserts_total", "Syndication relationships written"),
        &["form"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mentionbridge_errors_total", "Total number of errors returned to callers"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(POLLS_TOTAL.clone()))
        .expect("POLLS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_CREATED_TOTAL.clone()))
        .expect("DELIVERIES_CREATED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(PROPAGATIONS_TOTAL.clone()))
        .expect("PROPAGATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LEASE_CONFLICTS_TOTAL.clone()))
        .expect("LEASE_CONFLICTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(WEBMENTIONS_TOTAL.clone()))
        .expect("WEBMENTIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SYNDICATION_INSERTS_TOTAL.clone()))
        .expect("SYNDICATION_INSERTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
