//! Prometheus metrics endpoint

use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

/// GET /metrics in the Prometheus text format
async fn metrics_handler() -> Result<Response, AppError> {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {e}")))?;

    Ok((StatusCode::OK, [(CONTENT_TYPE, encoder.format_type())], body).into_response())
}

/// Router serving `/metrics`, usable under any state type
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(metrics_handler))
}
