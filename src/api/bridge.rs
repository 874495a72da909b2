//! Bridge endpoints
//!
//! User actions (retry, poll now, feature removal, account linking), the
//! push-feed notifier ingress and publishing.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};

use super::dto::{
    AccountResponse, DeliveryQuery, DeliveryResponse, DisableFeatureRequest, FeedNotification,
    LinkAccountRequest, PollNowRequest, PublishQuery, PublishResponse, RetryRequest,
};
use crate::AppState;
use crate::data::{AccountKey, AccountRecord};
use crate::error::AppError;
use crate::service::PublishRequest;

/// Create bridge router
///
/// Routes:
/// - POST /retry - Reset a delivery record and propagate it again
/// - POST /poll-now - Poll an account immediately
/// - GET /deliveries?key= - Inspect a delivery record
/// - POST /feed/:silo/:id - Push-feed notifications for a hosted blog
/// - POST /accounts - Store a linked account
/// - GET /accounts/:silo/:id - Inspect an account
/// - POST /accounts/:silo/:id/disable - Remove one feature
/// - POST /publish - Publish a page into a silo
/// - GET /publishes?source_url= - Publish attempts for a page
pub fn bridge_router() -> Router<AppState> {
    Router::new()
        .route("/retry", post(retry))
        .route("/poll-now", post(poll_now))
        .route("/deliveries", get(get_delivery))
        .route("/feed/:silo/:id", post(feed_notification))
        .route("/accounts", post(link_account))
        .route("/accounts/:silo/:id", get(get_account))
        .route("/accounts/:silo/:id/disable", post(disable_feature))
        .route("/publish", post(publish))
        .route("/publishes", get(publish_history))
}

fn account_key(silo: &str, id: &str) -> Result<AccountKey, AppError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::Validation("account id is required".to_string()));
    }
    Ok(AccountKey::new(silo.parse()?, id))
}

/// POST /retry
async fn retry(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let record = state.deliveries.retry(&request.key).await?;
    Ok(Json(record.into()))
}

/// POST /poll-now
async fn poll_now(
    State(state): State<AppState>,
    Json(request): Json<PollNowRequest>,
) -> Result<StatusCode, AppError> {
    let key = account_key(&request.silo, &request.id)?;
    state.poller.poll_now(&key).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /deliveries?key=
async fn get_delivery(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let record = state.deliveries.get(&query.key).await?;
    Ok(Json(record.into()))
}

/// POST /feed/:silo/:id
///
/// Every item is processed even if an earlier one is rejected; the first
/// error is returned after the rest are stored.
async fn feed_notification(
    State(state): State<AppState>,
    Path((silo, id)): Path<(String, String)>,
    Json(notification): Json<FeedNotification>,
) -> Result<Json<Vec<DeliveryResponse>>, AppError> {
    let key = account_key(&silo, &id)?;
    let mut records = Vec::new();
    let mut first_error = None;

    for item in &notification.items {
        match state.deliveries.on_feed_item(&key, item).await {
            Ok(record) => records.push(record.into()),
            Err(error) => {
                tracing::warn!(account = %key, error = %error, "Rejected feed item");
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        Some(error) if records.is_empty() => Err(error),
        _ => Ok(Json(records)),
    }
}

/// POST /accounts
async fn link_account(
    State(state): State<AppState>,
    Json(request): Json<LinkAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let key = account_key(&request.silo, &request.id)?;
    let mut account = AccountRecord::new(key.silo, key.id);
    account.name = request.name;
    account.url = request.url;
    account.features = request.features.into_iter().collect();
    account.set_domain_urls(request.domain_urls);

    let account = state.accounts.create_or_update(account).await?;
    Ok((StatusCode::CREATED, Json(account.into())))
}

/// GET /accounts/:silo/:id
async fn get_account(
    State(state): State<AppState>,
    Path((silo, id)): Path<(String, String)>,
) -> Result<Json<AccountResponse>, AppError> {
    let key = account_key(&silo, &id)?;
    let account = state.accounts.get_account(&key).await?;
    Ok(Json(account.into()))
}

/// POST /accounts/:silo/:id/disable
async fn disable_feature(
    State(state): State<AppState>,
    Path((silo, id)): Path<(String, String)>,
    Json(request): Json<DisableFeatureRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let key = account_key(&silo, &id)?;
    let account = state.accounts.disable_feature(&key, request.feature).await?;
    Ok(Json(account.into()))
}

/// POST /publish
async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let publish = state.publishes.publish(request).await?;
    Ok(Json(publish.into()))
}

/// GET /publishes?source_url=
async fn publish_history(
    State(state): State<AppState>,
    Query(query): Query<PublishQuery>,
) -> Result<Json<Vec<PublishResponse>>, AppError> {
    let publishes = state.publishes.history(query.source_url.trim()).await?;
    Ok(Json(publishes.into_iter().map(Into::into).collect()))
}
