//! Poll task
//!
//! Fetches recent silo activity for one account, turns new responses into
//! delivery records and schedules the next poll.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::discovery::OriginalPostDiscovery;
use crate::data::{
    AccountKey, AccountRecord, AccountStatus, Database, DeliveryRecord, DeliveryStatus, Feature,
    PollStart,
};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_CREATED_TOTAL, POLLS_TOTAL};
use crate::scheduler::{Cadence, next_poll_due, with_jitter};
use crate::silo::{
    Activity, ActivityResponse, PollCursor, SiloClients, SiloError, activity_id_greater,
    parse_tag_uri,
};
use crate::tasks::{Task, TaskDispatcher};
use crate::webmention::LinkClassifier;

/// What a poll task did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Account missing, disabled or without `listen`
    Inactive,
    /// Superseded by a newer poll
    Duplicate,
    /// Poll finished; number of delivery records created
    Polled { created: usize },
    /// The silo revoked our access; features removed
    Deauthorized,
    /// Silo or discovery failure; the account is in error
    Failed,
}

pub struct Poller {
    db: Arc<Database>,
    silos: Arc<SiloClients>,
    discovery: Arc<OriginalPostDiscovery>,
    dispatcher: Arc<dyn TaskDispatcher>,
    cadence: Cadence,
    jitter_percent: u8,
}

impl Poller {
    pub fn new(
        db: Arc<Database>,
        silos: Arc<SiloClients>,
        discovery: Arc<OriginalPostDiscovery>,
        dispatcher: Arc<dyn TaskDispatcher>,
        cadence: Cadence,
        jitter_percent: u8,
    ) -> Self {
        Self {
            db,
            silos,
            discovery,
            dispatcher,
            cadence,
            jitter_percent,
        }
    }

    /// Run one poll task.
    ///
    /// `last_polled` is the token the task was dispatched with.
    pub async fn poll(
        &self,
        key: &AccountKey,
        last_polled: DateTime<Utc>,
    ) -> Result<PollOutcome, AppError> {
        let silo = key.silo.as_str();
        let mut account = match self.db.begin_poll(key, last_polled, Utc::now()).await? {
            PollStart::Started(account) => account,
            PollStart::Missing | PollStart::Inactive => {
                tracing::info!(account = %key, "Account missing or not listening, dropping poll");
                POLLS_TOTAL.with_label_values(&[silo, "inactive"]).inc();
                return Ok(PollOutcome::Inactive);
            }
            PollStart::Duplicate => {
                tracing::warn!(account = %key, %last_polled, "Duplicate poll task, dropping");
                POLLS_TOTAL.with_label_values(&[silo, "duplicate"]).inc();
                return Ok(PollOutcome::Duplicate);
            }
        };

        tracing::info!(account = %account.label(), "Polling");
        let outcome = match self.poll_account(&mut account).await {
            Ok(created) => {
                tracing::info!(account = %key, created, "Poll finished");
                POLLS_TOTAL.with_label_values(&[silo, "ok"]).inc();
                PollOutcome::Polled { created }
            }
            Err(AppError::Silo(SiloError::Deauthorized(message))) => {
                tracing::warn!(account = %key, reason = %message, "Deauthorized, disabling account");
                self.db
                    .remove_features(key, &[Feature::Listen, Feature::Publish], true)
                    .await?;
                self.silos.forget(key).await;
                POLLS_TOTAL.with_label_values(&[silo, "deauthorized"]).inc();
                return Ok(PollOutcome::Deauthorized);
            }
            Err(error) => {
                let outcome = match &error {
                    AppError::Silo(SiloError::RateLimited) => "rate_limited",
                    _ => "error",
                };
                tracing::error!(account = %key, error = %error, "Poll failed");
                self.db.set_account_status(key, AccountStatus::Error).await?;
                POLLS_TOTAL.with_label_values(&[silo, outcome]).inc();
                PollOutcome::Failed
            }
        };

        self.reschedule(key).await?;
        Ok(outcome)
    }

    /// Dispatch an immediate poll carrying the current token
    pub async fn poll_now(&self, key: &AccountKey) -> Result<(), AppError> {
        let account = self.db.get_account(key).await?.ok_or(AppError::NotFound)?;
        if !account.has_feature(Feature::Listen) {
            return Err(AppError::Validation(format!(
                "{} does not have the listen feature",
                account.key()
            )));
        }

        self.dispatcher
            .dispatch(
                Task::Poll {
                    account: account.key(),
                    last_polled: account.last_polled,
                },
                None,
            )
            .await
    }

    /// Fetch, discover and store. Returns the number of records created.
    async fn poll_account(&self, account: &mut AccountRecord) -> Result<usize, AppError> {
        let key = account.key();
        let adapter = self.silos.client(account).await?;
        let cursor = PollCursor {
            etag: account.last_activities_etag.clone(),
            min_id: account.last_activity_id.clone(),
        };
        let page = adapter.fetch_recent_activity(account, &cursor).await?;

        let mut last_activity_id = account.last_activity_id.clone();
        for activity in &page.items {
            let native_id = parse_tag_uri(&activity.id)
                .map(|(_, id)| id)
                .unwrap_or(activity.id.as_str());
            if activity_id_greater(native_id, last_activity_id.as_deref()) {
                last_activity_id = Some(native_id.to_string());
            }
        }

        let response_ids: Vec<String> = page
            .items
            .iter()
            .filter(|activity| activity.public)
            .flat_map(|activity| &activity.responses)
            .filter(|response| response.public)
            .map(|response| response.id.clone())
            .collect();
        let existing = self.db.existing_delivery_ids(&response_ids).await?;

        let mut created = 0;
        for activity in page.items.iter().filter(|activity| activity.public) {
            let fresh: Vec<&ActivityResponse> = activity
                .responses
                .iter()
                .filter(|response| response.public && !existing.contains(&response.id))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            created += self.store_responses(account, activity, &fresh).await?;
        }

        self.db
            .record_poll_success(&key, page.etag.as_deref(), last_activity_id.as_deref())
            .await?;
        Ok(created)
    }

    async fn store_responses(
        &self,
        account: &mut AccountRecord,
        activity: &Activity,
        responses: &[&ActivityResponse],
    ) -> Result<usize, AppError> {
        let targets = self.discovery.targets_for(account, activity).await?;
        let links = LinkClassifier::partition(&targets);

        let mut stored_activity = activity.clone();
        stored_activity.responses.clear();
        let activity_json =
            serde_json::to_value(&stored_activity).map_err(|e| AppError::Internal(e.into()))?;

        let mut created = 0;
        let mut seen = HashSet::new();
        for response in responses {
            if !seen.insert(&response.id) {
                continue;
            }
            let response_json =
                serde_json::to_value(response).map_err(|e| AppError::Internal(e.into()))?;
            let record = DeliveryRecord::response(
                response.id.clone(),
                account.key(),
                response.response_type,
                vec![activity_json.clone()],
                response_json,
                links.clone(),
            );

            let (stored, was_created) = self.db.get_or_create_delivery(&record).await?;
            if !was_created {
                continue;
            }
            created += 1;
            DELIVERIES_CREATED_TOTAL.with_label_values(&["response"]).inc();
            tracing::debug!(
                delivery = %stored.label(),
                unsent = stored.links.unsent.len(),
                skipped = stored.links.skipped.len(),
                "Created delivery record"
            );
            if stored.status == DeliveryStatus::New {
                self.dispatcher
                    .dispatch(Task::Propagate { id: stored.id }, None)
                    .await?;
            }
        }
        Ok(created)
    }

    /// Dispatch the next poll after the cadence delay, unless the account
    /// stopped listening.
    async fn reschedule(&self, key: &AccountKey) -> Result<(), AppError> {
        let Some(account) = self.db.get_account(key).await? else {
            return Ok(());
        };
        if account.is_disabled() || !account.has_feature(Feature::Listen) {
            return Ok(());
        }

        let delay = with_jitter(
            next_poll_due(&account, Utc::now(), &self.cadence),
            self.jitter_percent,
            &mut rand::thread_rng(),
        );
        tracing::debug!(account = %key, delay_secs = delay.as_secs(), "Next poll scheduled");
        self.dispatcher
            .dispatch(
                Task::Poll {
                    account: key.clone(),
                    last_polled: account.last_polled,
                },
                Some(delay),
            )
            .await
    }
}
