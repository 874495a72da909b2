//! Propagation worker
//!
//! Leases a delivery record, sends a webmention to each pending target,
//! reclassifies the links and persists the new state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::PropagationConfig;
use crate::data::{Database, DeliveryKind, DeliveryRecord, DeliveryStatus, LeaseOutcome};
use crate::error::AppError;
use crate::metrics::{LEASE_CONFLICTS_TOTAL, PROPAGATIONS_TOTAL, WEBMENTIONS_TOTAL};
use crate::webmention::{LinkClassifier, SendOutcome, WebmentionSender, eligible_target};

/// What a propagation task did
#[derive(Debug, Clone, PartialEq)]
pub enum Propagation {
    /// No record with that id
    Missing,
    AlreadyComplete,
    /// Another worker holds the lease
    Leased,
    /// The lease expired and was taken over before this round was saved
    LeaseLost,
    /// This worker ran a delivery round; the record as persisted
    Finished(DeliveryRecord),
}

fn is_public(record: &DeliveryRecord) -> bool {
    let public = |value: &serde_json::Value| value.get("public").and_then(|p| p.as_bool()) != Some(false);
    match &record.kind {
        DeliveryKind::Response {
            activities,
            response,
            ..
        } => public(response) && activities.iter().all(public),
        DeliveryKind::BlogPost { .. } => true,
    }
}

pub struct PropagationWorker {
    db: Arc<Database>,
    sender: Arc<dyn WebmentionSender>,
    config: PropagationConfig,
    base_url: String,
}

impl PropagationWorker {
    pub fn new(
        db: Arc<Database>,
        sender: Arc<dyn WebmentionSender>,
        config: PropagationConfig,
        base_url: String,
    ) -> Self {
        Self {
            db,
            sender,
            config,
            base_url,
        }
    }

    /// Run one propagation task for a delivery record.
    ///
    /// Any failure while holding the lease releases the record to `error`
    /// before the error is returned.
    pub async fn propagate(&self, id: &str) -> Result<Propagation, AppError> {
        let record = match self
            .db
            .lease_delivery(id, Utc::now(), self.config.lease_ttl())
            .await?
        {
            LeaseOutcome::Acquired(record) => record,
            LeaseOutcome::Missing => {
                tracing::warn!(delivery = id, "Propagate task for unknown delivery record");
                return Ok(Propagation::Missing);
            }
            LeaseOutcome::Complete => {
                tracing::debug!(delivery = id, "Already complete, dropping task");
                return Ok(Propagation::AlreadyComplete);
            }
            LeaseOutcome::Held { until } => {
                LEASE_CONFLICTS_TOTAL.inc();
                tracing::info!(delivery = id, %until, "Leased by another worker");
                return Ok(Propagation::Leased);
            }
        };

        let Some(lease) = record.leased_until else {
            return Err(AppError::Internal(anyhow::anyhow!(
                "lease on {id} acquired without an expiry"
            )));
        };

        tracing::info!(delivery = %record.label(), %lease, "Propagating");
        match self.deliver(record, lease).await {
            Ok(Some(record)) => Ok(Propagation::Finished(record)),
            Ok(None) => Ok(Propagation::LeaseLost),
            Err(error) => {
                tracing::error!(delivery = id, error = %error, "Propagation failed, releasing lease");
                if let Err(release_error) = self.db.release_delivery(id, lease).await {
                    tracing::error!(delivery = id, error = %release_error, "Could not release lease");
                }
                PROPAGATIONS_TOTAL.with_label_values(&["unknown", "released"]).inc();
                Err(error)
            }
        }
    }

    /// One delivery round. `None` if the lease was lost before saving.
    async fn deliver(
        &self,
        mut record: DeliveryRecord,
        lease: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, AppError> {
        let public = is_public(&record);
        let outcomes: Vec<(String, SendOutcome)> = if public {
            let source = record.source_url(&self.base_url).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("no source URL for {}", record.id))
            })?;

            let mut outcomes = Vec::new();
            for link in record.links.pending() {
                let outcome = match eligible_target(&link) {
                    Ok(target) => self.send_with_retries(&source, &target).await,
                    Err(reason) => {
                        tracing::debug!(link = %link, ?reason, "Target no longer eligible");
                        SendOutcome::Ineligible
                    }
                };
                WEBMENTIONS_TOTAL
                    .with_label_values(&[outcome.bucket().as_str()])
                    .inc();
                outcomes.push((link, outcome));
            }
            outcomes
        } else {
            tracing::info!(delivery = %record.id, "Not public, completing without sending");
            record
                .links
                .pending()
                .into_iter()
                .map(|link| (link, SendOutcome::Ineligible))
                .collect()
        };

        record.links = LinkClassifier::classify(&record.links, &outcomes);
        record.status = if public {
            record.links.settled_status()
        } else {
            DeliveryStatus::Complete
        };
        record.leased_until = None;
        record.updated_at = Utc::now();

        if !self.db.save_delivery(&record, lease).await? {
            LEASE_CONFLICTS_TOTAL.inc();
            tracing::warn!(delivery = %record.id, %lease, "Lease lost before save, discarding round");
            return Ok(None);
        }

        if outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, SendOutcome::Delivered { .. }))
        {
            self.db
                .mark_webmention_sent(&record.account, record.updated_at)
                .await?;
        }

        PROPAGATIONS_TOTAL
            .with_label_values(&[record.kind.as_str(), record.status.as_str()])
            .inc();
        tracing::info!(
            delivery = %record.id,
            status = record.status.as_str(),
            sent = record.links.sent.len(),
            error = record.links.error.len(),
            failed = record.links.failed.len(),
            skipped = record.links.skipped.len(),
            "Propagation round finished"
        );

        Ok(Some(record))
    }

    /// Send, retrying transient outcomes with linear backoff
    async fn send_with_retries(&self, source: &str, target: &str) -> SendOutcome {
        let attempts = self.config.max_send_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.sender.send(source, target).await;
            if !outcome.is_transient() || attempt >= attempts {
                return outcome;
            }

            tracing::debug!(link = target, attempt, ?outcome, "Transient failure, retrying");
            tokio::time::sleep(Duration::from_millis(
                self.config.retry_backoff_ms * u64::from(attempt),
            ))
            .await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AccountRecord, Feature, LinkSets, ResponseType};
    use crate::silo::SiloKind;
    use crate::webmention::MockWebmentionSender;
    use tempfile::TempDir;

    const TARGET: &str = "https://bob.example.net/2014/post";
    const RESPONSE_ID: &str = "tag:twitter.com,2013:100_200";

    async fn setup() -> (Arc<Database>, AccountRecord, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let mut account = AccountRecord::new(SiloKind::Twitter, "alice");
        account.features.insert(Feature::Listen);
        db.upsert_account(&account).await.unwrap();
        (Arc::new(db), account, temp_dir)
    }

    async fn store_response(db: &Database, account: &AccountRecord, public: bool) {
        let record = DeliveryRecord::response(
            RESPONSE_ID,
            account.key(),
            ResponseType::Comment,
            vec![serde_json::json!({"id": "tag:twitter.com,2013:100"})],
            serde_json::json!({"id": RESPONSE_ID, "public": public}),
            LinkSets::with_unsent([TARGET]),
        );
        db.get_or_create_delivery(&record).await.unwrap();
    }

    fn worker(db: Arc<Database>, sender: MockWebmentionSender) -> PropagationWorker {
        PropagationWorker::new(
            db,
            Arc::new(sender),
            PropagationConfig {
                retry_backoff_ms: 0,
                ..PropagationConfig::default()
            },
            "https://bridge.example.com".to_string(),
        )
    }

    fn finished(result: Propagation) -> DeliveryRecord {
        match result {
            Propagation::Finished(record) => record,
            other => panic!("expected a finished round, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_send_completes_record() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;

        let mut sender = MockWebmentionSender::new();
        sender
            .expect_send()
            .withf(|source, target| {
                source == "https://bridge.example.com/comment/twitter/alice/100/100_200"
                    && target == TARGET
            })
            .times(1)
            .returning(|_, _| SendOutcome::Delivered {
                endpoint: "https://bob.example.net/wm".to_string(),
            });

        let record = finished(worker(db.clone(), sender).propagate(RESPONSE_ID).await.unwrap());
        assert_eq!(record.status, DeliveryStatus::Complete);
        assert!(record.links.sent.contains(TARGET));
        assert!(record.links.unsent.is_empty());

        let stored = db.get_account(&account.key()).await.unwrap().unwrap();
        assert!(stored.last_webmention_sent.is_some());

        // a duplicate task is acknowledged without sending
        let again = worker(db.clone(), MockWebmentionSender::new())
            .propagate(RESPONSE_ID)
            .await
            .unwrap();
        assert_eq!(again, Propagation::AlreadyComplete);
    }

    #[tokio::test]
    async fn permanent_rejection_parks_record() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;

        let mut sender = MockWebmentionSender::new();
        sender
            .expect_send()
            .times(1)
            .returning(|_, _| SendOutcome::Http { status: 404 });

        let record = finished(worker(db.clone(), sender).propagate(RESPONSE_ID).await.unwrap());
        assert_eq!(record.status, DeliveryStatus::Processing);
        assert_eq!(record.leased_until, None);
        assert!(record.links.failed.contains(TARGET));

        let stored = db.get_account(&account.key()).await.unwrap().unwrap();
        assert!(stored.last_webmention_sent.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_worker() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;

        let mut calls = 0;
        let mut sender = MockWebmentionSender::new();
        sender.expect_send().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                SendOutcome::Http { status: 503 }
            } else {
                SendOutcome::Delivered {
                    endpoint: "https://bob.example.net/wm".to_string(),
                }
            }
        });

        let record = finished(worker(db, sender).propagate(RESPONSE_ID).await.unwrap());
        assert_eq!(record.status, DeliveryStatus::Complete);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_record_in_error() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;

        let mut sender = MockWebmentionSender::new();
        sender
            .expect_send()
            .times(3)
            .returning(|_, _| SendOutcome::Transport("connection refused".to_string()));

        let record = finished(worker(db.clone(), sender).propagate(RESPONSE_ID).await.unwrap());
        assert_eq!(record.status, DeliveryStatus::Error);
        assert!(record.links.error.contains(TARGET));

        let stored = db.get_delivery(RESPONSE_ID).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Error);
        assert_eq!(stored.leased_until, None);
    }

    #[tokio::test]
    async fn live_lease_blocks_second_worker() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;
        db.lease_delivery(RESPONSE_ID, Utc::now(), Duration::from_secs(600))
            .await
            .unwrap();

        let result = worker(db, MockWebmentionSender::new())
            .propagate(RESPONSE_ID)
            .await
            .unwrap();
        assert_eq!(result, Propagation::Leased);
    }

    #[tokio::test]
    async fn non_public_response_completes_without_sending() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, false).await;

        let record = finished(
            worker(db, MockWebmentionSender::new())
                .propagate(RESPONSE_ID)
                .await
                .unwrap(),
        );
        assert_eq!(record.status, DeliveryStatus::Complete);
        assert!(record.links.skipped.contains(TARGET));
    }

    /// Sender that lets another worker take the lease over mid-round
    struct OverrunSender {
        db: Arc<Database>,
    }

    #[async_trait::async_trait]
    impl WebmentionSender for OverrunSender {
        async fn send(&self, _source: &str, _target: &str) -> SendOutcome {
            let later = Utc::now() + chrono::Duration::hours(1);
            let outcome = self
                .db
                .lease_delivery(RESPONSE_ID, later, Duration::from_secs(600))
                .await
                .unwrap();
            assert!(matches!(outcome, LeaseOutcome::Acquired(_)));
            SendOutcome::Delivered {
                endpoint: "https://bob.example.net/wm".to_string(),
            }
        }

        async fn discover_endpoint(&self, _url: &str) -> Result<Option<String>, AppError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn round_is_discarded_when_lease_is_taken_over() {
        let (db, account, _temp_dir) = setup().await;
        store_response(&db, &account, true).await;

        let worker = PropagationWorker::new(
            db.clone(),
            Arc::new(OverrunSender { db: db.clone() }),
            PropagationConfig::default(),
            "https://bridge.example.com".to_string(),
        );
        let result = worker.propagate(RESPONSE_ID).await.unwrap();
        assert_eq!(result, Propagation::LeaseLost);

        // the new holder's state is untouched
        let stored = db.get_delivery(RESPONSE_ID).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Processing);
        assert!(stored.leased_until.is_some());
        assert!(stored.links.unsent.contains(TARGET));
        assert!(stored.links.sent.is_empty());
    }

    #[tokio::test]
    async fn unknown_record_is_reported_missing() {
        let (db, _account, _temp_dir) = setup().await;
        let result = worker(db, MockWebmentionSender::new())
            .propagate("tag:twitter.com,2013:nothing")
            .await
            .unwrap();
        assert_eq!(result, Propagation::Missing);
    }
}
