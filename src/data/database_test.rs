//! Database tests

use super::*;
use crate::silo::SiloKind;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

/// Helper to store a listening account
async fn create_account(db: &Database) -> AccountRecord {
    let mut account = AccountRecord::new(SiloKind::Twitter, "alice");
    account.name = Some("Alice".to_string());
    account.features.insert(Feature::Listen);
    account.set_domain_urls(vec!["https://alice.example.org/".to_string()]);
    db.upsert_account(&account).await.unwrap();
    account
}

fn response_record(account: &AccountRecord, id: &str, links: &[&str]) -> DeliveryRecord {
    DeliveryRecord::response(
        id,
        account.key(),
        ResponseType::Comment,
        vec![serde_json::json!({"id": "tag:twitter.com,2013:100"})],
        serde_json::json!({"id": id, "content": "nice post"}),
        LinkSets::with_unsent(links.iter().copied()),
    )
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

// =============================================================================
// Accounts
// =============================================================================

#[tokio::test]
async fn test_account_upsert_and_get() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;

    let retrieved = db.get_account(&account.key()).await.unwrap().unwrap();
    assert_eq!(retrieved.name.as_deref(), Some("Alice"));
    assert_eq!(retrieved.domains, vec!["alice.example.org".to_string()]);
    assert!(retrieved.has_feature(Feature::Listen));
    assert_eq!(retrieved.last_polled, epoch());
    assert_eq!(retrieved.status, AccountStatus::Enabled);

    let missing = AccountKey::new(SiloKind::Twitter, "nobody");
    assert!(db.get_account(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_or_update_merges_features_and_keeps_history() {
    let (db, _temp_dir) = create_test_db().await;
    let mut original = create_account(&db).await;
    let sent_at = Utc::now() - ChronoDuration::days(3);
    original.last_webmention_sent = Some(sent_at);
    db.upsert_account(&original).await.unwrap();

    let mut relinked = AccountRecord::new(SiloKind::Twitter, "alice");
    relinked.features.insert(Feature::Publish);
    let merged = db.create_or_update_account(&relinked).await.unwrap();

    assert!(merged.has_feature(Feature::Listen));
    assert!(merged.has_feature(Feature::Publish));
    assert_eq!(merged.created_at, original.created_at);
    assert_eq!(merged.last_webmention_sent, Some(sent_at));

    let stored = db.get_account(&original.key()).await.unwrap().unwrap();
    assert_eq!(stored.features, merged.features);
}

#[tokio::test]
async fn test_remove_features_disables_when_empty() {
    let (db, _temp_dir) = create_test_db().await;
    let mut account = create_account(&db).await;
    account.features.insert(Feature::Publish);
    db.upsert_account(&account).await.unwrap();

    let updated = db
        .remove_features(&account.key(), &[Feature::Listen], false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, AccountStatus::Enabled);
    assert!(!updated.has_feature(Feature::Listen));

    let updated = db
        .remove_features(&account.key(), &[Feature::Publish], false)
        .await
        .unwrap()
        .unwrap();
    assert!(updated.features.is_empty());
    assert_eq!(updated.status, AccountStatus::Disabled);

    let missing = AccountKey::new(SiloKind::Facebook, "ghost");
    assert!(
        db.remove_features(&missing, &[Feature::Listen], true)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_begin_poll_dedupes_on_last_polled_token() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let now = Utc::now();

    let stale = account.last_polled + ChronoDuration::seconds(1);
    assert_eq!(
        db.begin_poll(&account.key(), stale, now).await.unwrap(),
        PollStart::Duplicate
    );

    let started = db
        .begin_poll(&account.key(), account.last_polled, now)
        .await
        .unwrap();
    let PollStart::Started(polled) = started else {
        panic!("expected poll to start, got {started:?}");
    };
    assert_eq!(polled.last_poll_attempt, now);

    db.record_poll_success(&account.key(), Some("etag-1"), Some("42"))
        .await
        .unwrap();
    let stored = db.get_account(&account.key()).await.unwrap().unwrap();
    assert_eq!(stored.last_polled, now);
    assert_eq!(stored.last_activities_etag.as_deref(), Some("etag-1"));
    assert_eq!(stored.last_activity_id.as_deref(), Some("42"));

    // the old token is now stale
    assert_eq!(
        db.begin_poll(&account.key(), account.last_polled, Utc::now())
            .await
            .unwrap(),
        PollStart::Duplicate
    );
}

#[tokio::test]
async fn test_begin_poll_skips_inactive_accounts() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    db.remove_features(&account.key(), &[Feature::Listen], true)
        .await
        .unwrap();

    assert_eq!(
        db.begin_poll(&account.key(), account.last_polled, Utc::now())
            .await
            .unwrap(),
        PollStart::Inactive
    );
    assert_eq!(
        db.begin_poll(
            &AccountKey::new(SiloKind::Twitter, "nobody"),
            epoch(),
            Utc::now()
        )
        .await
        .unwrap(),
        PollStart::Missing
    );
}

// =============================================================================
// Deliveries
// =============================================================================

#[tokio::test]
async fn test_get_or_create_is_first_writer_wins() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let id = "tag:twitter.com,2013:200";

    let first = response_record(&account, id, &["https://target.example.net/a"]);
    let (stored, created) = db.get_or_create_delivery(&first).await.unwrap();
    assert!(created);
    assert_eq!(stored.status, DeliveryStatus::New);

    let second = response_record(&account, id, &["https://other.example.net/b"]);
    let (again, created) = db.get_or_create_delivery(&second).await.unwrap();
    assert!(!created);
    assert_eq!(again.links, first.links);

    let fetched = db.get_delivery(id).await.unwrap().unwrap();
    assert_eq!(fetched.links.unsent.len(), 1);
    assert!(fetched.links.unsent.contains("https://target.example.net/a"));
}

#[tokio::test]
async fn test_get_or_create_without_pending_links_is_complete() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;

    let mut record = response_record(&account, "tag:twitter.com,2013:201", &[]);
    record
        .links
        .insert("https://twitter.com/bob".to_string(), LinkBucket::Skipped);
    let (stored, created) = db.get_or_create_delivery(&record).await.unwrap();
    assert!(created);
    assert_eq!(stored.status, DeliveryStatus::Complete);
}

#[tokio::test]
async fn test_get_or_create_parks_failed_only_records_like_the_worker() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;

    let mut record = response_record(&account, "tag:twitter.com,2013:202", &[]);
    record
        .links
        .insert("https://bob.example.net/post".to_string(), LinkBucket::Sent);
    record
        .links
        .insert("https://carol.example.net/gone".to_string(), LinkBucket::Failed);
    let expected = record.links.settled_status();

    let (stored, created) = db.get_or_create_delivery(&record).await.unwrap();
    assert!(created);
    assert_eq!(stored.status, expected);
    assert_eq!(stored.status, DeliveryStatus::Processing);
    assert_eq!(stored.leased_until, None);

    // parked, so any worker may pick it up without a live lease in the way
    let outcome = db
        .lease_delivery(&stored.id, Utc::now(), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(matches!(outcome, LeaseOutcome::Acquired(_)));
}

#[tokio::test]
async fn test_lease_expires_after_ttl() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let id = "tag:twitter.com,2013:300";
    db.get_or_create_delivery(&response_record(&account, id, &["https://t.example.net/"]))
        .await
        .unwrap();

    let t = Utc::now();
    let ttl = Duration::from_secs(10 * 60);

    let first = db.lease_delivery(id, t, ttl).await.unwrap();
    let LeaseOutcome::Acquired(leased) = first else {
        panic!("expected lease, got {first:?}");
    };
    assert_eq!(leased.status, DeliveryStatus::Processing);
    assert_eq!(leased.leased_until, Some(t + ChronoDuration::minutes(10)));

    let at_five = db
        .lease_delivery(id, t + ChronoDuration::minutes(5), ttl)
        .await
        .unwrap();
    assert!(matches!(at_five, LeaseOutcome::Held { .. }));

    let at_eleven = db
        .lease_delivery(id, t + ChronoDuration::minutes(11), ttl)
        .await
        .unwrap();
    assert!(matches!(at_eleven, LeaseOutcome::Acquired(_)));
}

#[tokio::test]
async fn test_lease_refuses_complete_and_missing_records() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let record = response_record(&account, "tag:twitter.com,2013:301", &[]);
    db.get_or_create_delivery(&record).await.unwrap();

    let ttl = Duration::from_secs(60);
    assert_eq!(
        db.lease_delivery(&record.id, Utc::now(), ttl).await.unwrap(),
        LeaseOutcome::Complete
    );
    assert_eq!(
        db.lease_delivery("tag:twitter.com,2013:none", Utc::now(), ttl)
            .await
            .unwrap(),
        LeaseOutcome::Missing
    );
}

#[tokio::test]
async fn test_save_and_release_only_apply_while_processing() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let id = "tag:twitter.com,2013:302";
    let (record, _) = db
        .get_or_create_delivery(&response_record(&account, id, &["https://t.example.net/"]))
        .await
        .unwrap();

    // not leased yet
    let now = Utc::now();
    assert!(!db.save_delivery(&record, now).await.unwrap());
    assert!(!db.release_delivery(id, now).await.unwrap());

    let LeaseOutcome::Acquired(mut leased) = db
        .lease_delivery(id, now, Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("expected lease");
    };
    let lease = leased.leased_until.unwrap();
    leased
        .links
        .insert("https://t.example.net/".to_string(), LinkBucket::Error);
    assert!(db.save_delivery(&leased, lease).await.unwrap());
    assert!(db.release_delivery(id, lease).await.unwrap());

    let stored = db.get_delivery(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Error);
    assert_eq!(stored.leased_until, None);
    assert!(stored.links.error.contains("https://t.example.net/"));
}

#[tokio::test]
async fn test_writes_under_a_taken_over_lease_are_rejected() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let id = "tag:twitter.com,2013:304";
    db.get_or_create_delivery(&response_record(&account, id, &["https://t.example.net/"]))
        .await
        .unwrap();

    let t = Utc::now();
    let ttl = Duration::from_secs(10 * 60);
    let LeaseOutcome::Acquired(mut first) = db.lease_delivery(id, t, ttl).await.unwrap() else {
        panic!("expected first lease");
    };
    let first_lease = first.leased_until.unwrap();

    // the first worker overran its lease and a second one took over
    let LeaseOutcome::Acquired(second) = db
        .lease_delivery(id, t + ChronoDuration::minutes(11), ttl)
        .await
        .unwrap()
    else {
        panic!("expected takeover");
    };
    let second_lease = second.leased_until.unwrap();

    first
        .links
        .insert("https://t.example.net/".to_string(), LinkBucket::Sent);
    first.status = DeliveryStatus::Complete;
    first.leased_until = None;
    assert!(!db.save_delivery(&first, first_lease).await.unwrap());
    assert!(!db.release_delivery(id, first_lease).await.unwrap());

    let stored = db.get_delivery(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Processing);
    assert_eq!(stored.leased_until, Some(second_lease));
    assert!(stored.links.unsent.contains("https://t.example.net/"));

    // no third worker while the second lease is live
    let third = db
        .lease_delivery(id, t + ChronoDuration::minutes(12), ttl)
        .await
        .unwrap();
    assert!(matches!(third, LeaseOutcome::Held { .. }));

    // the current holder can still release
    assert!(db.release_delivery(id, second_lease).await.unwrap());
    let stored = db.get_delivery(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Error);
}

#[tokio::test]
async fn test_retry_reset_moves_failed_back_to_unsent() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let id = "tag:twitter.com,2013:303";
    db.get_or_create_delivery(&response_record(&account, id, &["https://t.example.net/"]))
        .await
        .unwrap();

    let LeaseOutcome::Acquired(mut leased) = db
        .lease_delivery(id, Utc::now(), Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("expected lease");
    };

    // a live lease is left alone
    let untouched = db.reset_delivery_for_retry(id, Utc::now()).await.unwrap();
    assert_eq!(untouched.status, DeliveryStatus::Processing);

    // park it: failed only, lease cleared
    leased
        .links
        .insert("https://t.example.net/".to_string(), LinkBucket::Failed);
    let lease = leased.leased_until.take().unwrap();
    assert!(db.save_delivery(&leased, lease).await.unwrap());

    let reset = db.reset_delivery_for_retry(id, Utc::now()).await.unwrap();
    assert_eq!(reset.status, DeliveryStatus::New);
    assert!(reset.links.failed.is_empty());
    assert!(reset.links.unsent.contains("https://t.example.net/"));

    let missing = db
        .reset_delivery_for_retry("tag:twitter.com,2013:nope", Utc::now())
        .await;
    assert!(matches!(missing, Err(crate::error::AppError::NotFound)));
}

#[tokio::test]
async fn test_unknown_delivery_kind_is_reported() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO deliveries (id, account_silo, account_id, kind, payload, status, created_at, updated_at)
        VALUES ('mystery-1', ?, ?, 'mystery', '{}', 'new', ?, ?)
        "#,
    )
    .bind(account.silo.as_str())
    .bind(&account.id)
    .bind(now)
    .bind(now)
    .execute(db.pool_for_test())
    .await
    .unwrap();

    let result = db.reset_delivery_for_retry("mystery-1", now).await;
    assert!(matches!(
        result,
        Err(crate::error::AppError::UnexpectedKind(kind)) if kind == "mystery"
    ));
}

#[tokio::test]
async fn test_existing_delivery_ids() {
    let (db, _temp_dir) = create_test_db().await;
    let account = create_account(&db).await;
    db.get_or_create_delivery(&response_record(&account, "tag:twitter.com,2013:1_a", &[]))
        .await
        .unwrap();

    let found = db
        .existing_delivery_ids(&[
            "tag:twitter.com,2013:1_a".to_string(),
            "tag:twitter.com,2013:1_b".to_string(),
        ])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found.contains("tag:twitter.com,2013:1_a"));
    assert!(db.existing_delivery_ids(&[]).await.unwrap().is_empty());
}

// =============================================================================
// Syndication
// =============================================================================

#[tokio::test]
async fn test_insert_syndication_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let key = create_account(&db).await.key();
    let syndication = "https://twitter.com/alice/status/1";
    let original = "https://alice.example.org/2014/post";

    let (first, inserted) = db
        .insert_syndication(&key, syndication, original)
        .await
        .unwrap();
    assert!(inserted);
    let (second, inserted) = db
        .insert_syndication(&key, syndication, original)
        .await
        .unwrap();
    assert!(!inserted);
    assert_eq!(first.id, second.id);

    assert_eq!(db.find_by_syndication(&key, syndication).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concrete_pair_supersedes_blanks() {
    let (db, _temp_dir) = create_test_db().await;
    let key = create_account(&db).await.key();
    let syndication = "https://twitter.com/alice/status/2";
    let original = "https://alice.example.org/2014/other";

    assert!(db.insert_original_blank(&key, original).await.unwrap());
    assert!(db.insert_syndication_blank(&key, syndication).await.unwrap());
    // a second placeholder for the same URL is a no-op
    assert!(!db.insert_original_blank(&key, original).await.unwrap());

    db.insert_syndication(&key, syndication, original)
        .await
        .unwrap();

    let by_original = db.find_by_original(&key, original).await.unwrap();
    assert_eq!(by_original.len(), 1);
    assert!(!by_original[0].is_blank());
    let by_syndication = db.find_by_syndication(&key, syndication).await.unwrap();
    assert_eq!(by_syndication.len(), 1);
    assert_eq!(by_syndication[0].original.as_deref(), Some(original));

    // a concrete relationship blocks new placeholders
    assert!(!db.insert_syndication_blank(&key, syndication).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_syndication_blanks_store_one() {
    let (db, _temp_dir) = create_test_db().await;
    let key = create_account(&db).await.key();
    let url = "https://twitter.com/alice/status/3";

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            db.insert_syndication_blank(&key, url).await.unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(db.find_by_syndication(&key, url).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_syndication_is_scoped_per_account() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = create_account(&db).await.key();
    let bob = AccountRecord::new(SiloKind::Twitter, "bob");
    db.upsert_account(&bob).await.unwrap();

    let url = "https://twitter.com/shared/status/4";
    assert!(db.insert_syndication_blank(&alice, url).await.unwrap());
    assert!(db.insert_syndication_blank(&bob.key(), url).await.unwrap());
}

// =============================================================================
// Publishing
// =============================================================================

#[tokio::test]
async fn test_publish_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;
    let key = create_account(&db).await.key();
    let source = "https://alice.example.org/2014/like";

    let first = PublishRecord::new(source, key.clone(), PublishType::Like, None);
    assert_eq!(first.type_label, "favorite");
    let first = db.begin_publish(&first).await.unwrap();
    db.fail_publish(&first.id).await.unwrap();

    // a failed attempt does not block another
    let second = db
        .begin_publish(&PublishRecord::new(source, key.clone(), PublishType::Like, None))
        .await
        .unwrap();
    db.complete_publish(&second.id, &serde_json::json!({"id": "99"}))
        .await
        .unwrap();

    let rejected = db
        .begin_publish(&PublishRecord::new(source, key.clone(), PublishType::Like, None))
        .await;
    assert!(matches!(rejected, Err(crate::error::AppError::Validation(_))));

    // other types are unaffected
    db.begin_publish(&PublishRecord::new(source, key, PublishType::Repost, None))
        .await
        .unwrap();

    assert!(db.get_published_page(source).await.unwrap().is_some());
    let publishes = db.publishes_for_page(source).await.unwrap();
    assert_eq!(publishes.len(), 3);
    let completed = db.get_publish(&second.id).await.unwrap().unwrap();
    assert_eq!(completed.status, PublishStatus::Complete);
    assert_eq!(completed.published, Some(serde_json::json!({"id": "99"})));
}
