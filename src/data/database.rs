//! SQLite database operations
//!
//! All database access goes through this module.
//! Every check-and-set runs inside a `BEGIN IMMEDIATE` transaction, which
//! serializes writers; that is what keeps account-scoped operations atomic.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;
use crate::silo::SiloKind;

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Result of trying to lease a delivery record
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease on this record
    Acquired(DeliveryRecord),
    /// Nothing left to do
    Complete,
    /// Another worker holds a live lease
    Held { until: DateTime<Utc> },
    Missing,
}

/// Result of starting a poll for an account
#[derive(Debug, Clone, PartialEq)]
pub enum PollStart {
    Missing,
    /// Disabled, or `listen` is not enabled
    Inactive,
    /// The task's `last_polled` token is stale
    Duplicate,
    Started(AccountRecord),
}

fn decode_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid {column} column: {e}")))
}

fn encode_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, AppError> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("cannot encode {column}: {e}")))
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration, AppError> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("lease ttl out of range: {e}")))
}

// =============================================================================
// Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct AccountRow {
    silo: String,
    id: String,
    name: Option<String>,
    url: Option<String>,
    status: String,
    features: String,
    domains: String,
    domain_urls: String,
    webmention_endpoint: Option<String>,
    created_at: DateTime<Utc>,
    last_polled: DateTime<Utc>,
    last_poll_attempt: DateTime<Utc>,
    last_webmention_sent: Option<DateTime<Utc>>,
    last_hfeed_fetch: DateTime<Utc>,
    last_syndication_url: Option<DateTime<Utc>>,
    last_activity_id: Option<String>,
    last_activities_etag: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for AccountRecord {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            silo: row.silo.parse::<SiloKind>()?,
            id: row.id,
            name: row.name,
            url: row.url,
            status: row.status.parse()?,
            features: decode_json("features", &row.features)?,
            domains: decode_json("domains", &row.domains)?,
            domain_urls: decode_json("domain_urls", &row.domain_urls)?,
            webmention_endpoint: row.webmention_endpoint,
            created_at: row.created_at,
            last_polled: row.last_polled,
            last_poll_attempt: row.last_poll_attempt,
            last_webmention_sent: row.last_webmention_sent,
            last_hfeed_fetch: row.last_hfeed_fetch,
            last_syndication_url: row.last_syndication_url,
            last_activity_id: row.last_activity_id,
            last_activities_etag: row.last_activities_etag,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: String,
    account_silo: String,
    account_id: String,
    kind: String,
    payload: String,
    status: String,
    leased_until: Option<DateTime<Utc>>,
    sent: String,
    unsent: String,
    error: String,
    failed: String,
    skipped: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = AppError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        if !matches!(row.kind.as_str(), "response" | "blog_post") {
            return Err(AppError::UnexpectedKind(row.kind));
        }
        let kind: DeliveryKind = decode_json("payload", &row.payload)?;
        if kind.as_str() != row.kind {
            return Err(AppError::UnexpectedKind(row.kind));
        }

        Ok(Self {
            id: row.id,
            account: AccountKey::new(row.account_silo.parse()?, row.account_id),
            kind,
            status: row.status.parse()?,
            leased_until: row.leased_until,
            links: LinkSets {
                sent: decode_json("sent", &row.sent)?,
                unsent: decode_json("unsent", &row.unsent)?,
                error: decode_json("error", &row.error)?,
                failed: decode_json("failed", &row.failed)?,
                skipped: decode_json("skipped", &row.skipped)?,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PublishRow {
    id: String,
    source_url: String,
    account_silo: String,
    account_id: String,
    publish_type: String,
    type_label: String,
    status: String,
    html: Option<String>,
    published: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PublishRow> for PublishRecord {
    type Error = AppError;

    fn try_from(row: PublishRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            source_url: row.source_url,
            account: AccountKey::new(row.account_silo.parse()?, row.account_id),
            publish_type: row.publish_type.parse()?,
            type_label: row.type_label,
            status: row.status.parse()?,
            html: row.html,
            published: row
                .published
                .as_deref()
                .map(|raw| decode_json("published", raw))
                .transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SYNDICATED_POST_COLUMNS: &str = "id, syndication, original, created_at, updated_at";

async fn fetch_account(
    conn: &mut SqliteConnection,
    key: &AccountKey,
) -> Result<Option<AccountRecord>, AppError> {
    sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE silo = ? AND id = ?")
        .bind(key.silo.as_str())
        .bind(&key.id)
        .fetch_optional(conn)
        .await?
        .map(AccountRecord::try_from)
        .transpose()
}

async fn write_account(
    conn: &mut SqliteConnection,
    account: &AccountRecord,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO accounts (
            silo, id, name, url, status, features, domains, domain_urls,
            webmention_endpoint, created_at, last_polled, last_poll_attempt,
            last_webmention_sent, last_hfeed_fetch, last_syndication_url,
            last_activity_id, last_activities_etag, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (silo, id) DO UPDATE SET
            name = excluded.name,
            url = excluded.url,
            status = excluded.status,
            features = excluded.features,
            domains = excluded.domains,
            domain_urls = excluded.domain_urls,
            webmention_endpoint = excluded.webmention_endpoint,
            created_at = excluded.created_at,
            last_polled = excluded.last_polled,
            last_poll_attempt = excluded.last_poll_attempt,
            last_webmention_sent = excluded.last_webmention_sent,
            last_hfeed_fetch = excluded.last_hfeed_fetch,
            last_syndication_url = excluded.last_syndication_url,
            last_activity_id = excluded.last_activity_id,
            last_activities_etag = excluded.last_activities_etag,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(account.silo.as_str())
    .bind(&account.id)
    .bind(&account.name)
    .bind(&account.url)
    .bind(account.status.as_str())
    .bind(encode_json("features", &account.features)?)
    .bind(encode_json("domains", &account.domains)?)
    .bind(encode_json("domain_urls", &account.domain_urls)?)
    .bind(&account.webmention_endpoint)
    .bind(account.created_at)
    .bind(account.last_polled)
    .bind(account.last_poll_attempt)
    .bind(account.last_webmention_sent)
    .bind(account.last_hfeed_fetch)
    .bind(account.last_syndication_url)
    .bind(&account.last_activity_id)
    .bind(&account.last_activities_etag)
    .bind(account.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

async fn fetch_delivery(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<DeliveryRecord>, AppError> {
    sqlx::query_as::<_, DeliveryRow>("SELECT * FROM deliveries WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(DeliveryRecord::try_from)
        .transpose()
}

/// Write status, lease and link sets of an existing delivery record.
///
/// With a `lease` token the write only applies while the record is
/// processing under exactly that lease.
async fn write_delivery_state(
    conn: &mut SqliteConnection,
    record: &DeliveryRecord,
    lease: Option<DateTime<Utc>>,
) -> Result<bool, AppError> {
    let sql = if lease.is_some() {
        r#"
        UPDATE deliveries
        SET status = ?, leased_until = ?, sent = ?, unsent = ?, error = ?,
            failed = ?, skipped = ?, updated_at = ?
        WHERE id = ? AND status = 'processing' AND leased_until = ?
        "#
    } else {
        r#"
        UPDATE deliveries
        SET status = ?, leased_until = ?, sent = ?, unsent = ?, error = ?,
            failed = ?, skipped = ?, updated_at = ?
        WHERE id = ?
        "#
    };

    let mut query = sqlx::query(sql)
        .bind(record.status.as_str())
        .bind(record.leased_until)
        .bind(encode_json("sent", &record.links.sent)?)
        .bind(encode_json("unsent", &record.links.unsent)?)
        .bind(encode_json("error", &record.links.error)?)
        .bind(encode_json("failed", &record.links.failed)?)
        .bind(encode_json("skipped", &record.links.skipped)?)
        .bind(record.updated_at)
        .bind(&record.id);
    if let Some(lease) = lease {
        query = query.bind(lease);
    }
    let result = query.execute(conn).await?;

    Ok(result.rows_affected() > 0)
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool_for_test(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn get_account(&self, key: &AccountKey) -> Result<Option<AccountRecord>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_account(&mut conn, key).await
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountRecord>, AppError> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts ORDER BY silo, id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AccountRecord::try_from)
            .collect()
    }

    /// Insert or overwrite an account as-is
    pub async fn upsert_account(&self, account: &AccountRecord) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        write_account(&mut conn, account).await
    }

    /// Store a freshly linked account, merging with any existing record.
    ///
    /// Features are unioned. Bookkeeping timestamps of the existing record
    /// are kept so that relinking does not reset cadence or verification
    /// history.
    pub async fn create_or_update_account(
        &self,
        account: &AccountRecord,
    ) -> Result<AccountRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<AccountRecord, AppError> = async {
            let mut merged = account.clone();
            if let Some(existing) = fetch_account(&mut conn, &account.key()).await? {
                merged.features.extend(existing.features);
                merged.created_at = existing.created_at;
                merged.last_polled = existing.last_polled;
                merged.last_poll_attempt = existing.last_poll_attempt;
                merged.last_webmention_sent = existing.last_webmention_sent;
                merged.last_hfeed_fetch = existing.last_hfeed_fetch;
                merged.last_syndication_url = existing.last_syndication_url;
                merged.last_activity_id = existing.last_activity_id;
                merged.last_activities_etag = existing.last_activities_etag;
                if merged.webmention_endpoint.is_none() {
                    merged.webmention_endpoint = existing.webmention_endpoint;
                }
            }
            merged.status = AccountStatus::Enabled;
            merged.updated_at = Utc::now();
            write_account(&mut conn, &merged).await?;
            Ok(merged)
        }
        .await;

        match result {
            Ok(merged) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(merged)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Remove features from an account.
    ///
    /// The account becomes disabled when no features remain, or
    /// unconditionally when `disable` is set.
    ///
    /// # Returns
    /// The updated account, or None if it doesn't exist
    pub async fn remove_features(
        &self,
        key: &AccountKey,
        features: &[Feature],
        disable: bool,
    ) -> Result<Option<AccountRecord>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<AccountRecord>, AppError> = async {
            let Some(mut account) = fetch_account(&mut conn, key).await? else {
                return Ok(None);
            };
            for feature in features {
                account.features.remove(feature);
            }
            if disable || account.features.is_empty() {
                account.status = AccountStatus::Disabled;
            }
            account.updated_at = Utc::now();
            write_account(&mut conn, &account).await?;
            Ok(Some(account))
        }
        .await;

        match result {
            Ok(account) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(account)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Claim a poll for an account.
    ///
    /// `last_polled` is the token the poll task was dispatched with. If the
    /// account has been polled since, the task is a duplicate. On success
    /// `last_poll_attempt` is set to `now`.
    pub async fn begin_poll(
        &self,
        key: &AccountKey,
        last_polled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PollStart, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<PollStart, AppError> = async {
            let Some(mut account) = fetch_account(&mut conn, key).await? else {
                return Ok(PollStart::Missing);
            };
            if account.is_disabled() || !account.has_feature(Feature::Listen) {
                return Ok(PollStart::Inactive);
            }
            if account.last_polled != last_polled {
                return Ok(PollStart::Duplicate);
            }

            sqlx::query(
                "UPDATE accounts SET last_poll_attempt = ?, updated_at = ? WHERE silo = ? AND id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(key.silo.as_str())
            .bind(&key.id)
            .execute(&mut *conn)
            .await?;

            account.last_poll_attempt = now;
            account.updated_at = now;
            Ok(PollStart::Started(account))
        }
        .await;

        match result {
            Ok(start) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(start)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Mark the in-flight poll as successful: `last_polled` catches up with
    /// `last_poll_attempt` and the incremental fetch cursor is stored.
    pub async fn record_poll_success(
        &self,
        key: &AccountKey,
        etag: Option<&str>,
        last_activity_id: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_polled = last_poll_attempt, status = 'enabled',
                last_activities_etag = ?, last_activity_id = ?, updated_at = ?
            WHERE silo = ? AND id = ?
            "#,
        )
        .bind(etag)
        .bind(last_activity_id)
        .bind(Utc::now())
        .bind(key.silo.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set the account status. Disabled accounts stay disabled.
    pub async fn set_account_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE accounts SET status = ?, updated_at = ? WHERE silo = ? AND id = ? AND status != 'disabled'",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(key.silo.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_webmention_endpoint(
        &self,
        key: &AccountKey,
        endpoint: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE accounts SET webmention_endpoint = ?, updated_at = ? WHERE silo = ? AND id = ?",
        )
        .bind(endpoint)
        .bind(Utc::now())
        .bind(key.silo.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_webmention_sent(
        &self,
        key: &AccountKey,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE accounts SET last_webmention_sent = ?, updated_at = ? WHERE silo = ? AND id = ?",
        )
        .bind(at)
        .bind(Utc::now())
        .bind(key.silo.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an h-feed crawl, and whether it found any syndication links
    pub async fn mark_hfeed_fetched(
        &self,
        key: &AccountKey,
        at: DateTime<Utc>,
        found_syndication: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_hfeed_fetch = ?,
                last_syndication_url = CASE WHEN ? THEN ? ELSE last_syndication_url END,
                updated_at = ?
            WHERE silo = ? AND id = ?
            "#,
        )
        .bind(at)
        .bind(found_syndication)
        .bind(at)
        .bind(Utc::now())
        .bind(key.silo.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Deliveries
    // =========================================================================

    /// Store a new delivery record unless one with the same id exists.
    ///
    /// First writer wins: an existing record is returned untouched. A new
    /// record with nothing pending is stored as complete.
    ///
    /// # Returns
    /// The stored record and whether this call created it
    pub async fn get_or_create_delivery(
        &self,
        record: &DeliveryRecord,
    ) -> Result<(DeliveryRecord, bool), AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(DeliveryRecord, bool), AppError> = async {
            if let Some(existing) = fetch_delivery(&mut conn, &record.id).await? {
                return Ok((existing, false));
            }

            let mut record = record.clone();
            record.leased_until = None;
            // error links on a new record are retried right away
            record.status = if record.links.has_pending() {
                DeliveryStatus::New
            } else {
                record.links.settled_status()
            };

            sqlx::query(
                r#"
                INSERT INTO deliveries (
                    id, account_silo, account_id, kind, payload, status, leased_until,
                    sent, unsent, error, failed, skipped, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(record.account.silo.as_str())
            .bind(&record.account.id)
            .bind(record.kind.as_str())
            .bind(encode_json("payload", &record.kind)?)
            .bind(record.status.as_str())
            .bind(encode_json("sent", &record.links.sent)?)
            .bind(encode_json("unsent", &record.links.unsent)?)
            .bind(encode_json("error", &record.links.error)?)
            .bind(encode_json("failed", &record.links.failed)?)
            .bind(encode_json("skipped", &record.links.skipped)?)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *conn)
            .await?;

            Ok((record, true))
        }
        .await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    pub async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryRecord>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_delivery(&mut conn, id).await
    }

    pub async fn deliveries_for_account(
        &self,
        key: &AccountKey,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM deliveries WHERE account_silo = ? AND account_id = ? ORDER BY created_at, id",
        )
        .bind(key.silo.as_str())
        .bind(&key.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DeliveryRecord::try_from)
        .collect()
    }

    /// Which of `ids` already have a delivery record
    pub async fn existing_delivery_ids(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT id FROM deliveries WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let found = query
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        Ok(found.into_iter().collect())
    }

    /// Atomically claim a delivery record for `ttl`.
    ///
    /// Succeeds when the record is new, in error, or processing without a
    /// live lease (expired or parked).
    pub async fn lease_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseOutcome, AppError> {
        let ttl = to_chrono(ttl)?;
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<LeaseOutcome, AppError> = async {
            let Some(mut record) = fetch_delivery(&mut conn, id).await? else {
                return Ok(LeaseOutcome::Missing);
            };
            if record.status == DeliveryStatus::Complete {
                return Ok(LeaseOutcome::Complete);
            }
            if record.is_leased_at(now) {
                if let Some(until) = record.leased_until {
                    return Ok(LeaseOutcome::Held { until });
                }
            }

            record.status = DeliveryStatus::Processing;
            record.leased_until = Some(now + ttl);
            record.updated_at = now;
            write_delivery_state(&mut conn, &record, None).await?;
            Ok(LeaseOutcome::Acquired(record))
        }
        .await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Persist the result of a propagation attempt.
    ///
    /// `lease` is the `leased_until` the worker acquired. The write only
    /// applies while that lease is still the record's current one.
    ///
    /// # Returns
    /// `false` if the lease was lost
    pub async fn save_delivery(
        &self,
        record: &DeliveryRecord,
        lease: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        write_delivery_state(&mut conn, record, Some(lease)).await
    }

    /// Drop the lease and put the record in `error`, keeping its links.
    ///
    /// Only applies while `lease` is still the record's current lease.
    pub async fn release_delivery(&self, id: &str, lease: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'error', leased_until = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND leased_until = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// User-initiated reset ahead of a retry.
    ///
    /// Unless a worker holds a live lease, the record goes back to `new` and
    /// its `failed` links move back to `unsent`.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `UnexpectedKind` for an unknown record kind
    pub async fn reset_delivery_for_retry(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<DeliveryRecord, AppError> = async {
            let mut record = fetch_delivery(&mut conn, id)
                .await?
                .ok_or(AppError::NotFound)?;
            if record.is_leased_at(now) {
                return Ok(record);
            }

            let failed = std::mem::take(&mut record.links.failed);
            for link in failed {
                record.links.insert(link, LinkBucket::Unsent);
            }
            record.status = DeliveryStatus::New;
            record.leased_until = None;
            record.updated_at = now;
            write_delivery_state(&mut conn, &record, None).await?;
            Ok(record)
        }
        .await;

        match result {
            Ok(record) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(record)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    // =========================================================================
    // Syndication
    // =========================================================================

    /// Relationships whose syndication side is `syndication`
    pub async fn find_by_syndication(
        &self,
        account: &AccountKey,
        syndication: &str,
    ) -> Result<Vec<SyndicatedPost>, AppError> {
        let sql = format!(
            "SELECT {SYNDICATED_POST_COLUMNS} FROM syndicated_posts \
             WHERE account_silo = ? AND account_id = ? AND syndication = ? ORDER BY created_at, id"
        );
        let posts = sqlx::query_as::<_, SyndicatedPost>(&sql)
            .bind(account.silo.as_str())
            .bind(&account.id)
            .bind(syndication)
            .fetch_all(&self.pool)
            .await?;

        Ok(posts)
    }

    /// Relationships whose original side is `original`
    pub async fn find_by_original(
        &self,
        account: &AccountKey,
        original: &str,
    ) -> Result<Vec<SyndicatedPost>, AppError> {
        let sql = format!(
            "SELECT {SYNDICATED_POST_COLUMNS} FROM syndicated_posts \
             WHERE account_silo = ? AND account_id = ? AND original = ? ORDER BY created_at, id"
        );
        let posts = sqlx::query_as::<_, SyndicatedPost>(&sql)
            .bind(account.silo.as_str())
            .bind(&account.id)
            .bind(original)
            .fetch_all(&self.pool)
            .await?;

        Ok(posts)
    }

    /// Insert an `(original, NULL)` placeholder unless any relationship for
    /// `original` exists.
    ///
    /// # Returns
    /// `true` if a placeholder was inserted
    pub async fn insert_original_blank(
        &self,
        account: &AccountKey,
        original: &str,
    ) -> Result<bool, AppError> {
        self.insert_blank(account, "original", original).await
    }

    /// Insert a `(NULL, syndication)` placeholder unless any relationship for
    /// `syndication` exists.
    pub async fn insert_syndication_blank(
        &self,
        account: &AccountKey,
        syndication: &str,
    ) -> Result<bool, AppError> {
        self.insert_blank(account, "syndication", syndication).await
    }

    async fn insert_blank(
        &self,
        account: &AccountKey,
        column: &'static str,
        url: &str,
    ) -> Result<bool, AppError> {
        let exists_sql = format!(
            "SELECT COUNT(*) FROM syndicated_posts WHERE account_silo = ? AND account_id = ? AND {column} = ?"
        );
        let insert_sql = format!(
            "INSERT INTO syndicated_posts (id, account_silo, account_id, {column}, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)"
        );

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<bool, AppError> = async {
            let existing = sqlx::query_scalar::<_, i64>(&exists_sql)
                .bind(account.silo.as_str())
                .bind(&account.id)
                .bind(url)
                .fetch_one(&mut *conn)
                .await?;
            if existing > 0 {
                return Ok(false);
            }

            let now = Utc::now();
            sqlx::query(&insert_sql)
                .bind(EntityId::new().0)
                .bind(account.silo.as_str())
                .bind(&account.id)
                .bind(url)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(inserted) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(inserted)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Record a concrete `(syndication, original)` relationship.
    ///
    /// Idempotent for an existing pair. Blank placeholders for either URL are
    /// deleted in the same transaction.
    ///
    /// # Returns
    /// The stored relationship and whether this call inserted it
    pub async fn insert_syndication(
        &self,
        account: &AccountKey,
        syndication: &str,
        original: &str,
    ) -> Result<(SyndicatedPost, bool), AppError> {
        let select_sql = format!(
            "SELECT {SYNDICATED_POST_COLUMNS} FROM syndicated_posts \
             WHERE account_silo = ? AND account_id = ? AND syndication = ? AND original = ?"
        );

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(SyndicatedPost, bool), AppError> = async {
            let existing = sqlx::query_as::<_, SyndicatedPost>(&select_sql)
                .bind(account.silo.as_str())
                .bind(&account.id)
                .bind(syndication)
                .bind(original)
                .fetch_optional(&mut *conn)
                .await?;
            if let Some(existing) = existing {
                return Ok((existing, false));
            }

            sqlx::query(
                r#"
                DELETE FROM syndicated_posts
                WHERE account_silo = ? AND account_id = ?
                  AND ((syndication = ? AND original IS NULL)
                    OR (original = ? AND syndication IS NULL))
                "#,
            )
            .bind(account.silo.as_str())
            .bind(&account.id)
            .bind(syndication)
            .bind(original)
            .execute(&mut *conn)
            .await?;

            let now = Utc::now();
            let post = SyndicatedPost {
                id: EntityId::new().0,
                syndication: Some(syndication.to_string()),
                original: Some(original.to_string()),
                created_at: now,
                updated_at: now,
            };
            sqlx::query(
                r#"
                INSERT INTO syndicated_posts (
                    id, account_silo, account_id, syndication, original, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&post.id)
            .bind(account.silo.as_str())
            .bind(&account.id)
            .bind(&post.syndication)
            .bind(&post.original)
            .bind(post.created_at)
            .bind(post.updated_at)
            .execute(&mut *conn)
            .await?;

            Ok((post, true))
        }
        .await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    pub async fn get_published_page(
        &self,
        source_url: &str,
    ) -> Result<Option<PublishedPage>, AppError> {
        let page = sqlx::query_as::<_, PublishedPage>(
            "SELECT source_url, created_at FROM published_pages WHERE source_url = ?",
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(page)
    }

    /// Append a new publish attempt under its page.
    ///
    /// # Errors
    /// `Validation` if the page already has a complete publish of this type
    pub async fn begin_publish(&self, publish: &PublishRecord) -> Result<PublishRecord, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<PublishRecord, AppError> = async {
            let completed = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM publishes
                WHERE source_url = ? AND publish_type = ? AND status = 'complete'
                "#,
            )
            .bind(&publish.source_url)
            .bind(publish.publish_type.as_str())
            .fetch_one(&mut *conn)
            .await?;
            if completed > 0 {
                return Err(AppError::Validation(format!(
                    "{} already has a completed {} publish",
                    publish.source_url,
                    publish.publish_type.as_str()
                )));
            }

            sqlx::query("INSERT OR IGNORE INTO published_pages (source_url, created_at) VALUES (?, ?)")
                .bind(&publish.source_url)
                .bind(publish.created_at)
                .execute(&mut *conn)
                .await?;

            let mut publish = publish.clone();
            publish.status = PublishStatus::New;
            publish.published = None;
            sqlx::query(
                r#"
                INSERT INTO publishes (
                    id, source_url, account_silo, account_id, publish_type, type_label,
                    status, html, published, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
                "#,
            )
            .bind(&publish.id)
            .bind(&publish.source_url)
            .bind(publish.account.silo.as_str())
            .bind(&publish.account.id)
            .bind(publish.publish_type.as_str())
            .bind(&publish.type_label)
            .bind(publish.status.as_str())
            .bind(&publish.html)
            .bind(publish.created_at)
            .bind(publish.updated_at)
            .execute(&mut *conn)
            .await?;

            Ok(publish)
        }
        .await;

        match result {
            Ok(publish) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(publish)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Mark a publish complete with the silo's result payload
    pub async fn complete_publish(
        &self,
        id: &str,
        published: &serde_json::Value,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE publishes SET status = 'complete', published = ?, updated_at = ? WHERE id = ? AND status = 'new'",
        )
        .bind(encode_json("published", published)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn fail_publish(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE publishes SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'new'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_publish(&self, id: &str) -> Result<Option<PublishRecord>, AppError> {
        sqlx::query_as::<_, PublishRow>("SELECT * FROM publishes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PublishRecord::try_from)
            .transpose()
    }

    /// All publish attempts for a page, oldest first
    pub async fn publishes_for_page(&self, source_url: &str) -> Result<Vec<PublishRecord>, AppError> {
        sqlx::query_as::<_, PublishRow>(
            "SELECT * FROM publishes WHERE source_url = ? ORDER BY created_at, id",
        )
        .bind(source_url)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PublishRecord::try_from)
        .collect()
    }
}
