//! Idempotent testimonial record storage keyed on `(platform_name, external_id)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;
use vouch_core::{Clock, NormalizedRecord, SystemClock};

use crate::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: NormalizedRecord,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All-or-nothing: every record is written or none is. Re-sending a natural key updates
    /// its mutable fields in place.
    async fn batch_upsert(&self, records: &[NormalizedRecord]) -> Result<UpsertSummary, StoreError>;

    async fn find_by_external_key(
        &self,
        platform_name: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError>;
}

pub fn validate_record(record: &NormalizedRecord) -> Result<(), StoreError> {
    if record.platform_name.trim().is_empty() {
        return Err(StoreError::Invalid("record without platform_name".into()));
    }
    if record.external_id.trim().is_empty() {
        return Err(StoreError::Invalid(format!(
            "{} record without external_id",
            record.platform_name
        )));
    }
    if let Some(rating) = record.rating {
        if !rating.is_finite() || !(0.0..=5.0).contains(&rating) {
            return Err(StoreError::Invalid(format!(
                "{}:{} rating {rating} outside 0..=5",
                record.platform_name, record.external_id
            )));
        }
    }
    Ok(())
}

fn same_mutable_fields(stored: &StoredRecord, incoming: &NormalizedRecord, hash: &str) -> bool {
    stored.content_hash == hash
        && stored.record.rating == incoming.rating
        && stored.record.author_name == incoming.author_name
        && stored.record.source_metadata == incoming.source_metadata
        && stored.record.author_email == incoming.author_email
        && stored.record.workspace_id == incoming.workspace_id
        && stored.record.customer_profile_id == incoming.customer_profile_id
}

pub struct MemoryRecordStore {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Uuid, StoredRecord>>,
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore").finish_non_exhaustive()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryRecordStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn batch_upsert(&self, records: &[NormalizedRecord]) -> Result<UpsertSummary, StoreError> {
        for record in records {
            validate_record(record)?;
        }

        let now = self.clock.now();
        let mut rows = self.rows.lock().await;
        let mut summary = UpsertSummary::default();
        for record in records {
            let id = record.stable_id();
            let hash = record.content_hash();
            match rows.get_mut(&id) {
                Some(stored) if same_mutable_fields(stored, record, &hash) => {
                    summary.unchanged += 1;
                }
                Some(stored) => {
                    stored.record = record.clone();
                    stored.content_hash = hash;
                    stored.updated_at = now;
                    summary.updated += 1;
                }
                None => {
                    rows.insert(
                        id,
                        StoredRecord {
                            id,
                            record: record.clone(),
                            content_hash: hash,
                            first_seen_at: now,
                            updated_at: now,
                        },
                    );
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn find_by_external_key(
        &self,
        platform_name: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .find(|row| {
                row.record.platform_name == platform_name && row.record.external_id == external_id
            })
            .cloned())
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RECORD_COLUMNS: &str = r#"
    id, platform_name, external_id, author_name, author_identifier, content, rating,
    source_created_at, source_metadata, author_email, workspace_id, customer_profile_id,
    content_hash, first_seen_at, updated_at
"#;

fn stored_from_row(row: &PgRow) -> Result<StoredRecord, StoreError> {
    let metadata: JsonValue = row.try_get("source_metadata")?;
    let source_metadata: BTreeMap<String, JsonValue> = match metadata {
        JsonValue::Null => BTreeMap::new(),
        other => serde_json::from_value(other)?,
    };
    Ok(StoredRecord {
        id: row.try_get("id")?,
        record: NormalizedRecord {
            external_id: row.try_get("external_id")?,
            platform_name: row.try_get("platform_name")?,
            author_name: row.try_get("author_name")?,
            author_identifier: row.try_get("author_identifier")?,
            content: row.try_get("content")?,
            rating: row.try_get("rating")?,
            created_at: row.try_get("source_created_at")?,
            source_metadata,
            author_email: row.try_get("author_email")?,
            workspace_id: row.try_get("workspace_id")?,
            customer_profile_id: row.try_get("customer_profile_id")?,
        },
        content_hash: row.try_get("content_hash")?,
        first_seen_at: row.try_get("first_seen_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn batch_upsert(&self, records: &[NormalizedRecord]) -> Result<UpsertSummary, StoreError> {
        for record in records {
            validate_record(record)?;
        }

        let mut tx = self.pool.begin().await?;
        let mut summary = UpsertSummary::default();
        for record in records {
            let metadata = serde_json::to_value(&record.source_metadata)?;
            // No row back means the conflict branch matched but nothing differed.
            let row = sqlx::query(
                r#"
                INSERT INTO testimonial_records
                  (id, platform_name, external_id, author_name, author_identifier, content,
                   rating, source_created_at, source_metadata, author_email, workspace_id,
                   customer_profile_id, content_hash, first_seen_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
                ON CONFLICT (platform_name, external_id) DO UPDATE SET
                  author_name = EXCLUDED.author_name,
                  author_identifier = EXCLUDED.author_identifier,
                  content = EXCLUDED.content,
                  rating = EXCLUDED.rating,
                  source_created_at = EXCLUDED.source_created_at,
                  source_metadata = EXCLUDED.source_metadata,
                  author_email = EXCLUDED.author_email,
                  workspace_id = EXCLUDED.workspace_id,
                  customer_profile_id = EXCLUDED.customer_profile_id,
                  content_hash = EXCLUDED.content_hash,
                  updated_at = NOW()
                WHERE testimonial_records.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                   OR testimonial_records.rating IS DISTINCT FROM EXCLUDED.rating
                   OR testimonial_records.author_name IS DISTINCT FROM EXCLUDED.author_name
                   OR testimonial_records.source_metadata IS DISTINCT FROM EXCLUDED.source_metadata
                   OR testimonial_records.author_email IS DISTINCT FROM EXCLUDED.author_email
                   OR testimonial_records.workspace_id IS DISTINCT FROM EXCLUDED.workspace_id
                   OR testimonial_records.customer_profile_id IS DISTINCT FROM EXCLUDED.customer_profile_id
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(record.stable_id())
            .bind(&record.platform_name)
            .bind(&record.external_id)
            .bind(&record.author_name)
            .bind(&record.author_identifier)
            .bind(&record.content)
            .bind(record.rating)
            .bind(record.created_at)
            .bind(metadata)
            .bind(&record.author_email)
            .bind(record.workspace_id)
            .bind(record.customer_profile_id)
            .bind(record.content_hash())
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) if row.try_get::<bool, _>("inserted")? => summary.inserted += 1,
                Some(_) => summary.updated += 1,
                None => summary.unchanged += 1,
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn find_by_external_key(
        &self,
        platform_name: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM testimonial_records WHERE platform_name = $1 AND external_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(platform_name)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM testimonial_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_from_row).transpose()
    }
}
