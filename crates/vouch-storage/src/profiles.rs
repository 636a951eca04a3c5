//! Reviewer profiles. A reviewer is matched by email first, then by platform identity,
//! always within one workspace.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;
use vouch_core::{Clock, CustomerProfile, ReviewerIdentity, SystemClock};

use crate::StoreError;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Returns the workspace's profile for `identity`, creating one when nothing matches.
    /// A profile found by platform identity picks up the email if it had none.
    async fn find_or_create_profile(
        &self,
        identity: &ReviewerIdentity,
    ) -> Result<CustomerProfile, StoreError>;

    async fn fetch_profile(&self, id: Uuid) -> Result<Option<CustomerProfile>, StoreError>;
}

pub struct MemoryProfileStore {
    clock: Arc<dyn Clock>,
    profiles: Mutex<Vec<CustomerProfile>>,
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryProfileStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            profiles: Mutex::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.profiles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.lock().await.is_empty()
    }
}

fn matches_email(profile: &CustomerProfile, identity: &ReviewerIdentity, email: &str) -> bool {
    profile.workspace_id == identity.workspace_id && profile.email.as_deref() == Some(email)
}

fn matches_external(profile: &CustomerProfile, identity: &ReviewerIdentity, external_id: &str) -> bool {
    profile.workspace_id == identity.workspace_id
        && profile.platform == identity.platform
        && profile.external_id.as_deref() == Some(external_id)
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_or_create_profile(
        &self,
        identity: &ReviewerIdentity,
    ) -> Result<CustomerProfile, StoreError> {
        let now = self.clock.now();
        let mut profiles = self.profiles.lock().await;

        let by_email = identity.email.as_deref().and_then(|email| {
            profiles
                .iter()
                .position(|p| matches_email(p, identity, email))
        });
        let found = by_email.or_else(|| {
            identity.external_id.as_deref().and_then(|external_id| {
                profiles
                    .iter()
                    .position(|p| matches_external(p, identity, external_id))
            })
        });

        if let Some(index) = found {
            let profile = &mut profiles[index];
            if profile.email.is_none() && identity.email.is_some() {
                profile.email = identity.email.clone();
                profile.updated_at = now;
            }
            return Ok(profile.clone());
        }

        let profile = CustomerProfile {
            id: Uuid::new_v4(),
            workspace_id: identity.workspace_id,
            email: identity.email.clone(),
            platform: identity.platform.clone(),
            external_id: identity.external_id.clone(),
            name: identity.name.clone(),
            created_at: now,
            updated_at: now,
        };
        profiles.push(profile.clone());
        Ok(profile)
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Option<CustomerProfile>, StoreError> {
        Ok(self
            .profiles
            .lock()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }
}

/// Postgres-backed profiles. Lookups and the insert for one workspace run under a
/// transaction-scoped advisory lock, so concurrent syncs never create twins.
#[derive(Debug, Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PROFILE_COLUMNS: &str =
    "id, workspace_id, email, platform, external_id, name, created_at, updated_at";

fn profile_from_row(row: &PgRow) -> Result<CustomerProfile, StoreError> {
    Ok(CustomerProfile {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        email: row.try_get("email")?,
        platform: row.try_get("platform")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_or_create_profile(
        &self,
        identity: &ReviewerIdentity,
    ) -> Result<CustomerProfile, StoreError> {
        let workspace_key = identity
            .workspace_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("profiles:{workspace_key}"))
            .execute(&mut *tx)
            .await?;

        let mut row = None;
        if let Some(email) = &identity.email {
            let sql = format!(
                "SELECT {PROFILE_COLUMNS} FROM customer_profiles
                  WHERE workspace_id IS NOT DISTINCT FROM $1 AND email = $2
                  ORDER BY created_at LIMIT 1"
            );
            row = sqlx::query(&sql)
                .bind(identity.workspace_id)
                .bind(email)
                .fetch_optional(&mut *tx)
                .await?;
        }
        if row.is_none() {
            if let Some(external_id) = &identity.external_id {
                let sql = format!(
                    "SELECT {PROFILE_COLUMNS} FROM customer_profiles
                      WHERE workspace_id IS NOT DISTINCT FROM $1 AND platform = $2 AND external_id = $3
                      ORDER BY created_at LIMIT 1"
                );
                row = sqlx::query(&sql)
                    .bind(identity.workspace_id)
                    .bind(&identity.platform)
                    .bind(external_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            }
        }

        let profile = match row {
            Some(row) => {
                let mut profile = profile_from_row(&row)?;
                if profile.email.is_none() && identity.email.is_some() {
                    let sql = format!(
                        "UPDATE customer_profiles SET email = $2, updated_at = NOW()
                          WHERE id = $1 RETURNING {PROFILE_COLUMNS}"
                    );
                    let updated = sqlx::query(&sql)
                        .bind(profile.id)
                        .bind(&identity.email)
                        .fetch_one(&mut *tx)
                        .await?;
                    profile = profile_from_row(&updated)?;
                }
                profile
            }
            None => {
                let sql = format!(
                    "INSERT INTO customer_profiles
                       (id, workspace_id, email, platform, external_id, name, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
                     RETURNING {PROFILE_COLUMNS}"
                );
                let inserted = sqlx::query(&sql)
                    .bind(Uuid::new_v4())
                    .bind(identity.workspace_id)
                    .bind(&identity.email)
                    .bind(&identity.platform)
                    .bind(&identity.external_id)
                    .bind(&identity.name)
                    .fetch_one(&mut *tx)
                    .await?;
                profile_from_row(&inserted)?
            }
        };
        tx.commit().await?;
        Ok(profile)
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Option<CustomerProfile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM customer_profiles WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }
}
