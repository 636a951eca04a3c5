//! Pending authorization states and issued tokens.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use vouch_core::{OAuthState, OAuthToken};

use crate::{chrono_window, StoreError};

#[async_trait]
pub trait OAuthStore: Send + Sync {
    /// Stores `state` until `state.issued_at + ttl`.
    async fn put_state(&self, key: &str, state: &OAuthState, ttl: Duration)
        -> Result<(), StoreError>;

    /// Removes and returns the state in one step. Expired or unknown keys yield `None`,
    /// so at most one caller ever sees a given state.
    async fn take_state(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError>;

    async fn purge_expired_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn load_token(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<OAuthToken>, StoreError>;

    async fn save_token(
        &self,
        user_id: &str,
        platform: &str,
        token: &OAuthToken,
    ) -> Result<(), StoreError>;

    /// Returns whether a token existed. Deleting a missing token is not an error.
    async fn delete_token(&self, user_id: &str, platform: &str) -> Result<bool, StoreError>;

    /// Claims the right to refresh `(user_id, platform)` for `ttl`. Succeeds only when no
    /// other holder has a live lease, across every instance sharing the store.
    async fn try_acquire_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drops the lease if `holder` still owns it.
    async fn release_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryOAuthInner {
    states: HashMap<String, (OAuthState, DateTime<Utc>)>,
    tokens: HashMap<(String, String), OAuthToken>,
    leases: HashMap<(String, String), (String, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
pub struct MemoryOAuthStore {
    inner: Mutex<MemoryOAuthInner>,
}

impl MemoryOAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_states(&self) -> usize {
        self.inner.lock().await.states.len()
    }
}

#[async_trait]
impl OAuthStore for MemoryOAuthStore {
    async fn put_state(
        &self,
        key: &str,
        state: &OAuthState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = state.issued_at + chrono_window(ttl)?;
        self.inner
            .lock()
            .await
            .states
            .insert(key.to_string(), (state.clone(), expires_at));
        Ok(())
    }

    async fn take_state(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError> {
        let taken = self.inner.lock().await.states.remove(key);
        Ok(taken.and_then(|(state, expires_at)| (expires_at > now).then_some(state)))
    }

    async fn purge_expired_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.states.len();
        inner.states.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - inner.states.len()) as u64)
    }

    async fn load_token(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .tokens
            .get(&(user_id.to_string(), platform.to_string()))
            .cloned())
    }

    async fn save_token(
        &self,
        user_id: &str,
        platform: &str,
        token: &OAuthToken,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .tokens
            .insert((user_id.to_string(), platform.to_string()), token.clone());
        Ok(())
    }

    async fn delete_token(&self, user_id: &str, platform: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .tokens
            .remove(&(user_id.to_string(), platform.to_string()))
            .is_some())
    }

    async fn try_acquire_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = now + chrono_window(ttl)?;
        let mut inner = self.inner.lock().await;
        let key = (user_id.to_string(), platform.to_string());
        match inner.leases.get(&key) {
            Some((owner, until)) if owner != holder && *until > now => Ok(false),
            _ => {
                inner.leases.insert(key, (holder.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn release_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (user_id.to_string(), platform.to_string());
        if inner.leases.get(&key).is_some_and(|(owner, _)| owner == holder) {
            inner.leases.remove(&key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgOAuthStore {
    pool: PgPool,
}

impl PgOAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuthStore for PgOAuthStore {
    async fn put_state(
        &self,
        key: &str,
        state: &OAuthState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = state.issued_at + chrono_window(ttl)?;
        sqlx::query(
            r#"
            INSERT INTO oauth_states (state, platform, user_id, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (state) DO UPDATE SET
              platform = EXCLUDED.platform,
              user_id = EXCLUDED.user_id,
              issued_at = EXCLUDED.issued_at,
              expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&state.platform)
        .bind(&state.user_id)
        .bind(state.issued_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_state(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM oauth_states
             WHERE state = $1
            RETURNING platform, user_id, issued_at, expires_at
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if expires_at <= now {
            return Ok(None);
        }
        Ok(Some(OAuthState {
            platform: row.try_get("platform")?,
            user_id: row.try_get("user_id")?,
            issued_at: row.try_get("issued_at")?,
        }))
    }

    async fn purge_expired_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_token(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT access_token, refresh_token, expires_at, scopes
              FROM oauth_tokens
             WHERE user_id = $1 AND platform = $2
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, StoreError>(OAuthToken {
                access_token: row.try_get("access_token")?,
                refresh_token: row.try_get("refresh_token")?,
                expires_at: row.try_get("expires_at")?,
                scopes: row.try_get("scopes")?,
            })
        })
        .transpose()
    }

    async fn save_token(
        &self,
        user_id: &str,
        platform: &str,
        token: &OAuthToken,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens
              (user_id, platform, access_token, refresh_token, expires_at, scopes, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (user_id, platform) DO UPDATE SET
              access_token = EXCLUDED.access_token,
              refresh_token = EXCLUDED.refresh_token,
              expires_at = EXCLUDED.expires_at,
              scopes = EXCLUDED.scopes,
              updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .bind(&token.scopes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_token(&self, user_id: &str, platform: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE user_id = $1 AND platform = $2")
            .bind(user_id)
            .bind(platform)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = now + chrono_window(ttl)?;
        // The conflict arm only fires over a lapsed lease, so a live one yields no row.
        let row = sqlx::query(
            r#"
            INSERT INTO oauth_refresh_leases (user_id, platform, holder, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, platform) DO UPDATE SET
              holder = EXCLUDED.holder,
              expires_at = EXCLUDED.expires_at
            WHERE oauth_refresh_leases.expires_at <= $5
               OR oauth_refresh_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_refresh_lease(
        &self,
        user_id: &str,
        platform: &str,
        holder: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM oauth_refresh_leases WHERE user_id = $1 AND platform = $2 AND holder = $3",
        )
        .bind(user_id)
        .bind(platform)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
