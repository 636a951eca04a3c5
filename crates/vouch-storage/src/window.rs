//! Sliding-window marker storage shared by every instance.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::{chrono_window, StoreError};

#[async_trait]
pub trait WindowStore: Send + Sync {
    /// One atomic step for `key`: drop markers older than `now - window`, count what is left,
    /// append a marker at `now` and push the key's expiry to `now + window`.
    /// Returns the count taken before the append.
    async fn record_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Drops keys whose expiry has passed. Returns how many keys went away.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct WindowEntry {
    markers: VecDeque<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-process stand-in for the shared store.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    keys: Mutex<HashMap<String, WindowEntry>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn marker_count(&self, key: &str) -> usize {
        self.keys
            .lock()
            .await
            .get(key)
            .map(|e| e.markers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let window = chrono_window(window)?;
        let cutoff = now - window;

        let mut keys = self.keys.lock().await;
        let entry = keys.entry(key.to_string()).or_default();
        if entry.expires_at.is_some_and(|at| at <= now) {
            entry.markers.clear();
        }
        // Markers are appended in call order; a clock stepping backwards can leave older ones later in the queue.
        entry.markers.retain(|at| *at >= cutoff);
        let count = entry.markers.len() as u64;
        entry.markers.push_back(now);
        entry.expires_at = Some(now + window);
        Ok(count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut keys = self.keys.lock().await;
        let before = keys.len();
        keys.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        Ok((before - keys.len()) as u64)
    }
}

/// Postgres-backed window. Atomicity comes from a per-key transaction-scoped advisory lock.
#[derive(Debug, Clone)]
pub struct PgWindowStore {
    pool: PgPool,
}

impl PgWindowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WindowStore for PgWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let window = chrono_window(window)?;
        let cutoff = now - window;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM rate_limit_markers WHERE limiter_key = $1 AND recorded_at < $2")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_markers WHERE limiter_key = $1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("INSERT INTO rate_limit_markers (limiter_key, recorded_at) VALUES ($1, $2)")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO rate_limit_keys (limiter_key, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (limiter_key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(now + window)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM rate_limit_markers m
             USING rate_limit_keys k
             WHERE m.limiter_key = k.limiter_key
               AND k.expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let purged = sqlx::query("DELETE FROM rate_limit_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts")
    }

    #[tokio::test]
    async fn counts_exclude_markers_outside_the_window() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(10);

        assert_eq!(store.record_and_count("k", t0(), window).await.expect("1"), 0);
        assert_eq!(
            store
                .record_and_count("k", t0() + chrono::Duration::seconds(4), window)
                .await
                .expect("2"),
            1
        );
        // First marker is now older than the window.
        assert_eq!(
            store
                .record_and_count("k", t0() + chrono::Duration::seconds(12), window)
                .await
                .expect("3"),
            1
        );
        assert_eq!(store.marker_count("k").await, 2);
    }

    #[tokio::test]
    async fn rejected_attempts_still_leave_markers() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(60);
        for i in 0..5 {
            let count = store
                .record_and_count("yelp", t0() + chrono::Duration::seconds(i), window)
                .await
                .expect("record");
            assert_eq!(count, i as u64);
        }
        assert_eq!(store.marker_count("yelp").await, 5);
    }

    #[tokio::test]
    async fn keys_are_isolated_and_expire() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(5);
        store.record_and_count("a", t0(), window).await.expect("a");
        store.record_and_count("b", t0(), window).await.expect("b");
        assert_eq!(store.record_and_count("a", t0(), window).await.expect("a2"), 1);

        let purged = store
            .purge_expired(t0() + chrono::Duration::seconds(6))
            .await
            .expect("purge");
        assert_eq!(purged, 2);
        assert_eq!(store.marker_count("a").await, 0);
    }
}
