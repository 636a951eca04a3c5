//! Shared-store backends + outbound HTTP utilities for vouch.

pub mod bucket;
pub mod http;
pub mod oauth;
pub mod profiles;
pub mod records;
pub mod window;

use sqlx::PgPool;
use thiserror::Error;
use vouch_core::{ErrorKind, IngestError};

pub use bucket::TokenBucket;
pub use http::{
    classify_reqwest_error, classify_status, ApiAuth, ApiRequest, BackoffPolicy, FetchError,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use oauth::{MemoryOAuthStore, OAuthStore, PgOAuthStore};
pub use profiles::{MemoryProfileStore, PgProfileStore, ProfileStore};
pub use records::{
    validate_record, MemoryRecordStore, PgRecordStore, RecordStore, StoredRecord, UpsertSummary,
};
pub use window::{MemoryWindowStore, PgWindowStore, WindowStore};

pub const CRATE_NAME: &str = "vouch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Wraps this store failure in the engine taxonomy under `kind`.
    pub fn into_ingest(self, kind: ErrorKind, what: &str) -> IngestError {
        IngestError::new(kind, format!("{what}: {self}")).with_source(self)
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn chrono_window(window: std::time::Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(window)
        .map_err(|e| StoreError::Invalid(format!("window {window:?} out of range: {e}")))
}
