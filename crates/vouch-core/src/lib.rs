//! Core domain model, error taxonomy and clock for the vouch ingestion engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vouch-core";

/// Source of "now" for everything that reasons about TTLs and windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to pin TTL and window arithmetic in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = chrono::Duration::from_std(by)
            .ok()
            .and_then(|delta| guard.checked_add_signed(delta))
        {
            *guard = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderNotFound,
    RateLimited,
    FetchFailed,
    TokenRefreshFailed,
    PersistFailed,
    Cancelled,
    StateInvalid,
    TokenNotFound,
    SyncInFlight,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProviderNotFound => "provider_not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::TokenRefreshFailed => "token_refresh_failed",
            ErrorKind::PersistFailed => "persist_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StateInvalid => "state_invalid",
            ErrorKind::TokenNotFound => "token_not_found",
            ErrorKind::SyncInFlight => "sync_in_flight",
            ErrorKind::Configuration => "configuration",
        }
    }

    /// Kinds that count against a provider's health streak.
    pub fn is_platform_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::FetchFailed | ErrorKind::TokenRefreshFailed | ErrorKind::TokenNotFound
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Tagged engine error: callers branch on [`IngestError::kind`], the cause rides along.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct IngestError {
    kind: ErrorKind,
    message: String,
    http_status: Option<u16>,
    #[source]
    source: Option<BoxError>,
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.http_status == Some(429)
    }

    pub fn provider_not_found(name: &str) -> Self {
        Self::new(ErrorKind::ProviderNotFound, format!("no provider registered as {name}"))
    }

    pub fn cancelled(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Cancelled, format!("{what} cancelled"))
    }

    pub fn to_run_error(&self) -> RunError {
        RunError {
            kind: self.kind,
            message: self.to_string(),
            http_status: self.http_status,
        }
    }
}

/// Quota a platform grants across every running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub count: u32,
    pub window: Duration,
}

impl RateQuota {
    pub const fn new(count: u32, window: Duration) -> Self {
        Self { count, window }
    }

    pub fn per_second(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return f64::from(self.count);
        }
        f64::from(self.count) / secs
    }
}

/// Authorization-code flow endpoints and client credentials for one platform.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthSpec {
    pub platform: String,
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub extra_auth_params: Vec<(String, String)>,
}

impl fmt::Debug for OAuthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSpec")
            .field("platform", &self.platform)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Immutable per-platform facts, fixed at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub quota: RateQuota,
    pub schedule: String,
    pub oauth: Option<OAuthSpec>,
    pub base_url: String,
}

impl ProviderDescriptor {
    pub fn new(
        name: impl Into<String>,
        quota: RateQuota,
        schedule: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            quota,
            schedule: schedule.into(),
            oauth: None,
            base_url: base_url.into(),
        }
    }

    pub fn with_oauth(mut self, spec: OAuthSpec) -> Self {
        self.oauth = Some(spec);
        self
    }

    pub fn requires_oauth(&self) -> bool {
        self.oauth.is_some()
    }
}

/// Pending authorization attempt, keyed in the store by its opaque state string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub platform: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthToken {
    /// Tokens without an expiry are treated as long-lived.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Lets adapters obtain a live bearer token without knowing how it is stored or refreshed.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, user_id: &str, platform: &str) -> Result<String, IngestError>;
}

/// Canonical testimonial-like record produced by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub external_id: String,
    pub platform_name: String,
    pub author_name: String,
    pub author_identifier: String,
    pub content: String,
    pub rating: Option<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_metadata: BTreeMap<String, JsonValue>,
    /// Reviewer email when the platform discloses one.
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// Set once the reviewer has been resolved to a [`CustomerProfile`].
    #[serde(default)]
    pub customer_profile_id: Option<Uuid>,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.platform_name, &self.external_id)
    }

    /// Deterministic row id derived from the natural key.
    pub fn stable_id(&self) -> Uuid {
        let key = format!("{}:{}", self.platform_name, self.external_id);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.platform_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.author_identifier.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Trimmed, lowercased email, if any is left after trimming.
    pub fn normalized_email(&self) -> Option<String> {
        normalize_email(self.author_email.as_deref())
    }
}

pub fn normalize_email(raw: Option<&str>) -> Option<String> {
    raw.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty())
}

/// Who wrote a record, as far as profile matching is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerIdentity {
    pub workspace_id: Option<Uuid>,
    pub platform: String,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub name: String,
}

impl ReviewerIdentity {
    /// `None` when the record carries neither an email nor an author identifier to match on.
    pub fn from_record(record: &NormalizedRecord) -> Option<Self> {
        let external_id = Some(record.author_identifier.trim().to_string()).filter(|id| !id.is_empty());
        let email = record.normalized_email();
        if external_id.is_none() && email.is_none() {
            return None;
        }
        Some(Self {
            workspace_id: record.workspace_id,
            platform: record.platform_name.clone(),
            external_id,
            email,
            name: record.author_name.clone(),
        })
    }
}

/// A reviewer known to one workspace, shared by every record they authored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub email: Option<String>,
    pub platform: String,
    pub external_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output of one provider fetch: the usable records plus items dropped for lacking a natural key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub records: Vec<NormalizedRecord>,
    pub skipped: usize,
}

impl FetchBatch {
    pub fn extend(&mut self, other: FetchBatch) {
        self.records.extend(other.records);
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
}

/// One orchestrator invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub items_fetched: usize,
    pub items_skipped: usize,
    pub items_upserted: usize,
    pub error: Option<RunError>,
}

impl SyncRun {
    pub fn failed(
        run_id: Uuid,
        provider: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: &IngestError,
    ) -> Self {
        Self {
            run_id,
            provider: provider.into(),
            started_at,
            completed_at,
            items_fetched: 0,
            items_skipped: 0,
            items_upserted: 0,
            error: Some(error.to_run_error()),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
