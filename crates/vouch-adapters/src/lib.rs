//! Provider capability contract + platform adapters that map third-party payloads to records.

mod config;
mod facebook;
mod google;
mod instagram;
mod trustpilot;
mod twitter;
mod yelp;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;
use vouch_core::{
    AccessTokenSource, ErrorKind, FetchBatch, IngestError, OAuthSpec, ProviderDescriptor, RateQuota,
};
use vouch_storage::{FetchError, HttpFetcher};

pub use config::{
    FacebookConfig, GoogleConfig, InstagramConfig, ProvidersConfig, TrustpilotConfig,
    TwitterConfig, YelpConfig,
};
pub use facebook::{normalize_facebook_posts, normalize_facebook_ratings, FacebookProvider};
pub use google::{normalize_google_locations, normalize_google_reviews, GoogleProvider};
pub use instagram::{normalize_instagram, InstagramProvider};
pub use trustpilot::{normalize_trustpilot, TrustpilotProvider};
pub use twitter::{normalize_twitter, TwitterProvider};
pub use yelp::{normalize_yelp, YelpProvider};

pub const CRATE_NAME: &str = "vouch-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

/// One external platform. Implementations own their credentials and HTTP shape; the
/// orchestrator only sees this contract.
#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn rate_limit(&self) -> RateQuota {
        self.descriptor().quota
    }

    fn schedule(&self) -> &str {
        &self.descriptor().schedule
    }

    fn oauth_requirement(&self) -> Option<&OAuthSpec> {
        self.descriptor().oauth.as_ref()
    }

    /// Every required credential is present and non-empty.
    fn is_configured(&self) -> bool;

    /// A malformed top-level payload fails the call; an item without an id is skipped and counted.
    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError>;
}

/// Builds every known adapter. Unconfigured ones are included so they can be listed; the
/// scheduler is what leaves them out.
pub fn build_providers(
    config: &ProvidersConfig,
    http: Arc<HttpFetcher>,
    tokens: Arc<dyn AccessTokenSource>,
    oauth_callback_url: &str,
) -> Vec<Arc<dyn Provider>> {
    let mut facebook_spec = None;
    let mut google_spec = None;
    for spec in config.oauth_specs(oauth_callback_url) {
        match spec.platform.as_str() {
            facebook::PLATFORM => facebook_spec = Some(spec),
            google::PLATFORM => google_spec = Some(spec),
            _ => {}
        }
    }

    vec![
        Arc::new(TwitterProvider::new(config.twitter.clone(), http.clone())),
        Arc::new(TrustpilotProvider::new(config.trustpilot.clone(), http.clone())),
        Arc::new(YelpProvider::new(config.yelp.clone(), http.clone())),
        Arc::new(InstagramProvider::new(config.instagram.clone(), http.clone())),
        Arc::new(FacebookProvider::new(
            config.facebook.clone(),
            facebook_spec,
            http.clone(),
            tokens.clone(),
        )),
        Arc::new(GoogleProvider::new(config.google.clone(), google_spec, http, tokens)),
    ]
}

pub(crate) fn fetch_failed(what: &str, err: FetchError) -> IngestError {
    let status = err.status();
    let mapped = IngestError::new(ErrorKind::FetchFailed, format!("{what}: {err}"));
    let mapped = match status {
        Some(status) => mapped.with_status(status),
        None => mapped,
    };
    mapped.with_source(err)
}

pub(crate) fn malformed(what: &str, detail: impl std::fmt::Display) -> IngestError {
    IngestError::new(ErrorKind::FetchFailed, format!("{what}: malformed payload: {detail}"))
}

/// The array under `key`. Absent or null means no items; anything else that is not an array
/// is a shape error for the whole payload.
pub(crate) fn json_items<'a>(
    payload: &'a JsonValue,
    key: &str,
    what: &str,
) -> Result<&'a [JsonValue], IngestError> {
    let object = payload
        .as_object()
        .ok_or_else(|| malformed(what, "top-level payload is not an object"))?;
    match object.get(key) {
        None | Some(JsonValue::Null) => Ok(&[]),
        Some(JsonValue::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(malformed(what, format!("`{key}` is not an array"))),
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_string(value: &JsonValue, path: &[&str]) -> String {
    json_str(value, path).unwrap_or_default().trim().to_string()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

/// Ids arrive as strings on most platforms and as numbers on a few.
pub(crate) fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, Graph API `+0000` offsets, or a bare `YYYY-MM-DD HH:MM:SS` taken as UTC.
/// Anything else falls back to the fetch time.
pub(crate) fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return fallback;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc();
    }
    fallback
}

pub(crate) fn metadata<const N: usize>(
    pairs: [(&str, JsonValue); N],
) -> BTreeMap<String, JsonValue> {
    pairs
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub(crate) fn opt_json(value: Option<&str>) -> JsonValue {
    value
        .filter(|s| !s.is_empty())
        .map(|s| JsonValue::String(s.to_string()))
        .unwrap_or(JsonValue::Null)
}

pub(crate) fn all_present<S: AsRef<str>>(values: &[S]) -> bool {
    values.iter().all(|v| !v.as_ref().trim().is_empty())
}

/// Collects the per-source results of a fetch that fans out over pages or locations.
/// One failed source is logged and skipped; a 429 aborts at once; a run in which every
/// attempted source failed reports the last failure.
pub(crate) struct FanOut<'a> {
    what: &'static str,
    ctx: &'a AdapterContext,
    batch: FetchBatch,
    attempted: usize,
    succeeded: usize,
    last_error: Option<IngestError>,
}

impl<'a> FanOut<'a> {
    pub(crate) fn new(what: &'static str, ctx: &'a AdapterContext) -> Self {
        Self {
            what,
            ctx,
            batch: FetchBatch::default(),
            attempted: 0,
            succeeded: 0,
            last_error: None,
        }
    }

    pub(crate) fn absorb(
        &mut self,
        source: &str,
        result: Result<FetchBatch, IngestError>,
    ) -> Result<(), IngestError> {
        self.attempted += 1;
        match result {
            Ok(batch) => {
                self.succeeded += 1;
                self.batch.extend(batch);
                Ok(())
            }
            Err(err) if err.is_too_many_requests() => Err(err),
            Err(err) => {
                warn!(run_id = %self.ctx.run_id, source, error = %err, "skipping {}", self.what);
                self.last_error = Some(err);
                Ok(())
            }
        }
    }

    pub(crate) fn finish(self) -> Result<FetchBatch, IngestError> {
        match self.last_error {
            Some(last) if self.succeeded == 0 => {
                let mut err = IngestError::new(
                    ErrorKind::FetchFailed,
                    format!("all {} {} failed; last: {}", self.attempted, self.what, last.message()),
                );
                if let Some(status) = last.http_status() {
                    err = err.with_status(status);
                }
                Err(err.with_source(last))
            }
            _ => Ok(self.batch),
        }
    }
}
