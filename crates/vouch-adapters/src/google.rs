use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{
    AccessTokenSource, FetchBatch, IngestError, NormalizedRecord, OAuthSpec, ProviderDescriptor,
    RateQuota,
};
use vouch_storage::{ApiAuth, ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_at, json_id, json_items, json_str, json_string, metadata,
    opt_json, parse_timestamp, AdapterContext, FanOut, GoogleConfig, Provider,
};

pub(crate) const PLATFORM: &str = "google";
pub(crate) const DEFAULT_BASE_URL: &str = "https://mybusiness.googleapis.com/v4";
pub(crate) const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub(crate) const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const DEFAULT_SCHEDULE: &str = "@hourly";
pub(crate) const SCOPES: &[&str] = &["https://www.googleapis.com/auth/business.manage"];
const QUOTA: RateQuota = RateQuota::new(100, Duration::from_secs(60));

/// Google Business Profile reviews across every location of one account.
pub struct GoogleProvider {
    descriptor: ProviderDescriptor,
    config: GoogleConfig,
    http: Arc<HttpFetcher>,
    tokens: Arc<dyn AccessTokenSource>,
}

impl GoogleProvider {
    pub fn new(
        config: GoogleConfig,
        oauth: Option<OAuthSpec>,
        http: Arc<HttpFetcher>,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        let mut descriptor =
            ProviderDescriptor::new(PLATFORM, QUOTA, config.schedule.clone(), config.base_url.clone());
        if let Some(spec) = oauth {
            descriptor = descriptor.with_oauth(spec);
        }
        Self {
            descriptor,
            config,
            http,
            tokens,
        }
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[
            &self.config.client_id,
            &self.config.client_secret,
            &self.config.account_name,
            &self.config.account_user_id,
        ])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let token = self
            .tokens
            .access_token(&self.config.account_user_id, PLATFORM)
            .await?;

        let account = self.config.account_name.trim_start_matches("accounts/");
        let request = ApiRequest::get(PLATFORM, format!("{}/accounts/{account}/locations", self.base()))
            .auth(ApiAuth::Bearer(token.clone()));
        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("google locations", e))?;
        let locations = normalize_google_locations(&payload)?;

        let mut fan_out = FanOut::new("google locations", ctx);
        for location in &locations {
            let request = ApiRequest::get(PLATFORM, format!("{}/{location}/reviews", self.base()))
                .auth(ApiAuth::Bearer(token.clone()));
            let reviews = match self.http.get_json(request).await {
                Ok(payload) => normalize_google_reviews(&payload, location, ctx.fetched_at),
                Err(err) => Err(fetch_failed("google reviews", err)),
            };
            fan_out.absorb(location, reviews)?;
        }
        fan_out.finish()
    }
}

/// Resource names (`accounts/{a}/locations/{l}`) of every location in the payload.
pub fn normalize_google_locations(payload: &JsonValue) -> Result<Vec<String>, IngestError> {
    Ok(json_items(payload, "locations", "google locations")?
        .iter()
        .filter_map(|location| json_id(location, &["name"]))
        .collect())
}

fn star_rating(value: Option<&JsonValue>) -> Option<f32> {
    match value? {
        JsonValue::String(s) => match s.as_str() {
            "ONE" => Some(1.0),
            "TWO" => Some(2.0),
            "THREE" => Some(3.0),
            "FOUR" => Some(4.0),
            "FIVE" => Some(5.0),
            _ => None,
        },
        JsonValue::Number(n) => n.as_f64().map(|n| n as f32),
        _ => None,
    }
}

pub fn normalize_google_reviews(
    payload: &JsonValue,
    location: &str,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let reviews = json_items(payload, "reviews", "google reviews")?;

    let mut batch = FetchBatch::default();
    for review in reviews {
        let Some(external_id) = json_id(review, &["reviewId"]) else {
            batch.skipped += 1;
            continue;
        };
        let reviewer = json_string(review, &["reviewer", "displayName"]);
        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: reviewer.clone(),
            // Reviews carry no stable reviewer id; the display name is the best handle available.
            author_identifier: reviewer,
            content: json_string(review, &["comment"]),
            rating: star_rating(json_at(review, &["starRating"])),
            created_at: parse_timestamp(json_str(review, &["createTime"]), fetched_at),
            author_email: None,
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("location", json!(location)),
                ("review_name", opt_json(json_str(review, &["name"]))),
                (
                    "profile_photo_url",
                    opt_json(json_str(review, &["reviewer", "profilePhotoUrl"])),
                ),
            ]),
        });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, StaticTokens};
    use axum::{http::HeaderMap, http::StatusCode, routing::get, Json, Router};
    use std::collections::HashMap;
    use vouch_core::ErrorKind;

    fn provider(base_url: String) -> GoogleProvider {
        let tokens = StaticTokens(HashMap::from([("google".to_string(), "g-token".to_string())]));
        GoogleProvider::new(
            GoogleConfig {
                client_id: "gid".into(),
                client_secret: "gsecret".into(),
                account_name: "accounts/123".into(),
                account_user_id: "owner-1".into(),
                base_url,
                auth_url: DEFAULT_AUTH_URL.into(),
                token_url: DEFAULT_TOKEN_URL.into(),
                schedule: DEFAULT_SCHEDULE.into(),
            },
            None,
            test_support::http(),
            Arc::new(tokens),
        )
    }

    #[test]
    fn enum_star_ratings_map_to_numbers() {
        let payload = json!({"reviews": [
            {"reviewId": "r1", "starRating": "FIVE", "comment": "Ace",
             "reviewer": {"displayName": "Noor"}, "createTime": "2026-02-10T08:00:00.123Z"},
            {"reviewId": "r2", "starRating": "TWO"},
            {"reviewId": "r3", "starRating": "STAR_RATING_UNSPECIFIED"},
            {"comment": "orphan"}
        ]});
        let batch = normalize_google_reviews(&payload, "accounts/1/locations/9", Utc::now())
            .expect("reviews");
        assert_eq!(batch.skipped, 1);
        let ratings: Vec<Option<f32>> = batch.records.iter().map(|r| r.rating).collect();
        assert_eq!(ratings, vec![Some(5.0), Some(2.0), None]);
        assert_eq!(batch.records[0].author_identifier, "Noor");
        assert_eq!(batch.records[0].source_metadata["location"], "accounts/1/locations/9");
    }

    #[tokio::test]
    async fn fetch_collects_reviews_from_each_location() {
        let app = Router::new()
            .route(
                "/accounts/123/locations",
                get(|headers: HeaderMap| async move {
                    assert_eq!(
                        headers.get("authorization").and_then(|v| v.to_str().ok()),
                        Some("Bearer g-token")
                    );
                    Json(json!({"locations": [
                        {"name": "accounts/123/locations/1"},
                        {"name": "accounts/123/locations/2"}
                    ]}))
                }),
            )
            .route(
                "/accounts/123/locations/1/reviews",
                get(|| async { Json(json!({"reviews": [{"reviewId": "a", "starRating": "FOUR"}]})) }),
            )
            .route(
                "/accounts/123/locations/2/reviews",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let base = test_support::spawn(app).await;

        let batch = provider(base)
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect("one location failing does not fail the run");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].external_id, "a");
    }

    #[tokio::test]
    async fn every_location_failing_is_a_fetch_failure() {
        let app = Router::new()
            .route(
                "/accounts/123/locations",
                get(|| async {
                    Json(json!({"locations": [
                        {"name": "accounts/123/locations/1"},
                        {"name": "accounts/123/locations/2"}
                    ]}))
                }),
            )
            .route(
                "/accounts/123/locations/1/reviews",
                get(|| async { StatusCode::UNAUTHORIZED }),
            )
            .route(
                "/accounts/123/locations/2/reviews",
                get(|| async { Json(json!({"reviews": {"oops": true}})) }),
            );
        let base = test_support::spawn(app).await;
        let err = provider(base)
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect_err("no location succeeded");
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
    }

    #[tokio::test]
    async fn throttled_location_fails_the_run() {
        let app = Router::new()
            .route(
                "/accounts/123/locations",
                get(|| async { Json(json!({"locations": [{"name": "accounts/123/locations/1"}]})) }),
            )
            .route(
                "/accounts/123/locations/1/reviews",
                get(|| async { StatusCode::TOO_MANY_REQUESTS }),
            );
        let base = test_support::spawn(app).await;
        let err = provider(base)
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect_err("429 propagates");
        assert!(err.is_too_many_requests());
    }
}
