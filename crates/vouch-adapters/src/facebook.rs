use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{
    normalize_email, AccessTokenSource, FetchBatch, IngestError, NormalizedRecord, OAuthSpec,
    ProviderDescriptor, RateQuota,
};
use vouch_storage::{ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_f64, json_id, json_items, json_str, json_string, metadata,
    parse_timestamp, AdapterContext, FacebookConfig, FanOut, Provider,
};

pub(crate) const PLATFORM: &str = "facebook";
pub(crate) const DEFAULT_BASE_URL: &str = "https://graph.facebook.com/v19.0";
pub(crate) const DEFAULT_AUTH_URL: &str = "https://www.facebook.com/v19.0/dialog/oauth";
pub(crate) const DEFAULT_TOKEN_URL: &str = "https://graph.facebook.com/v19.0/oauth/access_token";
pub(crate) const DEFAULT_SCHEDULE: &str = "@hourly";
pub(crate) const SCOPES: &[&str] = &[
    "pages_read_engagement",
    "pages_show_list",
    "pages_read_user_content",
];
const QUOTA: RateQuota = RateQuota::new(200, Duration::from_secs(60 * 60));

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManagedPage {
    id: String,
    access_token: String,
}

/// Ratings and visitor posts across every page the connected user manages.
pub struct FacebookProvider {
    descriptor: ProviderDescriptor,
    config: FacebookConfig,
    http: Arc<HttpFetcher>,
    tokens: Arc<dyn AccessTokenSource>,
}

impl FacebookProvider {
    pub fn new(
        config: FacebookConfig,
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

    async fn managed_pages(&self, user_token: &str) -> Result<Vec<ManagedPage>, IngestError> {
        let request = ApiRequest::get(PLATFORM, format!("{}/me/accounts", self.base()))
            .query("fields", "id,name,access_token")
            .query("access_token", user_token);
        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("facebook pages", e))?;

        let pages = json_items(&payload, "data", "facebook pages")?
            .iter()
            .filter_map(|page| {
                Some(ManagedPage {
                    id: json_id(page, &["id"])?,
                    access_token: json_str(page, &["access_token"])?.to_string(),
                })
            })
            .collect();
        Ok(pages)
    }

    async fn page_ratings(
        &self,
        page: &ManagedPage,
        fetched_at: DateTime<Utc>,
    ) -> Result<FetchBatch, IngestError> {
        let request = ApiRequest::get(PLATFORM, format!("{}/{}/ratings", self.base(), page.id))
            .query(
                "fields",
                "open_graph_story,reviewer,review_text,rating,recommendation_type,created_time",
            )
            .query("access_token", page.access_token.clone());
        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("facebook ratings", e))?;
        normalize_facebook_ratings(&payload, &page.id, fetched_at)
    }

    async fn page_posts(
        &self,
        page: &ManagedPage,
        fetched_at: DateTime<Utc>,
    ) -> Result<FetchBatch, IngestError> {
        let request = ApiRequest::get(PLATFORM, format!("{}/{}/feed", self.base(), page.id))
            .query("fields", "id,message,created_time,from")
            .query("access_token", page.access_token.clone());
        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("facebook feed", e))?;
        normalize_facebook_posts(&payload, &page.id, fetched_at)
    }
}

#[async_trait]
impl Provider for FacebookProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[
            &self.config.client_id,
            &self.config.client_secret,
            &self.config.account_user_id,
        ])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let user_token = self
            .tokens
            .access_token(&self.config.account_user_id, PLATFORM)
            .await?;
        let pages = self.managed_pages(&user_token).await?;

        // Ratings and visitor posts are separate sources; losing one keeps the other.
        let mut fan_out = FanOut::new("facebook page sources", ctx);
        for page in &pages {
            let ratings = self.page_ratings(page, ctx.fetched_at).await;
            fan_out.absorb(&format!("{}/ratings", page.id), ratings)?;
            let posts = self.page_posts(page, ctx.fetched_at).await;
            fan_out.absorb(&format!("{}/feed", page.id), posts)?;
        }
        fan_out.finish()
    }
}

/// Page ratings. A numeric `rating` wins; otherwise a recommendation maps positive to 5 and
/// negative to 1.
pub fn normalize_facebook_ratings(
    payload: &JsonValue,
    page_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let ratings = json_items(payload, "data", "facebook ratings")?;

    let mut batch = FetchBatch::default();
    for item in ratings {
        let Some(external_id) =
            json_id(item, &["open_graph_story", "id"]).or_else(|| json_id(item, &["id"]))
        else {
            batch.skipped += 1;
            continue;
        };

        let recommendation = json_str(item, &["recommendation_type"]);
        let rating = json_f64(item, &["rating"])
            .filter(|r| *r > 0.0)
            .map(|r| r as f32)
            .or(match recommendation {
                Some("positive") => Some(5.0),
                Some("negative") => Some(1.0),
                _ => None,
            });

        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: json_string(item, &["reviewer", "name"]),
            author_identifier: json_id(item, &["reviewer", "id"]).unwrap_or_default(),
            content: json_string(item, &["review_text"]),
            rating,
            created_at: parse_timestamp(json_str(item, &["created_time"]), fetched_at),
            author_email: normalize_email(json_str(item, &["reviewer", "email"])),
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("page_id", json!(page_id)),
                ("kind", json!("rating")),
                (
                    "recommendation_type",
                    recommendation.map(|r| json!(r)).unwrap_or(JsonValue::Null),
                ),
            ]),
        });
    }
    Ok(batch)
}

/// Visitor posts on the page feed. The page's own posts and posts without text are ignored
/// outright rather than counted as skipped.
pub fn normalize_facebook_posts(
    payload: &JsonValue,
    page_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let posts = json_items(payload, "data", "facebook feed")?;

    let mut batch = FetchBatch::default();
    for post in posts {
        let author_id = json_id(post, &["from", "id"]).unwrap_or_default();
        let message = json_string(post, &["message"]);
        if author_id == page_id || message.is_empty() {
            continue;
        }
        let Some(external_id) = json_id(post, &["id"]) else {
            batch.skipped += 1;
            continue;
        };

        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: json_string(post, &["from", "name"]),
            author_identifier: author_id,
            content: message,
            rating: None,
            created_at: parse_timestamp(json_str(post, &["created_time"]), fetched_at),
            author_email: normalize_email(json_str(post, &["from", "email"])),
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("page_id", json!(page_id)),
                ("kind", json!("post")),
                ("post_id", json!(external_id)),
            ]),
        });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, StaticTokens};
    use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
    use std::collections::HashMap;
    use vouch_core::ErrorKind;

    fn config(base_url: String) -> FacebookConfig {
        FacebookConfig {
            client_id: "fb-id".into(),
            client_secret: "fb-secret".into(),
            account_user_id: "owner-1".into(),
            base_url,
            auth_url: DEFAULT_AUTH_URL.into(),
            token_url: DEFAULT_TOKEN_URL.into(),
            schedule: DEFAULT_SCHEDULE.into(),
        }
    }

    #[test]
    fn recommendations_become_star_ratings() {
        let payload = json!({"data": [
            {"open_graph_story": {"id": "og-1"}, "recommendation_type": "positive",
             "review_text": "Friendly staff", "reviewer": {"id": "u1", "name": "Kim"},
             "created_time": "2026-02-01T12:00:00+0000"},
            {"open_graph_story": {"id": "og-2"}, "recommendation_type": "negative"},
            {"id": "legacy-3", "rating": 4},
            {"review_text": "no id anywhere"}
        ]});
        let batch = normalize_facebook_ratings(&payload, "page-1", Utc::now()).expect("ratings");
        assert_eq!(batch.skipped, 1);
        let ratings: Vec<Option<f32>> = batch.records.iter().map(|r| r.rating).collect();
        assert_eq!(ratings, vec![Some(5.0), Some(1.0), Some(4.0)]);
        assert_eq!(batch.records[2].external_id, "legacy-3");
        assert_eq!(batch.records[0].source_metadata["page_id"], "page-1");
    }

    #[test]
    fn feed_ignores_page_posts_and_empty_messages() {
        let payload = json!({"data": [
            {"id": "p1", "message": "Our hours changed", "from": {"id": "page-1"}},
            {"id": "p2", "message": "", "from": {"id": "u2"}},
            {"id": "p3", "message": "Loved the workshop",
             "from": {"id": "u3", "name": "Ola", "email": "Ola@Example.com"}}
        ]});
        let batch = normalize_facebook_posts(&payload, "page-1", Utc::now()).expect("feed");
        assert_eq!(batch.skipped, 0);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].external_id, "p3");
        assert_eq!(batch.records[0].author_name, "Ola");
        assert_eq!(batch.records[0].author_email.as_deref(), Some("ola@example.com"));
    }

    #[tokio::test]
    async fn fetch_walks_pages_with_page_tokens() {
        let app = Router::new()
            .route(
                "/me/accounts",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("access_token").map(String::as_str), Some("user-token"));
                    Json(json!({"data": [{"id": "page-1", "name": "Acme", "access_token": "page-token"}]}))
                }),
            )
            .route(
                "/page-1/ratings",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("access_token").map(String::as_str), Some("page-token"));
                    Json(json!({"data": [{"open_graph_story": {"id": "og-1"}, "recommendation_type": "positive"}]}))
                }),
            )
            .route(
                "/page-1/feed",
                get(|| async {
                    Json(json!({"data": [{"id": "p9", "message": "Great", "from": {"id": "u9"}}]}))
                }),
            );
        let base = test_support::spawn(app).await;
        let tokens = StaticTokens(HashMap::from([("facebook".to_string(), "user-token".to_string())]));
        let provider = FacebookProvider::new(config(base), None, test_support::http(), Arc::new(tokens));

        let batch = provider
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect("fetch");
        let ids: Vec<&str> = batch.records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["og-1", "p9"]);
    }

    fn two_pages() -> Router {
        Router::new().route(
            "/me/accounts",
            get(|| async {
                Json(json!({"data": [
                    {"id": "page-1", "access_token": "t1"},
                    {"id": "page-2", "access_token": "t2"}
                ]}))
            }),
        )
    }

    fn provider_at(base: String) -> FacebookProvider {
        let tokens = StaticTokens(HashMap::from([("facebook".to_string(), "user-token".to_string())]));
        FacebookProvider::new(config(base), None, test_support::http(), Arc::new(tokens))
    }

    #[tokio::test]
    async fn rejected_ratings_keep_the_same_page_feed() {
        let app = two_pages()
            .route("/page-1/ratings", get(|| async { StatusCode::UNAUTHORIZED }))
            .route(
                "/page-1/feed",
                get(|| async { Json(json!({"data": [{"id": "p1", "message": "Kind team", "from": {"id": "u1"}}]})) }),
            )
            .route("/page-2/ratings", get(|| async { Json(json!({"data": []})) }))
            .route("/page-2/feed", get(|| async { Json(json!({"data": []})) }));
        let provider = provider_at(test_support::spawn(app).await);

        let batch = provider
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect("partial fetch");
        let ids: Vec<&str> = batch.records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["p1"]);
    }

    #[tokio::test]
    async fn every_page_source_failing_is_a_fetch_failure() {
        let app = two_pages()
            .route("/page-1/ratings", get(|| async { StatusCode::UNAUTHORIZED }))
            .route("/page-1/feed", get(|| async { StatusCode::UNAUTHORIZED }))
            .route("/page-2/ratings", get(|| async { Json(json!({"data": "not-an-array"})) }))
            .route("/page-2/feed", get(|| async { Json(json!({"data": "not-an-array"})) }));
        let provider = provider_at(test_support::spawn(app).await);

        let err = provider
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect_err("nothing succeeded");
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
        assert!(err.message().contains("all 4"));
    }

    #[tokio::test]
    async fn missing_token_surfaces_before_any_request() {
        let provider = FacebookProvider::new(
            config("http://127.0.0.1:9".into()),
            None,
            test_support::http(),
            Arc::new(StaticTokens::default()),
        );
        let err = provider
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect_err("no token");
        assert_eq!(err.kind(), ErrorKind::TokenNotFound);
    }
}
