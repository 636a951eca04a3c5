use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{FetchBatch, IngestError, NormalizedRecord, ProviderDescriptor, RateQuota};
use vouch_storage::{ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_id, json_items, json_str, json_string, metadata, opt_json,
    parse_timestamp, AdapterContext, InstagramConfig, Provider,
};

pub(crate) const PLATFORM: &str = "instagram";
pub(crate) const DEFAULT_BASE_URL: &str = "https://graph.instagram.com";
pub(crate) const DEFAULT_SCHEDULE: &str = "@hourly";
const QUOTA: RateQuota = RateQuota::new(200, Duration::from_secs(60 * 60));
const MEDIA_FIELDS: &str = "id,caption,media_type,media_url,permalink,timestamp,username";

/// Captions on the account's own media.
pub struct InstagramProvider {
    descriptor: ProviderDescriptor,
    config: InstagramConfig,
    http: Arc<HttpFetcher>,
}

impl InstagramProvider {
    pub fn new(config: InstagramConfig, http: Arc<HttpFetcher>) -> Self {
        let descriptor =
            ProviderDescriptor::new(PLATFORM, QUOTA, config.schedule.clone(), config.base_url.clone());
        Self {
            descriptor,
            config,
            http,
        }
    }
}

#[async_trait]
impl Provider for InstagramProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[&self.config.access_token, &self.config.user_id])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let url = format!(
            "{}/{}/media",
            self.config.base_url.trim_end_matches('/'),
            self.config.user_id
        );
        // Graph API takes the token as a query parameter.
        let request = ApiRequest::get(PLATFORM, url)
            .query("fields", MEDIA_FIELDS)
            .query("access_token", self.config.access_token.clone());

        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("instagram media", e))?;
        normalize_instagram(&payload, ctx.fetched_at)
    }
}

pub fn normalize_instagram(
    payload: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let media = json_items(payload, "data", "instagram media")?;

    let mut batch = FetchBatch::default();
    for item in media {
        let Some(external_id) = json_id(item, &["id"]) else {
            batch.skipped += 1;
            continue;
        };
        let username = json_string(item, &["username"]);
        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: username.clone(),
            author_identifier: username,
            content: json_string(item, &["caption"]),
            rating: None,
            created_at: parse_timestamp(json_str(item, &["timestamp"]), fetched_at),
            author_email: None,
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("media_id", json!(external_id)),
                ("media_type", opt_json(json_str(item, &["media_type"]))),
                ("media_url", opt_json(json_str(item, &["media_url"]))),
                ("permalink", opt_json(json_str(item, &["permalink"]))),
            ]),
        });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::{extract::Query, routing::get, Json, Router};
    use std::collections::HashMap;

    #[test]
    fn media_keeps_type_and_url_in_metadata() {
        let payload = json!({
            "data": [{
                "id": "17895695668004550",
                "caption": "Thank you @acme for the fast fix!",
                "media_type": "VIDEO",
                "media_url": "https://cdn.example/v.mp4",
                "timestamp": "2026-01-30T08:00:00+0000",
                "username": "acme_fan"
            }],
            "paging": {}
        });
        let batch = normalize_instagram(&payload, Utc::now()).expect("normalize");
        let record = &batch.records[0];
        assert_eq!(record.author_identifier, "acme_fan");
        assert_eq!(record.source_metadata["media_type"], "VIDEO");
        assert_eq!(record.rating, None);
    }

    #[tokio::test]
    async fn fetch_passes_token_as_query_parameter() {
        let app = Router::new().route(
            "/ig-1/media",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let token = params.get("access_token").cloned().unwrap_or_default();
                Json(json!({"data": [{"id": "m1", "caption": token}]}))
            }),
        );
        let base = test_support::spawn(app).await;
        let provider = InstagramProvider::new(
            InstagramConfig {
                access_token: "ig-token".into(),
                user_id: "ig-1".into(),
                base_url: base,
                schedule: DEFAULT_SCHEDULE.into(),
            },
            test_support::http(),
        );
        let batch = provider
            .fetch(&AdapterContext::new(Utc::now()))
            .await
            .expect("fetch");
        assert_eq!(batch.records[0].content, "ig-token");
    }
}
