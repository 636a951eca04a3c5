use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{FetchBatch, IngestError, NormalizedRecord, ProviderDescriptor, RateQuota};
use vouch_storage::{ApiAuth, ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_f64, json_id, json_items, json_str, json_string, metadata,
    opt_json, parse_timestamp, AdapterContext, Provider, YelpConfig,
};

pub(crate) const PLATFORM: &str = "yelp";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.yelp.com/v3";
pub(crate) const DEFAULT_SCHEDULE: &str = "@daily";
const QUOTA: RateQuota = RateQuota::new(5000, Duration::from_secs(24 * 60 * 60));

pub struct YelpProvider {
    descriptor: ProviderDescriptor,
    config: YelpConfig,
    http: Arc<HttpFetcher>,
}

impl YelpProvider {
    pub fn new(config: YelpConfig, http: Arc<HttpFetcher>) -> Self {
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
impl Provider for YelpProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[&self.config.api_key, &self.config.business_id])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let url = format!(
            "{}/businesses/{}/reviews",
            self.config.base_url.trim_end_matches('/'),
            self.config.business_id
        );
        let request = ApiRequest::get(PLATFORM, url)
            .query("sort_by", "newest")
            .auth(ApiAuth::Bearer(self.config.api_key.clone()));

        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("yelp reviews", e))?;
        normalize_yelp(&payload, &self.config.business_id, ctx.fetched_at)
    }
}

pub fn normalize_yelp(
    payload: &JsonValue,
    business_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let reviews = json_items(payload, "reviews", "yelp reviews")?;

    let mut batch = FetchBatch::default();
    for review in reviews {
        let Some(external_id) = json_id(review, &["id"]) else {
            batch.skipped += 1;
            continue;
        };
        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: json_string(review, &["user", "name"]),
            author_identifier: json_id(review, &["user", "id"]).unwrap_or_default(),
            content: json_string(review, &["text"]),
            rating: json_f64(review, &["rating"]).map(|r| r as f32),
            created_at: parse_timestamp(json_str(review, &["time_created"]), fetched_at),
            author_email: None,
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("yelp_review_id", json!(external_id)),
                ("yelp_business_id", json!(business_id)),
                ("url", opt_json(json_str(review, &["url"]))),
            ]),
        });
    }
    Ok(batch)
}
