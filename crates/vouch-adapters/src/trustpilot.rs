use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{FetchBatch, IngestError, NormalizedRecord, ProviderDescriptor, RateQuota};
use vouch_storage::{ApiAuth, ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_f64, json_id, json_items, json_str, json_string, metadata,
    opt_json, parse_timestamp, AdapterContext, Provider, TrustpilotConfig,
};

pub(crate) const PLATFORM: &str = "trustpilot";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.trustpilot.com/v1";
pub(crate) const DEFAULT_SCHEDULE: &str = "@hourly";
const QUOTA: RateQuota = RateQuota::new(100, Duration::from_secs(60));

pub struct TrustpilotProvider {
    descriptor: ProviderDescriptor,
    config: TrustpilotConfig,
    http: Arc<HttpFetcher>,
}

impl TrustpilotProvider {
    pub fn new(config: TrustpilotConfig, http: Arc<HttpFetcher>) -> Self {
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
impl Provider for TrustpilotProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[&self.config.api_key, &self.config.business_id])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let url = format!(
            "{}/business-units/{}/reviews",
            self.config.base_url.trim_end_matches('/'),
            self.config.business_id
        );
        let request = ApiRequest::get(PLATFORM, url)
            .query("perPage", "100")
            .query("orderBy", "createdat.desc")
            .auth(ApiAuth::Header {
                name: "apikey",
                value: self.config.api_key.clone(),
            });

        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("trustpilot reviews", e))?;
        normalize_trustpilot(&payload, &self.config.business_id, ctx.fetched_at)
    }
}

pub fn normalize_trustpilot(
    payload: &JsonValue,
    business_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let reviews = json_items(payload, "reviews", "trustpilot reviews")?;

    let mut batch = FetchBatch::default();
    for review in reviews {
        let Some(external_id) = json_id(review, &["id"]) else {
            batch.skipped += 1;
            continue;
        };
        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name: json_string(review, &["consumer", "displayName"]),
            author_identifier: json_id(review, &["consumer", "id"]).unwrap_or_default(),
            content: json_string(review, &["text"]),
            rating: json_f64(review, &["stars"]).map(|s| s as f32),
            created_at: parse_timestamp(json_str(review, &["createdAt"]), fetched_at),
            author_email: None,
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("trustpilot_review_id", json!(external_id)),
                ("business_unit_id", json!(business_id)),
                ("title", opt_json(json_str(review, &["title"]))),
                ("language", opt_json(json_str(review, &["language"]))),
            ]),
        });
    }
    Ok(batch)
}
