use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use vouch_core::{FetchBatch, IngestError, NormalizedRecord, ProviderDescriptor, RateQuota};
use vouch_storage::{ApiAuth, ApiRequest, HttpFetcher};

use crate::{
    all_present, fetch_failed, json_id, json_items, json_str, json_string, metadata,
    parse_timestamp, AdapterContext, Provider, TwitterConfig,
};

pub(crate) const PLATFORM: &str = "twitter";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.x.com/2";
pub(crate) const DEFAULT_SCHEDULE: &str = "*/5 * * * *";
const QUOTA: RateQuota = RateQuota::new(450, Duration::from_secs(15 * 60));

/// Recent posts from one account via the v2 search endpoint.
pub struct TwitterProvider {
    descriptor: ProviderDescriptor,
    config: TwitterConfig,
    http: Arc<HttpFetcher>,
}

impl TwitterProvider {
    pub fn new(config: TwitterConfig, http: Arc<HttpFetcher>) -> Self {
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
impl Provider for TwitterProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_configured(&self) -> bool {
        all_present(&[&self.config.bearer_token, &self.config.username])
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<FetchBatch, IngestError> {
        let url = format!(
            "{}/tweets/search/recent",
            self.config.base_url.trim_end_matches('/')
        );
        let request = ApiRequest::get(PLATFORM, url)
            .query("query", format!("from:{}", self.config.username))
            .query("tweet.fields", "created_at,author_id")
            .query("expansions", "author_id")
            .query("user.fields", "name,username")
            .auth(ApiAuth::Bearer(self.config.bearer_token.clone()));

        let payload = self
            .http
            .get_json(request)
            .await
            .map_err(|e| fetch_failed("twitter search", e))?;
        normalize_twitter(&payload, ctx.fetched_at)
    }
}

/// Maps a v2 search response. Author names come from the `includes.users` expansion when present.
pub fn normalize_twitter(
    payload: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<FetchBatch, IngestError> {
    let tweets = json_items(payload, "data", "twitter search")?;

    let mut users: HashMap<String, (String, String)> = HashMap::new();
    if let Some(list) = payload.pointer("/includes/users").and_then(JsonValue::as_array) {
        for user in list {
            if let Some(id) = json_id(user, &["id"]) {
                users.insert(id, (json_string(user, &["name"]), json_string(user, &["username"])));
            }
        }
    }

    let mut batch = FetchBatch::default();
    for tweet in tweets {
        let Some(external_id) = json_id(tweet, &["id"]) else {
            batch.skipped += 1;
            continue;
        };
        let author_id = json_id(tweet, &["author_id"]).unwrap_or_default();
        let (author_name, username) = users.get(&author_id).cloned().unwrap_or_default();

        batch.records.push(NormalizedRecord {
            external_id: external_id.clone(),
            platform_name: PLATFORM.to_string(),
            author_name,
            author_identifier: author_id.clone(),
            content: json_string(tweet, &["text"]),
            rating: None,
            created_at: parse_timestamp(json_str(tweet, &["created_at"]), fetched_at),
            author_email: None,
            workspace_id: None,
            customer_profile_id: None,
            source_metadata: metadata([
                ("tweet_id", json!(external_id)),
                ("author_id", json!(author_id)),
                (
                    "username",
                    if username.is_empty() {
                        JsonValue::Null
                    } else {
                        json!(username)
                    },
                ),
            ]),
        });
    }
    Ok(batch)
}
