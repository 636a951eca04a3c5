//! OAuth authorization-code lifecycle: state issuance, code exchange, transparent refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vouch_core::{
    AccessTokenSource, Clock, ErrorKind, IngestError, OAuthSpec, OAuthState, OAuthToken,
};
use vouch_storage::OAuthStore;

/// How long an issued state stays redeemable.
pub const STATE_TTL: Duration = Duration::from_secs(15 * 60);

/// Bound on one refresh round trip; a crashed holder's lease lapses after this.
const REFRESH_LEASE_TTL: Duration = Duration::from_secs(30);
const REFRESH_LEASE_POLL: Duration = Duration::from_millis(100);

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_state() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Talks to a platform's token endpoint.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_code(&self, spec: &OAuthSpec, code: &str) -> Result<OAuthToken, IngestError>;

    async fn refresh(&self, spec: &OAuthSpec, refresh_token: &str)
        -> Result<OAuthToken, IngestError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: TokenErrorField,
    #[serde(default)]
    error_description: Option<String>,
}

/// Most providers send a string; Graph API nests an object with a `message`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenErrorField {
    Code(String),
    Object { message: String },
}

impl TokenErrorResponse {
    fn describe(self) -> String {
        match (self.error, self.error_description) {
            (_, Some(description)) => description,
            (TokenErrorField::Code(code), None) => code,
            (TokenErrorField::Object { message }, None) => message,
        }
    }
}

/// Form-encoded token endpoint client (RFC 6749 section 4.1.3 and 6).
pub struct HttpTokenExchanger {
    client: Client,
    clock: Arc<dyn Clock>,
}

impl HttpTokenExchanger {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            IngestError::new(ErrorKind::Configuration, "building token http client").with_source(e)
        })?;
        Ok(Self { client, clock })
    }

    async fn post_form(
        &self,
        spec: &OAuthSpec,
        form: &[(&str, &str)],
        what: &str,
    ) -> Result<OAuthToken, IngestError> {
        let response = self
            .client
            .post(&spec.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                IngestError::new(ErrorKind::FetchFailed, format!("{} {what} request failed", spec.platform))
                    .with_source(e)
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = serde_json::from_str::<TokenErrorResponse>(&text)
                .map(TokenErrorResponse::describe)
                .unwrap_or_else(|_| format!("status {status}"));
            return Err(IngestError::new(
                ErrorKind::FetchFailed,
                format!("{} {what} rejected: {detail}", spec.platform),
            )
            .with_status(status.as_u16()));
        }

        let parsed: TokenResponse = serde_json::from_str(&text).map_err(|e| {
            IngestError::new(
                ErrorKind::FetchFailed,
                format!("{} {what} returned an unreadable token", spec.platform),
            )
            .with_source(e)
        })?;

        let scopes = parsed
            .scope
            .map(|s| {
                s.split(|c: char| c == ' ' || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| spec.scopes.clone());

        Ok(OAuthToken {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
            expires_at: parsed
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| self.clock.now() + chrono::Duration::seconds(secs)),
            scopes,
        })
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange_code(&self, spec: &OAuthSpec, code: &str) -> Result<OAuthToken, IngestError> {
        self.post_form(
            spec,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", spec.redirect_url.as_str()),
                ("client_id", spec.client_id.as_str()),
                ("client_secret", spec.client_secret.as_str()),
            ],
            "code exchange",
        )
        .await
    }

    async fn refresh(
        &self,
        spec: &OAuthSpec,
        refresh_token: &str,
    ) -> Result<OAuthToken, IngestError> {
        self.post_form(
            spec,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", spec.client_id.as_str()),
                ("client_secret", spec.client_secret.as_str()),
            ],
            "token refresh",
        )
        .await
    }
}

/// What the callback surface reports back. Never carries token material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OAuthConnection {
    pub platform: String,
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

pub struct OAuthTokenManager {
    specs: HashMap<String, OAuthSpec>,
    store: Arc<dyn OAuthStore>,
    exchanger: Arc<dyn TokenExchanger>,
    clock: Arc<dyn Clock>,
    refresh_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl OAuthTokenManager {
    pub fn new(
        specs: Vec<OAuthSpec>,
        store: Arc<dyn OAuthStore>,
        exchanger: Arc<dyn TokenExchanger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.platform.clone(), spec))
                .collect(),
            store,
            exchanger,
            clock,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn spec(&self, platform: &str) -> Result<&OAuthSpec, IngestError> {
        self.specs.get(platform).ok_or_else(|| {
            IngestError::new(
                ErrorKind::Configuration,
                format!("{platform} is not an OAuth platform"),
            )
        })
    }

    /// Issues a fresh state for `(platform, user_id)` and returns the consent URL carrying it.
    pub async fn get_auth_url(&self, platform: &str, user_id: &str) -> Result<String, IngestError> {
        let spec = self.spec(platform)?;
        let state = generate_state();
        let record = OAuthState {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            issued_at: self.clock.now(),
        };
        self.store
            .put_state(&state, &record, STATE_TTL)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "storing oauth state"))?;

        let scope = spec.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", spec.client_id.as_str()),
            ("redirect_uri", spec.redirect_url.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state.as_str()),
        ];
        params.extend(
            spec.extra_auth_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let url = reqwest::Url::parse_with_params(&spec.auth_url, &params).map_err(|e| {
            IngestError::new(
                ErrorKind::Configuration,
                format!("{platform} auth url {} is invalid", spec.auth_url),
            )
            .with_source(e)
        })?;
        info!(platform, user_id, "issued oauth state");
        Ok(url.into())
    }

    /// Redeems `state` exactly once, then exchanges `code`. The state is consumed before the
    /// exchange, so a failed exchange still burns it.
    pub async fn handle_callback(
        &self,
        platform: &str,
        code: &str,
        state: &str,
    ) -> Result<OAuthConnection, IngestError> {
        let spec = self.spec(platform)?;
        let issued = self
            .store
            .take_state(state, self.clock.now())
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "redeeming oauth state"))?
            .ok_or_else(|| {
                IngestError::new(ErrorKind::StateInvalid, "oauth state is unknown, expired or already used")
            })?;
        if issued.platform != platform {
            return Err(IngestError::new(
                ErrorKind::StateInvalid,
                format!("oauth state was issued for {}, not {platform}", issued.platform),
            ));
        }

        let token = self.exchanger.exchange_code(spec, code).await?;
        self.store
            .save_token(&issued.user_id, platform, &token)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "saving oauth token"))?;

        info!(platform, user_id = %issued.user_id, "oauth connection established");
        Ok(OAuthConnection {
            platform: platform.to_string(),
            user_id: issued.user_id,
            expires_at: token.expires_at,
            scopes: token.scopes,
        })
    }

    /// Returns a usable token, refreshing it once if it has expired. A failed refresh leaves
    /// the stored token untouched.
    pub async fn get_token(&self, user_id: &str, platform: &str) -> Result<OAuthToken, IngestError> {
        let token = self.load(user_id, platform).await?;
        if !token.is_expired(self.clock.now()) {
            return Ok(token);
        }

        let key = (user_id.to_string(), platform.to_string());
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let result = {
            let _held = lock.lock().await;
            self.refresh_under_lease(user_id, platform).await
        };

        let mut locks = self.refresh_locks.lock().await;
        // The map's entry plus this handle: nobody else is queued on it.
        if Arc::strong_count(&lock) == 2 && locks.get(&key).is_some_and(|l| Arc::ptr_eq(l, &lock)) {
            locks.remove(&key);
        }
        result
    }

    /// Local callers queue on the per-key mutex; instances sharing the store queue on the
    /// store's refresh lease. Whoever holds the lease reloads, refreshes and saves.
    async fn refresh_under_lease(
        &self,
        user_id: &str,
        platform: &str,
    ) -> Result<OAuthToken, IngestError> {
        let holder = generate_state();
        let give_up = tokio::time::Instant::now() + REFRESH_LEASE_TTL * 2;
        loop {
            // Another caller may have refreshed while this one waited.
            let token = self.load(user_id, platform).await?;
            let now = self.clock.now();
            if !token.is_expired(now) {
                return Ok(token);
            }

            let acquired = self
                .store
                .try_acquire_refresh_lease(user_id, platform, &holder, now, REFRESH_LEASE_TTL)
                .await
                .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "claiming oauth refresh lease"))?;
            if acquired {
                let result = match self.load(user_id, platform).await {
                    Ok(token) if !token.is_expired(self.clock.now()) => Ok(token),
                    Ok(token) => self.refresh(user_id, platform, token).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = self
                    .store
                    .release_refresh_lease(user_id, platform, &holder)
                    .await
                {
                    warn!(platform, user_id, error = %err, "releasing oauth refresh lease failed");
                }
                return result;
            }

            if tokio::time::Instant::now() >= give_up {
                return Err(IngestError::new(
                    ErrorKind::TokenRefreshFailed,
                    format!("{platform} token refresh is held elsewhere and did not finish"),
                ));
            }
            debug!(platform, user_id, "oauth refresh in progress elsewhere; waiting");
            tokio::time::sleep(REFRESH_LEASE_POLL).await;
        }
    }

    async fn load(&self, user_id: &str, platform: &str) -> Result<OAuthToken, IngestError> {
        self.store
            .load_token(user_id, platform)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "loading oauth token"))?
            .ok_or_else(|| {
                IngestError::new(
                    ErrorKind::TokenNotFound,
                    format!("no {platform} connection for user {user_id}"),
                )
            })
    }

    async fn refresh(
        &self,
        user_id: &str,
        platform: &str,
        stale: OAuthToken,
    ) -> Result<OAuthToken, IngestError> {
        let spec = self.spec(platform)?;
        let Some(refresh_token) = stale.refresh_token.clone() else {
            return Err(IngestError::new(
                ErrorKind::TokenRefreshFailed,
                format!("{platform} token expired and has no refresh token"),
            ));
        };

        let refreshed = match self.exchanger.refresh(spec, &refresh_token).await {
            Ok(token) => token,
            Err(err) => {
                warn!(platform, user_id, error = %err, "oauth refresh failed; keeping stale token");
                let mut mapped = IngestError::new(
                    ErrorKind::TokenRefreshFailed,
                    format!("{platform} token refresh failed"),
                );
                if let Some(status) = err.http_status() {
                    mapped = mapped.with_status(status);
                }
                return Err(mapped.with_source(err));
            }
        };

        // Providers may omit the refresh token or scopes on refresh; keep the previous ones.
        let token = OAuthToken {
            refresh_token: refreshed.refresh_token.or(stale.refresh_token),
            scopes: if refreshed.scopes.is_empty() {
                stale.scopes
            } else {
                refreshed.scopes
            },
            ..refreshed
        };
        self.store
            .save_token(user_id, platform, &token)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "saving refreshed oauth token"))?;
        info!(platform, user_id, "oauth token refreshed");
        Ok(token)
    }

    /// Disconnects `(user_id, platform)`. Returns whether a token was present.
    pub async fn remove_token(&self, user_id: &str, platform: &str) -> Result<bool, IngestError> {
        let removed = self
            .store
            .delete_token(user_id, platform)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "deleting oauth token"))?;
        self.refresh_locks
            .lock()
            .await
            .remove(&(user_id.to_string(), platform.to_string()));
        Ok(removed)
    }

    /// Clears states that were never redeemed.
    pub async fn purge_expired_states(&self) -> Result<u64, IngestError> {
        self.store
            .purge_expired_states(self.clock.now())
            .await
            .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "purging oauth states"))
    }
}

#[async_trait]
impl AccessTokenSource for OAuthTokenManager {
    async fn access_token(&self, user_id: &str, platform: &str) -> Result<String, IngestError> {
        self.get_token(user_id, platform)
            .await
            .map(|token| token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::Form, http::StatusCode, routing::post, Json, Router};
    use chrono::TimeZone;
    use vouch_core::ManualClock;
    use vouch_storage::MemoryOAuthStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("ts")
    }

    fn spec(token_url: &str) -> OAuthSpec {
        OAuthSpec {
            platform: "google".into(),
            auth_url: "https://accounts.example/o/oauth2/auth".into(),
            token_url: token_url.into(),
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            redirect_url: "https://vouch.example/oauth/google/callback".into(),
            scopes: vec!["business.manage".into()],
            extra_auth_params: vec![("access_type".into(), "offline".into())],
        }
    }

    #[derive(Default)]
    struct FakeExchanger {
        exchanges: AtomicUsize,
        refreshes: AtomicUsize,
        fail_refresh: bool,
        exchange_delay: Option<Duration>,
        refresh_delay: Option<Duration>,
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        async fn exchange_code(&self, _spec: &OAuthSpec, code: &str) -> Result<OAuthToken, IngestError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.exchange_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(OAuthToken {
                access_token: format!("access-for-{code}"),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(t0() + chrono::Duration::hours(1)),
                scopes: vec!["business.manage".into()],
            })
        }

        async fn refresh(
            &self,
            _spec: &OAuthSpec,
            refresh_token: &str,
        ) -> Result<OAuthToken, IngestError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.refresh_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_refresh {
                return Err(IngestError::new(ErrorKind::FetchFailed, "invalid_grant").with_status(400));
            }
            Ok(OAuthToken {
                access_token: if n == 0 {
                    format!("refreshed-with-{refresh_token}")
                } else {
                    format!("refreshed-with-{refresh_token}-{n}")
                },
                refresh_token: None,
                expires_at: Some(t0() + chrono::Duration::hours(3)),
                scopes: vec![],
            })
        }
    }

    fn manager(
        exchanger: Arc<FakeExchanger>,
    ) -> (Arc<OAuthTokenManager>, Arc<MemoryOAuthStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryOAuthStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let manager = OAuthTokenManager::new(
            vec![spec("https://tokens.example/token")],
            store.clone(),
            exchanger,
            clock.clone(),
        );
        (Arc::new(manager), store, clock)
    }

    fn state_from(url: &str) -> String {
        let parsed = reqwest::Url::parse(url).expect("url");
        parsed
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state param")
    }

    #[test]
    fn states_are_long_and_distinct() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn auth_url_embeds_state_and_client_params() {
        let (manager, store, _) = manager(Arc::new(FakeExchanger::default()));
        let url = manager.get_auth_url("google", "u-1").await.expect("url");
        let parsed = reqwest::Url::parse(&url).expect("parse");
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://vouch.example/oauth/google/callback");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(store.pending_states().await, 1);

        let err = manager.get_auth_url("myspace", "u-1").await.expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn callback_redeems_state_once() {
        let exchanger = Arc::new(FakeExchanger::default());
        let (manager, store, _) = manager(exchanger.clone());
        let state = state_from(&manager.get_auth_url("google", "u-1").await.expect("url"));

        let connection = manager
            .handle_callback("google", "code-1", &state)
            .await
            .expect("first callback");
        assert_eq!(connection.user_id, "u-1");
        let stored = store.load_token("u-1", "google").await.expect("load").expect("token");
        assert_eq!(stored.access_token, "access-for-code-1");

        let err = manager
            .handle_callback("google", "code-1", &state)
            .await
            .expect_err("replay");
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callbacks_with_one_state_redeem_once() {
        let exchanger = Arc::new(FakeExchanger {
            exchange_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let (manager, _, _) = manager(exchanger.clone());
        let state = state_from(&manager.get_auth_url("google", "u-1").await.expect("url"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                manager.handle_callback("google", "code", &state).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => ok += 1,
                Err(err) => assert_eq!(err.kind(), ErrorKind::StateInvalid),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_presented_after_ttl_is_invalid() {
        let exchanger = Arc::new(FakeExchanger::default());
        let (manager, _, clock) = manager(exchanger.clone());
        let state = state_from(&manager.get_auth_url("google", "u-1").await.expect("url"));

        clock.advance(Duration::from_secs(16 * 60));
        let err = manager
            .handle_callback("google", "code", &state)
            .await
            .expect_err("expired");
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_for_another_platform_is_rejected_and_burned() {
        let store = Arc::new(MemoryOAuthStore::new());
        let mut facebook = spec("https://tokens.example/token");
        facebook.platform = "facebook".into();
        let manager = OAuthTokenManager::new(
            vec![spec("https://tokens.example/token"), facebook],
            store.clone(),
            Arc::new(FakeExchanger::default()),
            Arc::new(ManualClock::new(t0())),
        );
        let state = state_from(&manager.get_auth_url("google", "u-1").await.expect("url"));

        let err = manager
            .handle_callback("facebook", "code", &state)
            .await
            .expect_err("wrong platform");
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        let err = manager
            .handle_callback("google", "code", &state)
            .await
            .expect_err("already consumed");
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_exactly_once() {
        let exchanger = Arc::new(FakeExchanger::default());
        let (manager, store, clock) = manager(exchanger.clone());
        let old = OAuthToken {
            access_token: "old".into(),
            refresh_token: Some("r-7".into()),
            expires_at: Some(t0() + chrono::Duration::minutes(5)),
            scopes: vec!["business.manage".into()],
        };
        store.save_token("u-1", "google", &old).await.expect("seed");

        assert_eq!(manager.get_token("u-1", "google").await.expect("fresh").access_token, "old");
        assert_eq!(exchanger.refreshes.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(10 * 60));
        let token = manager.get_token("u-1", "google").await.expect("refreshed");
        assert_eq!(token.access_token, "refreshed-with-r-7");
        // Refresh response had no refresh token or scopes; previous values are kept.
        assert_eq!(token.refresh_token.as_deref(), Some("r-7"));
        assert_eq!(token.scopes, vec!["business.manage".to_string()]);
        assert_eq!(exchanger.refreshes.load(Ordering::SeqCst), 1);

        let persisted = store.load_token("u-1", "google").await.expect("load").expect("token");
        assert_eq!(persisted, token);
        assert!(manager.refresh_locks.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn managers_sharing_a_store_refresh_once() {
        let exchanger = Arc::new(FakeExchanger {
            refresh_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let store = Arc::new(MemoryOAuthStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let instance = || {
            OAuthTokenManager::new(
                vec![spec("https://tokens.example/token")],
                store.clone(),
                exchanger.clone(),
                clock.clone(),
            )
        };
        let (a, b) = (instance(), instance());
        let stale = OAuthToken {
            access_token: "stale".into(),
            refresh_token: Some("r-1".into()),
            expires_at: Some(t0() - chrono::Duration::minutes(1)),
            scopes: vec![],
        };
        store.save_token("u-1", "google", &stale).await.expect("seed");

        let (first, second) = tokio::join!(a.get_token("u-1", "google"), b.get_token("u-1", "google"));
        let first = first.expect("first instance");
        let second = second.expect("second instance");
        assert_eq!(exchanger.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(first.access_token, "refreshed-with-r-1");
        assert_eq!(first, second);
        assert_eq!(
            store.load_token("u-1", "google").await.expect("load"),
            Some(first)
        );
        assert!(a.refresh_locks.lock().await.is_empty());
        assert!(b.refresh_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_token_visible() {
        let exchanger = Arc::new(FakeExchanger {
            fail_refresh: true,
            ..Default::default()
        });
        let (manager, store, _) = manager(exchanger.clone());
        let stale = OAuthToken {
            access_token: "stale".into(),
            refresh_token: Some("revoked".into()),
            expires_at: Some(t0() - chrono::Duration::minutes(1)),
            scopes: vec![],
        };
        store.save_token("u-1", "google", &stale).await.expect("seed");

        let err = manager.get_token("u-1", "google").await.expect_err("refresh fails");
        assert_eq!(err.kind(), ErrorKind::TokenRefreshFailed);
        assert_eq!(exchanger.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.load_token("u-1", "google").await.expect("load"),
            Some(stale)
        );
    }

    #[tokio::test]
    async fn missing_token_and_idempotent_removal() {
        let (manager, store, _) = manager(Arc::new(FakeExchanger::default()));
        let err = manager.access_token("u-1", "google").await.expect_err("none");
        assert_eq!(err.kind(), ErrorKind::TokenNotFound);

        let token = OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        };
        store.save_token("u-1", "google", &token).await.expect("seed");
        assert!(manager.remove_token("u-1", "google").await.expect("remove"));
        assert!(!manager.remove_token("u-1", "google").await.expect("remove again"));
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_exchanger_posts_form_and_reads_expiry() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                if form.get("grant_type").map(String::as_str) == Some("authorization_code")
                    && form.get("code").map(String::as_str) == Some("abc")
                    && form.get("client_secret").map(String::as_str) == Some("csecret")
                {
                    Ok(Json(serde_json::json!({
                        "access_token": "at-1",
                        "refresh_token": "rt-1",
                        "expires_in": 3600,
                        "token_type": "Bearer",
                        "scope": "business.manage"
                    })))
                } else {
                    Err((
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({"error": "invalid_grant", "error_description": "bad code"})),
                    ))
                }
            }),
        );
        let base = spawn(app).await;
        let clock = Arc::new(ManualClock::new(t0()));
        let exchanger = HttpTokenExchanger::new(Duration::from_secs(5), clock).expect("client");
        let spec = spec(&format!("{base}/token"));

        let token = exchanger.exchange_code(&spec, "abc").await.expect("exchange");
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(token.expires_at, Some(t0() + chrono::Duration::hours(1)));

        let err = exchanger.exchange_code(&spec, "nope").await.expect_err("rejected");
        assert_eq!(err.http_status(), Some(400));
        assert!(err.message().contains("bad code"));
    }
}
