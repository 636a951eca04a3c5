//! Per-platform credentials and endpoints, read from the environment.

use vouch_core::OAuthSpec;

use crate::{facebook, google, instagram, trustpilot, twitter, yelp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwitterConfig {
    pub bearer_token: String,
    pub username: String,
    pub base_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustpilotConfig {
    pub api_key: String,
    pub business_id: String,
    pub base_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YelpConfig {
    pub api_key: String,
    pub business_id: String,
    pub base_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstagramConfig {
    pub access_token: String,
    pub user_id: String,
    pub base_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacebookConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Whose stored token the scheduled sync runs as.
    pub account_user_id: String,
    pub base_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub account_name: String,
    pub account_user_id: String,
    pub base_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidersConfig {
    pub twitter: TwitterConfig,
    pub trustpilot: TrustpilotConfig,
    pub yelp: YelpConfig,
    pub instagram: InstagramConfig,
    pub facebook: FacebookConfig,
    pub google: GoogleConfig,
}

impl Default for ProvidersConfig {
    /// No credentials, stock endpoints and schedules.
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ProvidersConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            twitter: TwitterConfig {
                bearer_token: get("TWITTER_BEARER_TOKEN", ""),
                username: get("TWITTER_USERNAME", ""),
                base_url: get("TWITTER_BASE_URL", twitter::DEFAULT_BASE_URL),
                schedule: get("TWITTER_SCHEDULE", twitter::DEFAULT_SCHEDULE),
            },
            trustpilot: TrustpilotConfig {
                api_key: get("TRUSTPILOT_API_KEY", ""),
                business_id: get("TRUSTPILOT_BUSINESS_ID", ""),
                base_url: get("TRUSTPILOT_BASE_URL", trustpilot::DEFAULT_BASE_URL),
                schedule: get("TRUSTPILOT_SCHEDULE", trustpilot::DEFAULT_SCHEDULE),
            },
            yelp: YelpConfig {
                api_key: get("YELP_API_KEY", ""),
                business_id: get("YELP_BUSINESS_ID", ""),
                base_url: get("YELP_BASE_URL", yelp::DEFAULT_BASE_URL),
                schedule: get("YELP_SCHEDULE", yelp::DEFAULT_SCHEDULE),
            },
            instagram: InstagramConfig {
                access_token: get("INSTAGRAM_ACCESS_TOKEN", ""),
                user_id: get("INSTAGRAM_USER_ID", ""),
                base_url: get("INSTAGRAM_BASE_URL", instagram::DEFAULT_BASE_URL),
                schedule: get("INSTAGRAM_SCHEDULE", instagram::DEFAULT_SCHEDULE),
            },
            facebook: FacebookConfig {
                client_id: get("FACEBOOK_CLIENT_ID", ""),
                client_secret: get("FACEBOOK_CLIENT_SECRET", ""),
                account_user_id: get("FACEBOOK_ACCOUNT_USER_ID", ""),
                base_url: get("FACEBOOK_BASE_URL", facebook::DEFAULT_BASE_URL),
                auth_url: get("FACEBOOK_AUTH_URL", facebook::DEFAULT_AUTH_URL),
                token_url: get("FACEBOOK_TOKEN_URL", facebook::DEFAULT_TOKEN_URL),
                schedule: get("FACEBOOK_SCHEDULE", facebook::DEFAULT_SCHEDULE),
            },
            google: GoogleConfig {
                client_id: get("GOOGLE_CLIENT_ID", ""),
                client_secret: get("GOOGLE_CLIENT_SECRET", ""),
                account_name: get("GOOGLE_ACCOUNT_NAME", ""),
                account_user_id: get("GOOGLE_ACCOUNT_USER_ID", ""),
                base_url: get("GOOGLE_BASE_URL", google::DEFAULT_BASE_URL),
                auth_url: get("GOOGLE_AUTH_URL", google::DEFAULT_AUTH_URL),
                token_url: get("GOOGLE_TOKEN_URL", google::DEFAULT_TOKEN_URL),
                schedule: get("GOOGLE_SCHEDULE", google::DEFAULT_SCHEDULE),
            },
        }
    }

    /// Authorization-code settings for every OAuth platform. `callback_base` is the public
    /// prefix of the redirect surface; each platform redirects to `{callback_base}/{platform}/callback`.
    pub fn oauth_specs(&self, callback_base: &str) -> Vec<OAuthSpec> {
        let base = callback_base.trim_end_matches('/');
        vec![
            OAuthSpec {
                platform: facebook::PLATFORM.to_string(),
                auth_url: self.facebook.auth_url.clone(),
                token_url: self.facebook.token_url.clone(),
                client_id: self.facebook.client_id.clone(),
                client_secret: self.facebook.client_secret.clone(),
                redirect_url: format!("{base}/{}/callback", facebook::PLATFORM),
                scopes: facebook::SCOPES.iter().map(|s| s.to_string()).collect(),
                extra_auth_params: Vec::new(),
            },
            OAuthSpec {
                platform: google::PLATFORM.to_string(),
                auth_url: self.google.auth_url.clone(),
                token_url: self.google.token_url.clone(),
                client_id: self.google.client_id.clone(),
                client_secret: self.google.client_secret.clone(),
                redirect_url: format!("{base}/{}/callback", google::PLATFORM),
                scopes: google::SCOPES.iter().map(|s| s.to_string()).collect(),
                // Without these Google omits the refresh token on repeat consent.
                extra_auth_params: vec![
                    ("access_type".to_string(), "offline".to_string()),
                    ("prompt".to_string(), "consent".to_string()),
                ],
            },
        ]
    }
}
