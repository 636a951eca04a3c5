//! Axum surface for vouch: OAuth redirect flow, disconnect, force-sync, provider status.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vouch_core::{ErrorKind, IngestError};
use vouch_sync::{OAuthTokenManager, Orchestrator};

pub const CRATE_NAME: &str = "vouch-web";

#[derive(Clone)]
pub struct AppState {
    pub oauth: Arc<OAuthTokenManager>,
    pub orchestrator: Arc<Orchestrator>,
    /// Cancels forced syncs still running when the server stops.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(oauth: Arc<OAuthTokenManager>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            oauth,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    #[serde(rename = "userID", alias = "user_id")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Connection status returned to the browser after consent. Carries no token material.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallbackResponse {
    success: bool,
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    message: &'a str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/oauth/{platform}/authorize", get(authorize_handler))
        .route("/oauth/{platform}/callback", get(callback_handler))
        .route("/oauth/{platform}/connection", delete(disconnect_handler))
        .route("/sync/{provider}", post(sync_handler))
        .route("/providers", get(providers_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(platform): AxumPath<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.trim().is_empty()) else {
        return bad_request("userID is required");
    };
    match state.oauth.get_auth_url(&platform, &user_id).await {
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn callback_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(platform): AxumPath<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let message = query.error_description.unwrap_or(error);
        warn!(platform = %platform, reason = %message, "authorization declined at provider");
        return callback_failure(StatusCode::BAD_REQUEST, &platform, message);
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return callback_failure(
            StatusCode::BAD_REQUEST,
            &platform,
            "code and state are required".to_string(),
        );
    };

    match state.oauth.handle_callback(&platform, &code, &oauth_state).await {
        Ok(connection) => Json(CallbackResponse {
            success: true,
            provider: connection.platform,
            expires_at: connection.expires_at,
            message: "connected".to_string(),
        })
        .into_response(),
        Err(err) => callback_failure(status_for(err.kind()), &platform, err.message().to_string()),
    }
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(platform): AxumPath<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.trim().is_empty()) else {
        return bad_request("userID is required");
    };
    match state.oauth.remove_token(&user_id, &platform).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(provider): AxumPath<String>,
) -> Response {
    match state.orchestrator.sync(&provider, &state.shutdown).await {
        Ok(run) => Json(run).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn providers_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.providers()).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let providers = state.orchestrator.health();
    let status = if providers.values().any(|h| h.degraded) {
        "degraded"
    } else {
        "ok"
    };
    Json(serde_json::json!({ "status": status, "providers": providers })).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ProviderNotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::SyncInFlight => StatusCode::CONFLICT,
        ErrorKind::StateInvalid => StatusCode::BAD_REQUEST,
        ErrorKind::FetchFailed | ErrorKind::TokenRefreshFailed | ErrorKind::TokenNotFound => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Configuration => StatusCode::NOT_FOUND,
        ErrorKind::PersistFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &IngestError) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.kind(),
            message: err.message(),
        }),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: ErrorKind::Configuration,
            message,
        }),
    )
        .into_response()
}

fn callback_failure(status: StatusCode, platform: &str, message: String) -> Response {
    (
        status,
        Json(CallbackResponse {
            success: false,
            provider: platform.to_string(),
            expires_at: None,
            message,
        }),
    )
        .into_response()
}
