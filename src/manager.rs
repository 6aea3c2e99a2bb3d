//! Token lifecycle: authorization, code exchange, refresh rotation and
//! auto-refreshing API calls.
//!
//! Nothing here knows about axum; the HTTP handlers in `auth` and `proxy`
//! are thin adapters over [`TokenManager`].

use crate::{
    config::Config,
    error::{AppError, Result},
    pkce::{generate_code_challenge, generate_code_verifier, generate_state},
    session::{generate_session_id, RefreshLocks, SessionStore},
    types::{AuthorizationRequest, OAuthSession, PendingAuthorization, TokenRequest, TokenResponse},
};
use anyhow::{anyhow, Context};
use bytes::Bytes;
use chrono::{Duration, Utc};
use reqwest::{
    header::{self, HeaderMap},
    Method, StatusCode,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DEFAULT_EXPIRES_IN: u64 = 3600;
// One year; anything longer from the token endpoint is clamped
const MAX_EXPIRES_IN: u64 = 365 * 24 * 3600;

/// A downstream API call, relative to the configured API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the caller of [`TokenManager::refresh_session`] last saw of the session.
#[derive(Debug, Clone, Copy)]
pub enum RefreshPrecondition<'a> {
    /// Always rotate whatever is stored.
    None,
    /// The access token the caller used; if it changed, the stored session
    /// is returned as is.
    AccessToken(&'a str),
    /// The refresh token the caller presented; if it changed, the request
    /// fails with `InvalidRefreshToken`.
    RefreshToken(&'a str),
}

/// Why a token endpoint call failed, before it is mapped per grant type.
#[derive(Debug)]
enum TokenEndpointError {
    Rejected { status: StatusCode, body: String },
    Malformed(String),
    Unavailable(String),
}

impl TokenEndpointError {
    fn into_exchange_error(self) -> AppError {
        match self {
            TokenEndpointError::Rejected { status, body } => {
                AppError::TokenExchange(format!("{} ({})", oauth_error_code(&body), status))
            }
            TokenEndpointError::Malformed(msg) => AppError::TokenExchange(msg),
            TokenEndpointError::Unavailable(msg) => AppError::UpstreamUnavailable(msg),
        }
    }

    fn into_refresh_error(self) -> AppError {
        match self {
            TokenEndpointError::Rejected { status, body }
                if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED =>
            {
                AppError::InvalidRefreshToken(oauth_error_code(&body))
            }
            other => other.into_exchange_error(),
        }
    }
}

// Pull the RFC 6749 `error` field out of a token endpoint body, if there is one.
fn oauth_error_code(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "rejected".to_string())
}

fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

pub struct TokenManager {
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    http_client: reqwest::Client,
    refresh_locks: RefreshLocks,
}

impl TokenManager {
    pub fn new(config: Arc<Config>, store: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("oauth-token-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            store,
            http_client,
            refresh_locks: RefreshLocks::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Begin a login: record a pending authorization and build the consent URL.
    pub async fn start_authorization(&self) -> Result<AuthorizationRequest> {
        let state_token = generate_state();
        let code_verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&code_verifier);

        self.store
            .put_pending(PendingAuthorization {
                state_token: state_token.clone(),
                code_verifier,
                created_at: Utc::now(),
            })
            .await?;

        let scope = self.config.scope_string();
        let auth_params = [
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("state", state_token.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        let query = serde_urlencoded::to_string(auth_params)
            .context("Failed to encode authorization parameters")?;
        let url = format!("{}?{}", self.config.authorize_url, query);

        info!("Starting authorization, state={}...", token_prefix(&state_token));
        debug!(
            "Auth params: client_id={}, redirect_uri={}, scope={}",
            self.config.client_id, self.config.redirect_uri, scope
        );

        Ok(AuthorizationRequest {
            url,
            state: state_token,
        })
    }

    /// Validate the returned state and exchange the code for a new session.
    ///
    /// The pending authorization is consumed on lookup, so a state value can
    /// only ever be presented once.
    pub async fn handle_callback(
        &self,
        code: &str,
        returned_state: &str,
    ) -> Result<(String, OAuthSession)> {
        let pending = self
            .store
            .take_pending(returned_state)
            .await?
            .ok_or_else(|| {
                warn!("Callback with unknown state");
                AppError::InvalidState
            })?;

        if pending.is_expired(self.config.pending_ttl, Utc::now()) {
            warn!(
                "Callback for expired authorization started at {}",
                pending.created_at
            );
            return Err(AppError::InvalidState);
        }

        let request = TokenRequest::authorization_code(
            code,
            &self.config.redirect_uri,
            &pending.code_verifier,
        );
        let response = self
            .post_token_request(&request)
            .await
            .map_err(TokenEndpointError::into_exchange_error)?;
        let session = self
            .session_from_response(response, None)
            .map_err(TokenEndpointError::into_exchange_error)?;

        let session_id = generate_session_id();
        self.store.set(&session_id, session.clone()).await?;

        info!(
            "Created session {} (expires {}, scopes: {:?})",
            session_id, session.expires_at, session.scopes
        );
        Ok((session_id, session))
    }

    /// Exchange a refresh token for a fresh pair.
    ///
    /// This only talks to the token endpoint; callers holding a stored session
    /// should go through [`TokenManager::refresh_session`] so rotation is
    /// serialized and persisted.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthSession> {
        debug!("Refreshing with token {}...", token_prefix(refresh_token));
        let response = self
            .post_token_request(&TokenRequest::refresh(refresh_token))
            .await
            .map_err(TokenEndpointError::into_refresh_error)?;
        self.session_from_response(response, Some(refresh_token))
            .map_err(TokenEndpointError::into_refresh_error)
    }

    /// Refresh a stored session under its refresh lock.
    ///
    /// The precondition is checked after the lock is held, so a caller that
    /// queued behind another refresh never rotates with a stale token.
    pub async fn refresh_session(
        &self,
        session_id: &str,
        precondition: RefreshPrecondition<'_>,
    ) -> Result<OAuthSession> {
        let _guard = self.refresh_locks.acquire(session_id).await;

        let current = self
            .store
            .get(session_id)
            .await?
            .ok_or(AppError::Unauthorized)?;

        match precondition {
            RefreshPrecondition::None => {}
            RefreshPrecondition::AccessToken(seen) if current.access_token != seen => {
                debug!("Session {} already refreshed by another request", session_id);
                return Ok(current);
            }
            RefreshPrecondition::RefreshToken(presented) if current.refresh_token != presented => {
                warn!("Stale refresh token presented for session {}", session_id);
                return Err(AppError::InvalidRefreshToken(
                    "refresh token already rotated".into(),
                ));
            }
            _ => {}
        }

        let refreshed = match self.refresh(&current.refresh_token).await {
            Ok(session) => session,
            Err(e @ AppError::InvalidRefreshToken(_)) => {
                warn!("Refresh token for session {} rejected, revoking", session_id);
                self.store.delete(session_id).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Persist before the old refresh token is forgotten.
        let swapped = self
            .store
            .compare_and_swap(session_id, &current.refresh_token, refreshed.clone())
            .await?;
        if !swapped {
            error!("Session {} changed while its refresh lock was held", session_id);
            return Err(AppError::Internal(anyhow!(
                "session {} changed during refresh",
                session_id
            )));
        }

        info!(
            "Refreshed session {}, new expiry {}",
            session_id, refreshed.expires_at
        );
        Ok(refreshed)
    }

    /// Issue `request` with the session's bearer token, refreshing and
    /// retrying once if the API answers 401.
    pub async fn call_with_auto_refresh(
        &self,
        session_id: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or(AppError::Unauthorized)?;

        if session.is_expired(Utc::now()) {
            debug!(
                "Access token for session {} is past its expiry, expecting a 401",
                session_id
            );
        }

        let response = self.send(&session.access_token, request).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("Access token rejected for session {}, refreshing", session_id);
        let refreshed = match self
            .refresh_session(
                session_id,
                RefreshPrecondition::AccessToken(&session.access_token),
            )
            .await
        {
            Ok(session) => session,
            Err(AppError::InvalidRefreshToken(reason)) => {
                warn!("Cannot refresh session {}: {}", session_id, reason);
                return Err(AppError::AuthenticationExpired);
            }
            Err(AppError::Unauthorized) => return Err(AppError::AuthenticationExpired),
            Err(e) => return Err(e),
        };

        let retry = self.send(&refreshed.access_token, request).await?;
        if retry.status == StatusCode::UNAUTHORIZED {
            warn!("Refreshed token for session {} still rejected", session_id);
            return Err(AppError::AuthenticationExpired);
        }
        Ok(retry)
    }

    /// Issue `request` with a caller-supplied bearer token; no refresh is possible.
    pub async fn call_with_token(
        &self,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        self.send(access_token, request).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<OAuthSession>> {
        Ok(self.store.get(session_id).await?)
    }

    pub async fn revoke(&self, session_id: &str) -> Result<bool> {
        let removed = self.store.delete(session_id).await?;
        if removed {
            info!("Revoked session {}", session_id);
        }
        Ok(removed)
    }

    pub async fn purge_expired_pending(&self) -> Result<usize> {
        Ok(self
            .store
            .purge_expired_pending(self.config.pending_ttl)
            .await?)
    }

    async fn send(&self, access_token: &str, request: &ApiRequest) -> Result<ApiResponse> {
        let url = format!(
            "{}/{}",
            self.config.api_base_url,
            request.path.trim_start_matches('/')
        );
        debug!("{} {} (token {}...)", request.method, url, token_prefix(access_token));

        let mut builder = self
            .http_client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .bearer_auth(access_token);
        if let Some(revision) = &self.config.api_revision {
            builder = builder.header("revision", revision);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            error!("API request failed: {}", e);
            AppError::UpstreamUnavailable(format!("Request failed: {}", e))
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            error!("Failed to read API response body: {}", e);
            AppError::UpstreamUnavailable(format!("Failed to read response: {}", e))
        })?;

        debug!("API responded {}", status);
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn post_token_request(
        &self,
        request: &TokenRequest,
    ) -> std::result::Result<TokenResponse, TokenEndpointError> {
        debug!(
            "Requesting {} grant at {}",
            request.grant_type, self.config.token_url
        );

        let response = self
            .http_client
            .post(&self.config.token_url)
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            )
            .header(header::ACCEPT, "application/json")
            .form(request)
            .send()
            .await
            .map_err(|e| {
                error!("Token endpoint unreachable: {}", e);
                TokenEndpointError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Unavailable(e.to_string()))?;

        if status.is_server_error() {
            error!("Token endpoint returned {}: {}", status, body);
            return Err(TokenEndpointError::Unavailable(format!(
                "token endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            warn!(
                "Token endpoint rejected {} grant with {}: {}",
                request.grant_type, status, body
            );
            return Err(TokenEndpointError::Rejected { status, body });
        }

        serde_json::from_str(&body).map_err(|e| {
            error!("Malformed token response: {}", e);
            TokenEndpointError::Malformed(format!("Failed to parse token response: {}", e))
        })
    }

    fn session_from_response(
        &self,
        response: TokenResponse,
        previous_refresh_token: Option<&str>,
    ) -> std::result::Result<OAuthSession, TokenEndpointError> {
        if response.access_token.is_empty() {
            return Err(TokenEndpointError::Malformed(
                "Token response has an empty access_token".into(),
            ));
        }
        if let Some(token_type) = &response.token_type {
            if !token_type.eq_ignore_ascii_case("bearer") {
                return Err(TokenEndpointError::Malformed(format!(
                    "Unsupported token_type: {}",
                    token_type
                )));
            }
        }

        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or_else(|| {
                TokenEndpointError::Malformed("Token response has no refresh_token".into())
            })?;

        let expires_in = response.expires_in.unwrap_or_else(|| {
            debug!("Token response without expires_in, assuming {}s", DEFAULT_EXPIRES_IN);
            DEFAULT_EXPIRES_IN
        });

        let expires_in = if expires_in > MAX_EXPIRES_IN {
            warn!(
                "Token endpoint returned expires_in={}, clamping to {}s",
                expires_in, MAX_EXPIRES_IN
            );
            MAX_EXPIRES_IN
        } else {
            expires_in
        };
        let expires_at = Duration::try_seconds(expires_in as i64)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                TokenEndpointError::Malformed(format!("Unusable expires_in: {}", expires_in))
            })?;

        let scopes = match response.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => self.config.scopes.iter().cloned().collect(),
        };

        Ok(OAuthSession {
            access_token: response.access_token,
            refresh_token,
            expires_at,
            scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_oauth_error_code() {
        assert_eq!(
            oauth_error_code(r#"{"error":"invalid_grant","error_description":"x"}"#),
            "invalid_grant"
        );
        assert_eq!(oauth_error_code("<html>nope</html>"), "rejected");
    }

    #[test]
    fn refresh_rejections_are_terminal_only_for_400_and_401() {
        let rejected = |status| TokenEndpointError::Rejected {
            status,
            body: r#"{"error":"invalid_grant"}"#.into(),
        };
        assert!(matches!(
            rejected(StatusCode::BAD_REQUEST).into_refresh_error(),
            AppError::InvalidRefreshToken(code) if code == "invalid_grant"
        ));
        assert!(matches!(
            rejected(StatusCode::UNAUTHORIZED).into_refresh_error(),
            AppError::InvalidRefreshToken(_)
        ));
        assert!(matches!(
            rejected(StatusCode::FORBIDDEN).into_refresh_error(),
            AppError::TokenExchange(_)
        ));
        assert!(matches!(
            TokenEndpointError::Unavailable("down".into()).into_refresh_error(),
            AppError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn token_prefix_handles_short_tokens() {
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix("0123456789"), "01234567");
    }
}
