#![allow(dead_code)]

use chrono::{Duration, Utc};
use oauth_token_proxy::{
    config::Config,
    manager::TokenManager,
    session::{MemorySessionStore, SessionStore},
    types::OAuthSession,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// base64("test-client:test-secret")
pub const BASIC_AUTH: &str = "Basic dGVzdC1jbGllbnQ6dGVzdC1zZWNyZXQ=";

pub fn setup(mock_server: &MockServer) -> (Arc<TokenManager>, Arc<MemorySessionStore>) {
    let config = Arc::new(Config::for_testing(&mock_server.uri()));
    let store = Arc::new(MemorySessionStore::new());
    let manager = TokenManager::new(config, store.clone() as Arc<dyn SessionStore>).unwrap();
    (Arc::new(manager), store)
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": "accounts:read profiles:read"
    })
}

pub async fn seed_session(store: &MemorySessionStore, session_id: &str, access: &str, refresh: &str) {
    store
        .set(
            session_id,
            OAuthSession {
                access_token: access.to_string(),
                refresh_token: refresh.to_string(),
                // already past expiry; the API decides with a 401
                expires_at: Utc::now() - Duration::minutes(1),
                scopes: BTreeSet::from(["accounts:read".to_string()]),
            },
        )
        .await
        .unwrap();
}

/// Token endpoint accepting `code` exactly once, rejecting it afterwards.
pub async fn mount_code_grant(mock_server: &MockServer, code: &str, access: &str, refresh: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(format!("code={}", code)))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(access, refresh)))
        .up_to_n_times(1)
        .mount(mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "authorization code already used"
        })))
        .with_priority(10)
        .mount(mock_server)
        .await;
}

/// Token endpoint rotating `refresh` exactly once, rejecting every other refresh token.
pub async fn mount_refresh_grant(
    mock_server: &MockServer,
    refresh: &str,
    new_access: &str,
    new_refresh: &str,
) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains(format!("refresh_token={}", refresh)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body(new_access, new_refresh)),
        )
        .up_to_n_times(1)
        .mount(mock_server)
        .await;

    mount_refresh_rejection(mock_server).await;
}

pub async fn mount_refresh_rejection(mock_server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .with_priority(10)
        .mount(mock_server)
        .await;
}

pub fn state_from_url(url: &str) -> String {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}
