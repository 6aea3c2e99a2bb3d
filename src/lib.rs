pub mod auth;
pub mod config;
pub mod error;
pub mod manager;
pub mod pkce;
pub mod proxy;
pub mod session;
pub mod types;

use axum::{
    extract::FromRef,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::Key;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha512};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::manager::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TokenManager>,
    pub cookie_key: Key,
}

impl AppState {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        // Stretch the configured secret to the 64 bytes the signing key needs
        let digest = Sha512::digest(manager.config().session_secret.expose_secret().as_bytes());
        Self {
            cookie_key: Key::from(digest.as_slice()),
            manager,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/start", get(auth::start))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/status", get(auth::status))
        .route("/whoami", get(proxy::whoami))
        .route("/health", get(health_check))
        .route("/", get(root_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "service": "OAuth Token Proxy",
        "status": "running",
        "endpoints": {
            "login": "/auth/start",
            "callback": "/auth/callback",
            "refresh": "/auth/refresh",
            "logout": "/auth/logout",
            "status": "/auth/status",
            "whoami": "/whoami",
            "health": "/health"
        },
        "note": "Visit /auth/start to authenticate"
    }))
}
