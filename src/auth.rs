use crate::{
    error::{AppError, Result},
    manager::RefreshPrecondition,
    types::{OAuthCallback, RefreshBody, TokenPairResponse},
    AppState,
};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use serde_json::json;
use tracing::{debug, error, info};

pub const SESSION_COOKIE_NAME: &str = "oauth_session";

pub fn session_id_from(jar: &SignedCookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
}

fn session_cookie(session_id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE_NAME, session_id))
        .http_only(true)
        .secure(false) // Set to true in production with HTTPS
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

// Initiate OAuth login flow
pub async fn start(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let request = state.manager.start_authorization().await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, request.url)]))
}

// Handle OAuth callback
pub async fn callback(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(params): Query<OAuthCallback>,
) -> Result<impl IntoResponse> {
    if let Some(error) = params.error {
        error!("OAuth error: {} - {:?}", error, params.error_description);
        return Err(AppError::AuthorizationDenied(match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        }));
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing authorization code".into()))?;
    let returned_state = params
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing state parameter".into()))?;

    let (session_id, session) = state
        .manager
        .handle_callback(&code, &returned_state)
        .await?;

    let jar = jar.add(session_cookie(session_id.clone()));
    Ok((
        jar,
        Json(TokenPairResponse::from_session(Some(session_id), &session)),
    ))
}

// Rotate tokens. With a live session cookie the stored session is rotated under
// its lock, and a body token that is no longer current is refused.
pub async fn refresh(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    body: Option<Json<RefreshBody>>,
) -> Result<Json<TokenPairResponse>> {
    let body_token = body
        .and_then(|Json(body)| body.refresh_token)
        .filter(|t| !t.is_empty());

    if let Some(session_id) = session_id_from(&jar) {
        if state.manager.session(&session_id).await?.is_some() {
            let precondition = match body_token.as_deref() {
                Some(token) => RefreshPrecondition::RefreshToken(token),
                None => RefreshPrecondition::None,
            };
            let session = state
                .manager
                .refresh_session(&session_id, precondition)
                .await?;
            return Ok(Json(TokenPairResponse::from_session(
                Some(session_id),
                &session,
            )));
        }
        debug!("Session cookie for unknown session {}", session_id);
    }

    let refresh_token =
        body_token.ok_or_else(|| AppError::BadRequest("Missing refresh_token".into()))?;
    let session = state.manager.refresh(&refresh_token).await?;
    info!("Refreshed detached token pair");
    Ok(Json(TokenPairResponse::from_session(None, &session)))
}

// Logout endpoint
pub async fn logout(
    State(state): State<AppState>,
    jar: SignedCookieJar,
) -> Result<impl IntoResponse> {
    if let Some(session_id) = session_id_from(&jar) {
        state.manager.revoke(&session_id).await?;
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE_NAME).path("/"));
    Ok((jar, Json(json!({ "message": "Successfully logged out" }))))
}

// Check authentication status
pub async fn status(
    State(state): State<AppState>,
    jar: SignedCookieJar,
) -> Result<impl IntoResponse> {
    let session = match session_id_from(&jar) {
        Some(session_id) => state.manager.session(&session_id).await?,
        None => None,
    };

    Ok(Json(match session {
        Some(session) => json!({
            "authenticated": true,
            "expires_at": session.expires_at,
            "scopes": session.scopes,
        }),
        None => json!({ "authenticated": false }),
    }))
}
