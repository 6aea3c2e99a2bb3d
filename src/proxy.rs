use crate::{
    auth::session_id_from,
    error::{AppError, Result},
    manager::{ApiRequest, ApiResponse},
    AppState,
};
use anyhow::anyhow;
use axum::{
    body::Body,
    extract::State,
    response::Response,
};
use axum_extra::{
    extract::cookie::SignedCookieJar,
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use tracing::{debug, error};

/// Identity lookup against the vendor API.
///
/// A signed session cookie gets the auto-refreshing path; a bare bearer
/// token is passed through once.
pub async fn whoami(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response> {
    let request = ApiRequest::get(state.manager.config().whoami_path.clone());

    let response = if let Some(session_id) = session_id_from(&jar) {
        debug!("whoami for session {}", session_id);
        state
            .manager
            .call_with_auto_refresh(&session_id, &request)
            .await?
    } else if let Some(TypedHeader(Authorization(bearer))) = bearer {
        state
            .manager
            .call_with_token(bearer.token(), &request)
            .await?
    } else {
        return Err(AppError::BadRequest(
            "Provide a session cookie or Authorization: Bearer <access_token>".into(),
        ));
    };

    if !response.status.is_success() {
        error!("whoami upstream responded {}", response.status);
    }
    into_response(response)
}

fn into_response(api: ApiResponse) -> Result<Response> {
    let mut response_builder = Response::builder().status(api.status);

    for (key, value) in api.headers.iter() {
        if should_forward_response_header(key.as_str()) {
            response_builder = response_builder.header(key.clone(), value.clone());
        }
    }

    response_builder
        .body(Body::from(api.body))
        .map_err(|e| AppError::Internal(anyhow!("Failed to build response: {}", e)))
}

// Determine if a response header should be forwarded
fn should_forward_response_header(header: &str) -> bool {
    let header_lower = header.to_lowercase();

    let blocked_headers = [
        "connection",
        "content-encoding",
        "content-length",
        "transfer-encoding",
        "upgrade",
        "set-cookie",
    ];

    !blocked_headers.contains(&header_lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_hop_by_hop_headers() {
        assert!(should_forward_response_header("Content-Type"));
        assert!(should_forward_response_header("x-request-id"));
        assert!(!should_forward_response_header("Transfer-Encoding"));
        assert!(!should_forward_response_header("set-cookie"));
    }
}
