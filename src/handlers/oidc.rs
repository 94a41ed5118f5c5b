//! OIDC surface: UserInfo and discovery.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::config::AppState;
use crate::dto::{OpenIdConfiguration, UserInfoResponse};
use crate::error::OAuthErrorBody;
use crate::storage::Store;
use crate::utils::secret::hash_token;

fn unauthorized(description: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(OAuthErrorBody::new("invalid_token", Some(description))),
    )
        .into_response();
    if let Ok(value) = "Bearer error=\"invalid_token\"".parse() {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// GET /oauth/userinfo
///
/// Requires a live access token carrying the `openid` scope. Claims are
/// filtered by the granted scopes: `sub` always, `preferred_username`
/// under `profile`.
pub async fn userinfo_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let token = match bearer_token(&headers) {
        Some(token) => token,
        None => return unauthorized("bearer token required"),
    };

    // Signature and expiry first, then the server-side record: a verified
    // JWT may still have been revoked.
    let claims = match state.signer.verify_access(token) {
        Ok(claims) => claims,
        Err(_) => return unauthorized("invalid or expired token"),
    };
    let record = match state
        .store
        .find_access_token_by_hash(&hash_token(token))
        .await
    {
        Ok(Some(record)) if record.is_active_at(state.clock.now()) => record,
        Ok(_) => return unauthorized("token is no longer active"),
        Err(err) => {
            tracing::error!(error = %err, "storage failure during userinfo");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(OAuthErrorBody::new("temporarily_unavailable", Some("Please retry"))),
            )
                .into_response();
        }
    };

    if !claims.has_scope("openid") {
        let mut response = (
            StatusCode::FORBIDDEN,
            Json(OAuthErrorBody::new(
                "insufficient_scope",
                Some("the openid scope is required"),
            )),
        )
            .into_response();
        if let Ok(value) = "Bearer error=\"insufficient_scope\"".parse() {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        return response;
    }

    let user_id = match record.user_id {
        Some(user_id) => user_id,
        None => return unauthorized("token carries no user subject"),
    };

    let preferred_username = if claims.has_scope("profile") {
        match state.store.find_user(user_id).await {
            Ok(user) => user.map(|u| u.username),
            Err(_) => None,
        }
    } else {
        None
    };

    Json(UserInfoResponse {
        sub: user_id.to_string(),
        preferred_username,
    })
    .into_response()
}

/// GET /.well-known/openid-configuration
pub async fn openid_configuration_handler(
    State(state): State<AppState>,
) -> Json<OpenIdConfiguration> {
    Json(OpenIdConfiguration::new(
        &state.config.jwt_issuer,
        &state.config.jwt_algorithm,
    ))
}
