//! Token endpoint orchestrator, plus introspection and revocation.
//!
//! Accepts form-urlencoded bodies only. Client authentication happens
//! before any grant is dispatched; engine errors are mapped to the stable
//! OAuth codes by the `From` conversions in `error`.

use axum::{
    extract::{rejection::FormRejection, Form, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

use crate::config::AppState;
use crate::dto::{
    validate_scope_tokens, IntrospectRequest, IntrospectionResponse, RevokeRequest, TokenRequest,
    TokenResponse,
};
use crate::error::OAuthError;
use crate::models::{GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS, GRANT_REFRESH_TOKEN};
use crate::services::ClientCredentials;

/// Decode an HTTP Basic Authorization header into a client id/secret pair
/// (both URL-decoded, RFC 6749 §2.3.1).
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((
        urlencoding::decode(id).ok()?.into_owned(),
        urlencoding::decode(secret).ok()?.into_owned(),
    ))
}

/// Assemble client credentials from the request; the Basic header takes
/// precedence over form fields.
fn extract_client_credentials(
    headers: &HeaderMap,
    client_id: Option<String>,
    client_secret: Option<String>,
    client_assertion_type: Option<String>,
    client_assertion: Option<String>,
) -> ClientCredentials {
    if let Some((id, secret)) = basic_credentials(headers) {
        return ClientCredentials {
            client_id: Some(id),
            client_secret: Some(secret),
            client_assertion_type: None,
            client_assertion: None,
        };
    }
    ClientCredentials {
        client_id,
        client_secret,
        client_assertion_type,
        client_assertion,
    }
}

/// Token responses, success or failure, must never be cached.
fn no_store(response: Response) -> Response {
    let mut response = response;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    response
}

/// POST /oauth/token
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = body.map_err(|_| {
        OAuthError::InvalidRequest(
            "expected an application/x-www-form-urlencoded body".to_string(),
        )
    })?;

    let grant_type = req
        .grant_type
        .as_deref()
        .ok_or_else(|| OAuthError::InvalidRequest("grant_type is required".to_string()))?;
    if !matches!(
        grant_type,
        GRANT_AUTHORIZATION_CODE | GRANT_CLIENT_CREDENTIALS | GRANT_REFRESH_TOKEN
    ) {
        return Err(OAuthError::UnsupportedGrantType);
    }

    let credentials = extract_client_credentials(
        &headers,
        req.client_id.clone(),
        req.client_secret.clone(),
        req.client_assertion_type.clone(),
        req.client_assertion.clone(),
    );
    let client = state.client_registry().authenticate(&credentials).await?;

    if !client.allows_grant_type(grant_type) {
        return Err(OAuthError::UnauthorizedClient);
    }

    let grant = match grant_type {
        GRANT_AUTHORIZATION_CODE => {
            let code = req
                .code
                .as_deref()
                .ok_or_else(|| OAuthError::InvalidRequest("code is required".to_string()))?;
            let redirect_uri = req.redirect_uri.as_deref().ok_or_else(|| {
                OAuthError::InvalidRequest("redirect_uri is required".to_string())
            })?;

            let consumed = state
                .code_engine()
                .consume(code, client.id, redirect_uri, req.code_verifier.as_deref())
                .await?;
            state.token_engine().issue_from_code(&consumed, &client).await?
        }
        GRANT_CLIENT_CREDENTIALS => {
            // A public client has nothing to authenticate with here.
            if client.is_public() {
                return Err(OAuthError::UnauthorizedClient);
            }
            let scopes = req.scopes();
            if !scopes.is_empty() && !validate_scope_tokens(&scopes) {
                return Err(OAuthError::InvalidScope(
                    "malformed scope parameter".to_string(),
                ));
            }
            state
                .token_engine()
                .issue_client_credentials(&client, &scopes)
                .await?
        }
        GRANT_REFRESH_TOKEN => {
            let refresh_token = req.refresh_token.as_deref().ok_or_else(|| {
                OAuthError::InvalidRequest("refresh_token is required".to_string())
            })?;
            let scopes = req.scopes();
            if !scopes.is_empty() && !validate_scope_tokens(&scopes) {
                return Err(OAuthError::InvalidScope(
                    "malformed scope parameter".to_string(),
                ));
            }
            let requested = if scopes.is_empty() {
                None
            } else {
                Some(scopes.as_slice())
            };
            state
                .token_engine()
                .refresh(refresh_token, &client, requested)
                .await?
        }
        _ => unreachable!("grant_type validated above"),
    };

    Ok(no_store(
        Json(TokenResponse::from(grant)).into_response(),
    ))
}

/// POST /oauth/introspect
pub async fn introspect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Form<IntrospectRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = body.map_err(|_| {
        OAuthError::InvalidRequest(
            "expected an application/x-www-form-urlencoded body".to_string(),
        )
    })?;

    let credentials = extract_client_credentials(
        &headers,
        req.client_id.clone(),
        req.client_secret.clone(),
        req.client_assertion_type.clone(),
        req.client_assertion.clone(),
    );
    state.client_registry().authenticate(&credentials).await?;

    let introspection = state.token_engine().introspect(&req.token).await?;
    Ok(no_store(
        Json(IntrospectionResponse::from(introspection)).into_response(),
    ))
}

/// POST /oauth/revoke — RFC 7009: 200 even for unknown tokens.
pub async fn revoke_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Form<RevokeRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = body.map_err(|_| {
        OAuthError::InvalidRequest(
            "expected an application/x-www-form-urlencoded body".to_string(),
        )
    })?;

    let credentials = extract_client_credentials(
        &headers,
        req.client_id.clone(),
        req.client_secret.clone(),
        req.client_assertion_type.clone(),
        req.client_assertion.clone(),
    );
    let client = state.client_registry().authenticate(&credentials).await?;

    state.token_engine().revoke(&req.token, &client).await?;
    Ok(no_store(StatusCode::OK.into_response()))
}
