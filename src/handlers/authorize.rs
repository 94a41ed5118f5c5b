//! Authorize endpoint orchestrator.
//!
//! Drives parameter validation, the login and consent decisions, and code
//! issuance. The error surface follows the "redirect if possible, render
//! if not" rule: anything that fails before the redirect URI itself has
//! been validated is rendered directly, never reflected into a redirect.

use axum::{
    extract::{Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};

use crate::config::AppState;
use crate::dto::{validate_scope_tokens, AuthorizeParams, ConsentCallbackRequest, JsonOrForm};
use crate::error::{ClientError, OAuthErrorBody, StoreError};
use crate::handlers::auth::session_cookie;
use crate::models::{AccessToken, Client, GRANT_AUTHORIZATION_CODE};
use crate::utils::pkce::{validate_code_challenge, PKCE_METHOD_S256};

/// Render an error page directly; used while the redirect URI is not yet
/// trustworthy.
fn render_error(status: StatusCode, code: &str, description: &str) -> Response {
    (status, Json(OAuthErrorBody::new(code, Some(description)))).into_response()
}

fn render_store_error(err: StoreError) -> Response {
    match err {
        StoreError::Unavailable(detail) => {
            tracing::error!(detail = %detail, "storage unavailable during authorize");
            render_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                "Please retry",
            )
        }
        other => {
            tracing::error!(error = %other, "storage failure during authorize");
            render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Internal server error",
            )
        }
    }
}

/// Redirect back to the validated client redirect URI with an error,
/// preserving `state` when it was supplied.
fn redirect_error(redirect_uri: &str, code: &str, description: &str, state: Option<&str>) -> Response {
    let mut url = redirect_uri.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&format!(
        "error={}&error_description={}",
        urlencoding::encode(code),
        urlencoding::encode(description)
    ));
    if let Some(state) = state {
        url.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    Redirect::temporary(&url).into_response()
}

fn redirect_with_code(redirect_uri: &str, code: &str, state: Option<&str>) -> Response {
    let mut url = redirect_uri.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&format!("code={}", urlencoding::encode(code)));
    if let Some(state) = state {
        url.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    Redirect::temporary(&url).into_response()
}

/// Resolve the caller's login session from the cookie, if it is valid.
async fn caller_session(state: &AppState, headers: &HeaderMap) -> Result<Option<AccessToken>, StoreError> {
    match session_cookie(headers) {
        Some(token) => state.authenticator.session_by_token(&token).await,
        None => Ok(None),
    }
}

/// GET /oauth/authorize
pub async fn authorize_handler(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<AuthorizeParams>,
    headers: HeaderMap,
) -> Response {
    // Step 1: parameter presence. Nothing redirects yet.
    let required = [
        (&params.response_type, "response_type"),
        (&params.client_id, "client_id"),
        (&params.redirect_uri, "redirect_uri"),
        (&params.code_challenge, "code_challenge"),
        (&params.code_challenge_method, "code_challenge_method"),
    ];
    for (value, name) in required {
        if value.as_deref().map(str::is_empty).unwrap_or(true) {
            return render_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("{} is required", name),
            );
        }
    }
    let client_id = params.client_id.as_deref().unwrap();
    let redirect_uri = params.redirect_uri.as_deref().unwrap();
    let code_challenge = params.code_challenge.as_deref().unwrap();
    let method = params.code_challenge_method.as_deref().unwrap();

    // Step 2: client and redirect URI. Still rendering: an unvalidated
    // redirect URI must never receive attacker-controlled parameters.
    let registry = state.client_registry();
    let client = match registry.find(client_id).await {
        Ok(client) => client,
        Err(ClientError::Unknown) => {
            return render_error(StatusCode::BAD_REQUEST, "unauthorized_client", "unknown client")
        }
        Err(ClientError::Store(err)) => return render_store_error(err),
        Err(ClientError::AuthFailed) => {
            return render_error(StatusCode::BAD_REQUEST, "unauthorized_client", "unknown client")
        }
    };
    if !registry.validate_redirect_uri(&client, redirect_uri) {
        return render_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri is not registered for this client",
        );
    }
    if method != PKCE_METHOD_S256 {
        return render_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge_method must be S256",
        );
    }
    if !validate_code_challenge(code_challenge) {
        return render_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "malformed code_challenge",
        );
    }

    // The redirect URI is now trusted; remaining errors go back to the
    // client application.
    let return_state = params.state.as_deref();

    // Step 3: response type. The implicit grant is deprecated and gone.
    if params.response_type.as_deref() != Some("code") {
        return redirect_error(
            redirect_uri,
            "unsupported_response_type",
            "only response_type=code is supported",
            return_state,
        );
    }
    if !client.allows_grant_type(GRANT_AUTHORIZATION_CODE) {
        return redirect_error(
            redirect_uri,
            "unauthorized_client",
            "client may not use the authorization code grant",
            return_state,
        );
    }

    // Step 4: scopes.
    let scopes = params.scopes();
    if !scopes.is_empty() && !validate_scope_tokens(&scopes) {
        return redirect_error(redirect_uri, "invalid_scope", "malformed scope", return_state);
    }
    if !client.allows_scopes(&scopes) {
        return redirect_error(
            redirect_uri,
            "invalid_scope",
            "requested scope is not permitted for this client",
            return_state,
        );
    }

    // Step 5: authentication decision.
    let session = match caller_session(&state, &headers).await {
        Ok(session) => session,
        Err(err) => return render_store_error(err),
    };
    let now = state.clock.now();
    let prompt = params.prompt.as_deref();
    let original_url = format!(
        "/oauth/authorize?{}",
        raw_query.as_deref().unwrap_or_default()
    );

    let needs_login = match &session {
        None => true,
        Some(session) => {
            let auth_time = session.auth_time.unwrap_or(session.created_at);
            prompt == Some("login")
                || params
                    .max_age
                    .map(|max_age| (now - auth_time).num_seconds() > max_age)
                    .unwrap_or(false)
        }
    };
    if needs_login {
        if prompt == Some("none") {
            return redirect_error(
                redirect_uri,
                "login_required",
                "no active login session",
                return_state,
            );
        }
        let login_url = format!(
            "{}?returnUrl={}",
            state.config.login_url,
            urlencoding::encode(&original_url)
        );
        return Redirect::temporary(&login_url).into_response();
    }
    let session = session.expect("session checked above");
    let user_id = session.user_id.expect("sessions always carry a user");
    let auth_time = session.auth_time.unwrap_or(session.created_at);

    // Step 6: consent decision.
    let covered = if client.require_consent {
        match state.consent_ledger().covers(user_id, client.id, &scopes).await {
            Ok(covered) => covered,
            Err(err) => return render_store_error(err),
        }
    } else {
        true
    };
    if !covered {
        if prompt == Some("none") {
            return redirect_error(
                redirect_uri,
                "consent_required",
                "consent has not been granted for the requested scope",
                return_state,
            );
        }
        return Redirect::temporary(&consent_url(&state, &client, &params, &original_url))
            .into_response();
    }

    // Step 7: issue the code and return to the client.
    match state
        .code_engine()
        .issue(
            user_id,
            client.id,
            redirect_uri,
            &scopes,
            params.nonce.as_deref(),
            code_challenge,
            method,
            auth_time,
        )
        .await
    {
        Ok(code) => redirect_with_code(redirect_uri, &code, return_state),
        Err(err) => {
            tracing::error!(error = %err, "authorization code issuance failed");
            redirect_error(
                redirect_uri,
                "server_error",
                "could not issue an authorization code",
                return_state,
            )
        }
    }
}

/// Where to send the user agent for the external consent UI, carrying
/// everything it needs to call back.
fn consent_url(
    state: &AppState,
    client: &Client,
    params: &AuthorizeParams,
    original_url: &str,
) -> String {
    let mut url = format!(
        "{}?client_id={}&scope={}&returnUrl={}",
        state.config.consent_url,
        urlencoding::encode(&client.client_id),
        urlencoding::encode(params.scope.as_deref().unwrap_or("")),
        urlencoding::encode(original_url),
    );
    if let Some(s) = params.state.as_deref() {
        url.push_str(&format!("&state={}", urlencoding::encode(s)));
    }
    url
}

/// POST /oauth/authorize/callback — the consent-UI touchpoint.
///
/// Requires the same login session as the authorize request. A denial
/// redirects with `access_denied`; an approval records the consent and
/// issues the code.
pub async fn authorize_callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonOrForm(req): JsonOrForm<ConsentCallbackRequest>,
) -> Response {
    let session = match caller_session(&state, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return render_error(
                StatusCode::UNAUTHORIZED,
                "invalid_request",
                "an authenticated session is required",
            )
        }
        Err(err) => return render_store_error(err),
    };
    let user_id = session.user_id.expect("sessions always carry a user");
    let auth_time = session.auth_time.unwrap_or(session.created_at);

    let registry = state.client_registry();
    let client = match registry.find(&req.client_id).await {
        Ok(client) => client,
        Err(ClientError::Store(err)) => return render_store_error(err),
        Err(_) => {
            return render_error(StatusCode::BAD_REQUEST, "unauthorized_client", "unknown client")
        }
    };
    if !registry.validate_redirect_uri(&client, &req.redirect_uri) {
        return render_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri is not registered for this client",
        );
    }

    let code_challenge = match req.code_challenge.as_deref() {
        Some(challenge) if validate_code_challenge(challenge) => challenge,
        _ => {
            return render_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "malformed code_challenge",
            )
        }
    };
    if req.code_challenge_method.as_deref().unwrap_or(PKCE_METHOD_S256) != PKCE_METHOD_S256 {
        return render_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge_method must be S256",
        );
    }

    let return_state = req.state.as_deref();
    let scopes = req.scopes();
    if (!scopes.is_empty() && !validate_scope_tokens(&scopes)) || !client.allows_scopes(&scopes) {
        return redirect_error(
            &req.redirect_uri,
            "invalid_scope",
            "requested scope is not permitted for this client",
            return_state,
        );
    }

    if !req.approved {
        tracing::info!(%user_id, client_id = %client.client_id, "consent denied");
        let denied = crate::error::OAuthError::AccessDenied;
        return redirect_error(
            &req.redirect_uri,
            denied.code(),
            "the user denied the request",
            return_state,
        );
    }

    if client.require_consent {
        if let Err(err) = state
            .consent_ledger()
            .record(user_id, client.id, &scopes)
            .await
        {
            return render_store_error(err);
        }
    }

    match state
        .code_engine()
        .issue(
            user_id,
            client.id,
            &req.redirect_uri,
            &scopes,
            req.nonce.as_deref(),
            code_challenge,
            PKCE_METHOD_S256,
            auth_time,
        )
        .await
    {
        Ok(code) => redirect_with_code(&req.redirect_uri, &code, return_state),
        Err(err) => {
            tracing::error!(error = %err, "authorization code issuance failed");
            redirect_error(
                &req.redirect_uri,
                "server_error",
                "could not issue an authorization code",
                return_state,
            )
        }
    }
}
