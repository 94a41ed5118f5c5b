//! Login and logout endpoints.
//!
//! The session artifact travels as the `session_token` cookie. The cookie
//! never asserts a `Domain` attribute: single-host deployments behind a
//! reverse proxy break when a narrower domain is set, so the browser is
//! left to derive it from the request host.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::config::AppState;
use crate::dto::{JsonOrForm, LoginRequest, LoginResponse};
use crate::error::AuthError;

pub const SESSION_COOKIE: &str = "session_token";

/// Pull the session token out of the Cookie header, if any.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("session_token="))
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// Client IP as reported by the fronting reverse proxy.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn session_set_cookie(state: &AppState, token: &str, max_age: i64) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, token, max_age
    );
    if state.config.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn session_clear_cookie(state: &AppState) -> String {
    session_set_cookie(state, "", 0)
}

/// POST /auth/login
pub async fn login_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonOrForm(req): JsonOrForm<LoginRequest>,
) -> Result<Response, AuthError> {
    let ip = client_ip(&headers);
    let session = state
        .authenticator
        .authenticate(&req.username, &req.password, &ip)
        .await?;

    let expires_in = (session.expires_at - session.auth_time).num_seconds();
    let mut response = Json(LoginResponse {
        user_id: session.user_id,
        expires_in,
    })
    .into_response();

    if let Ok(value) = session_set_cookie(&state, &session.token, expires_in).parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

/// POST /auth/logout
pub async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    if let Some(token) = session_cookie(&headers) {
        state.authenticator.logout(&token).await?;
    }

    let mut response = StatusCode::OK.into_response();
    if let Ok(value) = session_clear_cookie(&state).parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, login_request, seed_user, test_state, TEST_PASSWORD};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn login_sets_a_host_only_session_cookie() {
        let (state, _store, _clock) = test_state().await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state);

        let response = app
            .oneshot(login_request("alice", TEST_PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("session_token="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
        // Never an explicit Domain attribute.
        assert!(!cookie.contains("Domain"));

        let body = body_json(response).await;
        assert_eq!(body["expires_in"], 3600);
    }

    #[tokio::test]
    async fn login_accepts_form_bodies_too() {
        let (state, _store, _clock) = test_state().await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::from(format!(
                "username=alice&password={}",
                TEST_PASSWORD
            )))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (state, _store, _clock) = test_state().await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state);

        let response = app
            .oneshot(login_request("alice", "not-the-password", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn lockout_after_five_failures_then_recovery() {
        let (state, _store, clock) = test_state().await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state);

        // Four failures are plain rejections.
        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(login_request("alice", "wrong", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // The fifth locks the account.
        let response = app
            .clone()
            .oneshot(login_request("alice", "wrong", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Even the correct password is refused while the lock holds.
        let response = app
            .clone()
            .oneshot(login_request("alice", TEST_PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::LOCKED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "account_locked");

        // Until the lockout elapses.
        clock.advance(Duration::seconds(1801));
        let response = app
            .oneshot(login_request("alice", TEST_PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn per_ip_rate_limit_returns_429_with_retry_after() {
        let (state, _store, _clock) = crate::test_support::test_state_with(|config| {
            config.login_rate_limit_attempts = 5;
        })
        .await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state);

        // Prime the window with failures that do not touch alice's
        // lockout counter.
        for _ in 0..5 {
            let _ = app
                .clone()
                .oneshot(login_request("ghost", "wrong", "10.9.9.9"))
                .await
                .unwrap();
        }
        let response = app
            .clone()
            .oneshot(login_request("alice", TEST_PASSWORD, "10.9.9.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        // A different source address is unaffected.
        let response = app
            .oneshot(login_request("alice", TEST_PASSWORD, "10.9.9.10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logout_revokes_the_session_and_clears_the_cookie() {
        let (state, _store, _clock) = test_state().await;
        seed_user(&state, "alice").await;
        let app = crate::create_router(state.clone());

        let response = app
            .clone()
            .oneshot(login_request("alice", TEST_PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let token = cookie.strip_prefix("session_token=").unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/logout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cleared.contains("Max-Age=0"));

        assert!(state
            .authenticator
            .session_by_token(&token)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn login_rejects_unknown_content_types() {
        let (state, _store, _clock) = test_state().await;
        let app = crate::create_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("username=alice"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn cookie_parsing_handles_multiple_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; session_token=abc123; lang=en".parse().unwrap(),
        );
        assert_eq!(session_cookie(&headers), Some("abc123".to_string()));

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, "session_token=".parse().unwrap());
        assert_eq!(session_cookie(&empty), None);
    }
}
