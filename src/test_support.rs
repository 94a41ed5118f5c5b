//! Shared fixtures for the handler-level tests: an in-memory application
//! state behind the real router, plus request builders for the flows.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::clock::{mint_id, ManualClock};
use crate::config::{AppState, Config};
use crate::models::{
    Client, ClientKind, User, UserStatus, GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS,
    GRANT_REFRESH_TOKEN,
};
use crate::storage::{MemoryStore, Store};
use crate::utils::password::hash_password;
use crate::utils::pkce::compute_s256_challenge;

pub const TEST_PASSWORD: &str = "CorrectHorse9";
pub const CLIENT_SECRET: &str = "s3cret-client-value";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";

/// RFC 7636 appendix B test vector.
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        server_host: "127.0.0.1".to_string(),
        server_port: 3000,
        request_timeout_seconds: 30,
        allowed_origins: vec!["*".to_string()],
        login_url: "/login".to_string(),
        consent_url: "/consent".to_string(),
        jwt_algorithm: "HS256".to_string(),
        jwt_issuer: "https://auth.test".to_string(),
        jwt_audience: "https://api.test".to_string(),
        jwt_hs256_secret: Some("unit-test-secret".to_string()),
        jwt_rsa_private_pem: None,
        jwt_rsa_public_pem: None,
        access_token_ttl_seconds: 900,
        refresh_token_ttl_seconds: 2_592_000,
        authorization_code_ttl_seconds: 600,
        session_ttl_seconds: 3600,
        consent_ttl_seconds: 2_592_000,
        permission_cache_ttl_seconds: 300,
        refresh_token_rotation: true,
        // Roomy default so multi-login tests are not throttled; the rate
        // limit test tightens it back down.
        login_rate_limit_attempts: 50,
        login_rate_limit_window_seconds: 300,
        lockout_threshold: 5,
        lockout_duration_seconds: 1800,
        cookie_secure: false,
        purge_interval_seconds: 300,
    }
}

pub async fn test_state() -> (AppState, Arc<MemoryStore>, Arc<ManualClock>) {
    test_state_with(|_| {}).await
}

pub async fn test_state_with(
    configure: impl FnOnce(&mut Config),
) -> (AppState, Arc<MemoryStore>, Arc<ManualClock>) {
    let mut config = test_config();
    configure(&mut config);

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let state = AppState::new(store.clone(), clock.clone(), config).expect("test state");
    (state, store, clock)
}

pub async fn seed_user(state: &AppState, username: &str) -> Uuid {
    let user = User {
        id: mint_id(),
        username: username.to_string(),
        password_hash: hash_password(TEST_PASSWORD).unwrap(),
        status: UserStatus::Active,
        failed_attempts: 0,
        last_login_at: None,
        locked_until: None,
        created_at: Utc::now(),
    };
    state.store.create_user(&user).await.unwrap();
    user.id
}

pub fn client_template(client_id: &str, require_consent: bool) -> Client {
    Client {
        id: mint_id(),
        client_id: client_id.to_string(),
        client_secret_hash: Some(bcrypt::hash(CLIENT_SECRET, 4).unwrap()),
        kind: ClientKind::Confidential,
        redirect_uris: vec![REDIRECT_URI.to_string()],
        allowed_scopes: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
            "api:read".to_string(),
            "api:write".to_string(),
        ],
        allowed_grant_types: vec![
            GRANT_AUTHORIZATION_CODE.to_string(),
            GRANT_CLIENT_CREDENTIALS.to_string(),
            GRANT_REFRESH_TOKEN.to_string(),
        ],
        require_consent,
        require_pkce: true,
        access_token_ttl: 900,
        refresh_token_ttl: 2_592_000,
        assertion_key: None,
        created_at: Utc::now(),
    }
}

pub async fn seed_client(state: &AppState, client_id: &str, require_consent: bool) -> Client {
    let client = client_template(client_id, require_consent);
    state.store.create_client(&client).await.unwrap();
    client
}

pub async fn seed_public_client(state: &AppState, client_id: &str) -> Client {
    let mut client = client_template(client_id, false);
    client.kind = ClientKind::Public;
    client.client_secret_hash = None;
    client.allowed_grant_types = vec![
        GRANT_AUTHORIZATION_CODE.to_string(),
        GRANT_REFRESH_TOKEN.to_string(),
    ];
    state.store.create_client(&client).await.unwrap();
    client
}

/// Builder for /oauth/authorize query strings.
pub struct AuthorizeQuery {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
}

impl AuthorizeQuery {
    pub fn new(client_id: &str) -> Self {
        Self {
            response_type: "code".to_string(),
            client_id: client_id.to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            scope: Some("openid".to_string()),
            state: None,
            nonce: None,
            code_challenge: compute_s256_challenge(VERIFIER),
            code_challenge_method: "S256".to_string(),
            prompt: None,
            max_age: None,
        }
    }
}

pub fn authorize_uri(query: &AuthorizeQuery) -> String {
    let mut uri = format!(
        "/oauth/authorize?response_type={}&client_id={}&redirect_uri={}&code_challenge={}&code_challenge_method={}",
        urlencoding::encode(&query.response_type),
        urlencoding::encode(&query.client_id),
        urlencoding::encode(&query.redirect_uri),
        urlencoding::encode(&query.code_challenge),
        urlencoding::encode(&query.code_challenge_method),
    );
    if let Some(scope) = &query.scope {
        uri.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    if let Some(state) = &query.state {
        uri.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    if let Some(nonce) = &query.nonce {
        uri.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }
    if let Some(prompt) = &query.prompt {
        uri.push_str(&format!("&prompt={}", urlencoding::encode(prompt)));
    }
    if let Some(max_age) = query.max_age {
        uri.push_str(&format!("&max_age={}", max_age));
    }
    uri
}

pub fn login_request(username: &str, password: &str, ip: &str) -> Request<Body> {
    let body = serde_json::json!({ "username": username, "password": password });
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn token_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn location<B>(response: &Response<B>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect response")
        .to_str()
        .unwrap()
        .to_string()
}

/// Log in and return the `session_token=...` cookie pair.
pub async fn login_and_get_cookie(app: &Router, username: &str) -> String {
    let response = app
        .clone()
        .oneshot(login_request(username, TEST_PASSWORD, "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "login should succeed");
    response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

/// Run the login + authorize steps and return the authorization code.
pub async fn obtain_code(app: &Router, username: &str, client_id: &str, scope: &str) -> String {
    let cookie = login_and_get_cookie(app, username).await;

    let mut query = AuthorizeQuery::new(client_id);
    query.scope = Some(scope.to_string());
    let request = Request::builder()
        .method("GET")
        .uri(authorize_uri(&query))
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    let location = location(&response);
    let code = location
        .split("code=")
        .nth(1)
        .unwrap_or_else(|| panic!("no code in redirect: {}", location))
        .split('&')
        .next()
        .unwrap();
    urlencoding::decode(code).unwrap().into_owned()
}
