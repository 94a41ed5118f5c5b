mod clock;
mod config;
mod dto;
mod error;
mod handlers;
mod models;
mod services;
mod storage;
#[cfg(test)]
mod test_support;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::mysql::MySqlPoolOptions;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::clock::SystemClock;
use crate::config::{AppState, Config};
use crate::handlers::{
    auth::{login_handler, logout_handler},
    authorize::{authorize_callback_handler, authorize_handler},
    oidc::{openid_configuration_handler, userinfo_handler},
    token::{introspect_handler, revoke_handler, token_handler},
};
use crate::storage::{MySqlStore, Store};

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check - verifies storage connectivity
async fn ready_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, StatusCode> {
    state
        .store
        .ping()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(HealthResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Attach a correlation id to every request: it spans the logs and comes
/// back on the response as `x-request-id` for operator matching.
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = async move { next.run(request).await }.instrument(span).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Create the application router with all routes configured
///
/// # Routes
///
/// ## Session endpoints
/// - POST /auth/login - Verify credentials, set the session cookie
/// - POST /auth/logout - Revoke the session, clear the cookie
///
/// ## OAuth2 / OIDC endpoints
/// - GET  /oauth/authorize - Authorization endpoint (code flow with PKCE)
/// - POST /oauth/authorize/callback - Consent-UI decision callback
/// - POST /oauth/token - Token endpoint (authorization_code,
///   client_credentials, refresh_token)
/// - POST /oauth/introspect - Token introspection (RFC 7662)
/// - POST /oauth/revoke - Token revocation (RFC 7009)
/// - GET  /oauth/userinfo - OIDC UserInfo
/// - GET  /.well-known/openid-configuration - Discovery document
///
/// ## Operational endpoints
/// - GET /health, GET /ready
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler));

    let oauth_routes = Router::new()
        .route("/authorize", get(authorize_handler))
        .route("/authorize/callback", post(authorize_callback_handler))
        .route("/token", post(token_handler))
        .route("/introspect", post(introspect_handler))
        .route("/revoke", post(revoke_handler))
        .route("/userinfo", get(userinfo_handler));

    let wellknown_routes =
        Router::new().route("/openid-configuration", get(openid_configuration_handler));

    let cors = cors_layer(&state.config);
    let timeout = TimeoutLayer::new(Duration::from_secs(state.config.request_timeout_seconds));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .nest("/auth", auth_routes)
        .nest("/oauth", oauth_routes)
        .nest("/.well-known", wellknown_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(timeout)
        .layer(cors)
        .with_state(state)
}

/// Periodically drop expired codes and tokens, and prune stale rate-limit
/// windows.
fn spawn_purge_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(state.config.purge_interval_seconds));
        loop {
            interval.tick().await;
            let now = state.clock.now();

            match state.store.purge_expired_codes(now).await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged, "purged expired authorization codes")
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "authorization code purge failed"),
            }
            match state.store.purge_expired_tokens(now).await {
                Ok(purged) if purged > 0 => tracing::debug!(purged, "purged expired tokens"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "token purge failed"),
            }
            state.limiter.prune();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aegis_auth=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    // Create database pool with production settings
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let addr = config.socket_addr();

    // Signing keys and caches are loaded once here; rotation is an atomic
    // swap of the whole state.
    let store = Arc::new(MySqlStore::new(pool));
    let state = AppState::new(store, Arc::new(SystemClock), config)?;

    spawn_purge_task(state.clone());

    let app = create_router(state);

    tracing::info!(
        "authorization server v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use axum::body::Body;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_and_ready_respond() {
        let (state, _store, _clock) = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn responses_carry_a_correlation_id() {
        let (state, _store, _clock) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }
}
