//! Error taxonomy for the authorization server.
//!
//! Leaf components return typed errors; the endpoint orchestrators map them
//! to the stable OAuth wire codes. Response bodies never carry internal
//! detail — storage and crypto failures are logged and surfaced as
//! `server_error` / `temporarily_unavailable`.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// RFC 6749 error response body: `{"error": "...", "error_description": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    pub fn new(error: &str, description: Option<&str>) -> Self {
        Self {
            error: error.to_string(),
            error_description: description.map(String::from),
        }
    }
}

/// Failures in the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The system RNG was unavailable or produced no entropy.
    #[error("random number generator unavailable")]
    Weak,

    /// Malformed input (bad hash encoding, out-of-range verifier, ...).
    #[error("malformed cryptographic input")]
    Invalid,
}

/// Failures at the persistence gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("conflicting write")]
    Conflict,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Wrap a database driver error, preserving detail for the logs only.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failures from the session/credential authenticator.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("too many login attempts")]
    RateLimited { retry_after_seconds: i64 },

    #[error("invalid username or password")]
    BadCredentials,

    #[error("account is locked")]
    Locked,

    #[error("cryptographic failure")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AuthError::RateLimited {
                retry_after_seconds,
            } => {
                let body = OAuthErrorBody::new(
                    "rate_limited",
                    Some("Too many login attempts, try again later"),
                );
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Ok(value) = retry_after_seconds.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            AuthError::BadCredentials => (
                StatusCode::UNAUTHORIZED,
                OAuthErrorBody::new("invalid_credentials", Some("Invalid username or password")),
            ),
            AuthError::Locked => (
                StatusCode::LOCKED,
                OAuthErrorBody::new("account_locked", Some("Account is temporarily locked")),
            ),
            AuthError::Crypto(err) => {
                tracing::error!(error = %err, "crypto failure during authentication");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    OAuthErrorBody::new("server_error", Some("Internal server error")),
                )
            }
            AuthError::Store(StoreError::Unavailable(detail)) => {
                tracing::error!(detail = %detail, "storage unavailable during authentication");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    OAuthErrorBody::new("temporarily_unavailable", Some("Please retry")),
                )
            }
            AuthError::Store(err) => {
                tracing::error!(error = %err, "storage failure during authentication");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    OAuthErrorBody::new("server_error", Some("Internal server error")),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Failures from the client registry.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unknown client")]
    Unknown,

    #[error("client authentication failed")]
    AuthFailed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from the authorization-code engine.
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    /// Unknown or expired code.
    #[error("invalid or expired authorization code")]
    Invalid,

    /// The code has already been consumed; the issuance has been revoked.
    #[error("authorization code has already been used")]
    Replay,

    #[error("authorization code was issued to a different client")]
    ClientMismatch,

    #[error("redirect_uri does not match the authorization request")]
    RedirectMismatch,

    #[error("code_verifier is required")]
    VerifierMissing,

    #[error("PKCE code_verifier does not match the code_challenge")]
    VerifierMismatch,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from the token engine.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("{0}")]
    InvalidGrant(String),

    #[error("refresh token has expired")]
    Expired,

    #[error("refresh token was issued to a different client")]
    ClientMismatch,

    #[error("{0}")]
    InvalidScope(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wire-level OAuth error as seen by the endpoint orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("client authentication failed")]
    InvalidClient,

    #[error("{0}")]
    InvalidGrant(String),

    #[error("client is not authorized for this grant type")]
    UnauthorizedClient,

    #[error("unsupported grant type")]
    UnsupportedGrantType,

    #[error("{0}")]
    InvalidScope(String),

    #[error("access denied")]
    AccessDenied,

    #[error("internal server error: {0}")]
    ServerError(String),

    #[error("temporarily unavailable")]
    TemporarilyUnavailable,
}

impl OAuthError {
    /// The stable RFC 6749 error code.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient => "unauthorized_client",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::AccessDenied => "access_denied",
            OAuthError::ServerError(_) => "server_error",
            OAuthError::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient | OAuthError::UnauthorizedClient => StatusCode::UNAUTHORIZED,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthError::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Description safe to put on the wire. Internal failures are blanked.
    fn wire_description(&self) -> String {
        match self {
            OAuthError::ServerError(detail) => {
                tracing::error!(detail = %detail, "internal error surfaced at token endpoint");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = OAuthErrorBody::new(self.code(), Some(&self.wire_description()));

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        // Token endpoint responses, including errors, must never be cached.
        headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
        headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
        if matches!(self, OAuthError::InvalidClient) {
            headers.insert(
                header::WWW_AUTHENTICATE,
                "Basic realm=\"oauth/token\"".parse().unwrap(),
            );
        }
        response
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => {
                tracing::error!(detail = %detail, "storage unavailable");
                OAuthError::TemporarilyUnavailable
            }
            other => OAuthError::ServerError(other.to_string()),
        }
    }
}

impl From<ClientError> for OAuthError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Unknown | ClientError::AuthFailed => OAuthError::InvalidClient,
            ClientError::Store(err) => err.into(),
        }
    }
}

impl From<CodeError> for OAuthError {
    fn from(err: CodeError) -> Self {
        match err {
            // Missing verifier is a malformed request, not a bad grant.
            CodeError::VerifierMissing => OAuthError::InvalidRequest(err.to_string()),
            CodeError::Invalid
            | CodeError::Replay
            | CodeError::ClientMismatch
            | CodeError::RedirectMismatch
            | CodeError::VerifierMismatch => OAuthError::InvalidGrant(err.to_string()),
            CodeError::Store(err) => err.into(),
        }
    }
}

impl From<TokenError> for OAuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidGrant(desc) => OAuthError::InvalidGrant(desc),
            TokenError::Expired => {
                OAuthError::InvalidGrant("refresh token has expired".to_string())
            }
            TokenError::ClientMismatch => {
                OAuthError::InvalidGrant("token was issued to a different client".to_string())
            }
            TokenError::InvalidScope(desc) => OAuthError::InvalidScope(desc),
            TokenError::Signing(detail) => OAuthError::ServerError(detail),
            TokenError::Store(err) => err.into(),
        }
    }
}
