//! OAuth2 / OpenID Connect request and response DTOs.
//!
//! Shapes follow RFC 6749 (OAuth 2.0), RFC 7636 (PKCE), RFC 7009
//! (revocation) and RFC 7662 (introspection). The authorize parameters are
//! all optional at the type level so that presence can be validated by the
//! orchestrator, which owns the render-vs-redirect decision.

use serde::{Deserialize, Serialize};

use crate::services::{Introspection, TokenGrant};

/// Split a space-delimited scope parameter.
///
/// Splits on spaces only: any other whitespace stays inside the token and
/// is caught by [`validate_scope_tokens`].
pub fn parse_scope(scope: &Option<String>) -> Vec<String> {
    scope
        .as_deref()
        .map(|s| {
            s.split(' ')
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Validate scope tokens against the RFC 6749 charset
/// (`%x21 / %x23-5B / %x5D-7E`).
pub fn validate_scope_tokens(scopes: &[String]) -> bool {
    scopes.iter().all(|token| {
        !token.is_empty()
            && token
                .chars()
                .all(|c| c == '\x21' || ('\x23'..='\x5b').contains(&c) || ('\x5d'..='\x7e').contains(&c))
    })
}

/// Query parameters of GET /oauth/authorize.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// `none` and `login` are honoured; anything else is ignored.
    pub prompt: Option<String>,
    /// Maximum age of the login session, in seconds.
    pub max_age: Option<i64>,
}

impl AuthorizeParams {
    pub fn scopes(&self) -> Vec<String> {
        parse_scope(&self.scope)
    }
}

/// Body of the consent-UI callback, POST /oauth/authorize/callback.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsentCallbackRequest {
    pub approved: bool,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

impl ConsentCallbackRequest {
    pub fn scopes(&self) -> Vec<String> {
        parse_scope(&self.scope)
    }
}

/// Form body of POST /oauth/token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

impl TokenRequest {
    pub fn scopes(&self) -> Vec<String> {
        parse_scope(&self.scope)
    }
}

/// Successful token response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

impl From<TokenGrant> for TokenResponse {
    fn from(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            token_type: grant.token_type,
            expires_in: grant.expires_in,
            refresh_token: grant.refresh_token,
            id_token: grant.id_token,
            scope: grant.scope.join(" "),
        }
    }
}

/// Form body of POST /oauth/introspect.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
    #[serde(default)]
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

/// RFC 7662 introspection response. Inactive tokens carry nothing but the
/// `active` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl From<Introspection> for IntrospectionResponse {
    fn from(i: Introspection) -> Self {
        Self {
            active: i.active,
            scope: i.scope,
            client_id: i.client_id,
            sub: i.sub,
            exp: i.exp,
            iat: i.iat,
            permissions: i.permissions,
        }
    }
}

/// Form body of POST /oauth/revoke.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
    #[serde(default)]
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

/// UserInfo response; claims are filtered by the granted scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

/// GET /.well-known/openid-configuration discovery document.
#[derive(Debug, Clone, Serialize)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    /// Served by the key-distribution collaborator, not this process.
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl OpenIdConfiguration {
    pub fn new(issuer: &str, algorithm: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{}/oauth/authorize", issuer),
            token_endpoint: format!("{}/oauth/token", issuer),
            userinfo_endpoint: format!("{}/oauth/userinfo", issuer),
            revocation_endpoint: format!("{}/oauth/revoke", issuer),
            introspection_endpoint: format!("{}/oauth/introspect", issuer),
            jwks_uri: format!("{}/.well-known/jwks.json", issuer),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "client_credentials".to_string(),
                "refresh_token".to_string(),
            ],
            scopes_supported: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "offline_access".to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
                "private_key_jwt".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
            id_token_signing_alg_values_supported: vec![algorithm.to_string()],
        }
    }
}
