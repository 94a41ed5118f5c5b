use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Grant type identifiers as they appear on the wire.
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Client type. Public clients hold no secret and must use PKCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Confidential,
    Public,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Confidential => "confidential",
            ClientKind::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "public" => ClientKind::Public,
            _ => ClientKind::Confidential,
        }
    }
}

/// A registered OAuth client.
///
/// Immutable after creation except through the (external) admin flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    pub kind: ClientKind,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub allowed_grant_types: Vec<String>,
    pub require_consent: bool,
    pub require_pkce: bool,
    pub access_token_ttl: i64,
    pub refresh_token_ttl: i64,
    /// Registered HMAC key for the `jwt-bearer` client assertion method.
    /// A hashed secret cannot verify an HMAC, so assertion clients register
    /// a dedicated key.
    #[serde(skip_serializing)]
    pub assertion_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn is_public(&self) -> bool {
        self.kind == ClientKind::Public
    }

    /// Exact-string match against the registered URIs. No wildcard, scheme
    /// upgrade, or substring relaxation.
    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.allowed_scopes.iter().any(|s| s == scope)
    }

    pub fn allows_scopes(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|s| self.allows_scope(s))
    }

    pub fn allows_grant_type(&self, grant_type: &str) -> bool {
        self.allowed_grant_types.iter().any(|g| g == grant_type)
    }

    /// Whether the authorization-code grant issues a refresh token for this
    /// client. Client-configurable via its refresh-token TTL.
    pub fn issues_refresh_tokens(&self) -> bool {
        self.refresh_token_ttl > 0
    }
}

/// Row type for MySQL query results.
#[derive(Debug, Clone, FromRow)]
pub struct ClientRow {
    pub id: String,
    pub client_id: String,
    pub client_secret_hash: Option<String>,
    pub kind: String,
    pub redirect_uris: serde_json::Value,
    pub allowed_scopes: serde_json::Value,
    pub allowed_grant_types: serde_json::Value,
    pub require_consent: bool,
    pub require_pkce: bool,
    pub access_token_ttl: i64,
    pub refresh_token_ttl: i64,
    pub assertion_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            client_id: row.client_id,
            client_secret_hash: row.client_secret_hash,
            kind: ClientKind::parse(&row.kind),
            redirect_uris: serde_json::from_value(row.redirect_uris).unwrap_or_default(),
            allowed_scopes: serde_json::from_value(row.allowed_scopes).unwrap_or_default(),
            allowed_grant_types: serde_json::from_value(row.allowed_grant_types)
                .unwrap_or_default(),
            require_consent: row.require_consent,
            require_pkce: row.require_pkce,
            access_token_ttl: row.access_token_ttl,
            refresh_token_ttl: row.refresh_token_ttl,
            assertion_key: row.assertion_key,
            created_at: row.created_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for Client {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let client_row = ClientRow::from_row(row)?;
        Ok(Client::from(client_row))
    }
}
