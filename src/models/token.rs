use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored access-token record.
///
/// Login sessions reuse this shape: a session row has `client_id = None`,
/// a `user_id` and an `auth_time`, and is bound to the authorization server
/// itself rather than any client. `code_id` and `refresh_token_id` record
/// where the token came from, for the replay revocation cascades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: Uuid,
    pub token_hash: String,
    pub client_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub auth_time: Option<DateTime<Utc>>,
    pub code_id: Option<Uuid>,
    pub refresh_token_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_session(&self) -> bool {
        self.client_id.is_none() && self.user_id.is_some()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Stored refresh-token record. `predecessor_id` links the rotation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: Uuid,
    pub token_hash: String,
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub predecessor_id: Option<Uuid>,
    pub code_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Row type for MySQL query results.
#[derive(Debug, Clone, FromRow)]
pub struct AccessTokenRow {
    pub id: String,
    pub token_hash: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub scope: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub auth_time: Option<DateTime<Utc>>,
    pub code_id: Option<String>,
    pub refresh_token_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AccessTokenRow> for AccessToken {
    fn from(row: AccessTokenRow) -> Self {
        Self {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            token_hash: row.token_hash,
            client_id: row.client_id.and_then(|id| Uuid::parse_str(&id).ok()),
            user_id: row.user_id.and_then(|id| Uuid::parse_str(&id).ok()),
            scope: serde_json::from_value(row.scope).unwrap_or_default(),
            expires_at: row.expires_at,
            revoked: row.revoked,
            auth_time: row.auth_time,
            code_id: row.code_id.and_then(|id| Uuid::parse_str(&id).ok()),
            refresh_token_id: row.refresh_token_id.and_then(|id| Uuid::parse_str(&id).ok()),
            created_at: row.created_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for AccessToken {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let token_row = AccessTokenRow::from_row(row)?;
        Ok(AccessToken::from(token_row))
    }
}

/// Row type for MySQL query results.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenRow {
    pub id: String,
    pub token_hash: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub predecessor_id: Option<String>,
    pub code_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        Self {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            token_hash: row.token_hash,
            client_id: Uuid::parse_str(&row.client_id).unwrap_or_default(),
            user_id: Uuid::parse_str(&row.user_id).unwrap_or_default(),
            scope: serde_json::from_value(row.scope).unwrap_or_default(),
            expires_at: row.expires_at,
            revoked: row.revoked,
            predecessor_id: row.predecessor_id.and_then(|id| Uuid::parse_str(&id).ok()),
            code_id: row.code_id.and_then(|id| Uuid::parse_str(&id).ok()),
            created_at: row.created_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for RefreshToken {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let token_row = RefreshTokenRow::from_row(row)?;
        Ok(RefreshToken::from(token_row))
    }
}
