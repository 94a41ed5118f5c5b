use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user's recorded consent for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub scope: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConsentGrant {
    /// A request is covered iff every requested scope is inside the grant
    /// and the grant has not expired.
    pub fn covers(&self, requested: &[String], now: DateTime<Utc>) -> bool {
        if self.expires_at <= now {
            return false;
        }
        requested.iter().all(|s| self.scope.iter().any(|g| g == s))
    }
}

/// Row type for MySQL query results.
#[derive(Debug, Clone, FromRow)]
pub struct ConsentGrantRow {
    pub user_id: String,
    pub client_id: String,
    pub scope: serde_json::Value,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<ConsentGrantRow> for ConsentGrant {
    fn from(row: ConsentGrantRow) -> Self {
        Self {
            user_id: Uuid::parse_str(&row.user_id).unwrap_or_default(),
            client_id: Uuid::parse_str(&row.client_id).unwrap_or_default(),
            scope: serde_json::from_value(row.scope).unwrap_or_default(),
            granted_at: row.granted_at,
            expires_at: row.expires_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for ConsentGrant {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let grant_row = ConsentGrantRow::from_row(row)?;
        Ok(ConsentGrant::from(grant_row))
    }
}
