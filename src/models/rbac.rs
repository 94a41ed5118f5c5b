use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::LazyLock;
use uuid::Uuid;

// Permission names follow the `resource:action` shape.
static PERMISSION_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_-]+:[a-z0-9_-]+$").expect("invalid permission name regex")
});

/// Validate the `resource:action` shape of a permission name.
pub fn valid_permission_name(name: &str) -> bool {
    PERMISSION_NAME_REGEX.is_match(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Row type for MySQL query results, shared by roles and permissions.
#[derive(Debug, Clone, FromRow)]
pub struct NamedRow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<NamedRow> for Role {
    fn from(row: NamedRow) -> Self {
        Self {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

impl From<NamedRow> for Permission {
    fn from(row: NamedRow) -> Self {
        Self {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for Role {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let named_row = NamedRow::from_row(row)?;
        Ok(Role::from(named_row))
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> for Permission {
    fn from_row(row: &'r sqlx::mysql::MySqlRow) -> Result<Self, sqlx::Error> {
        let named_row = NamedRow::from_row(row)?;
        Ok(Permission::from(named_row))
    }
}
