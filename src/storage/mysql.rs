//! MySQL store.
//!
//! UUIDs are bound as CHAR(36) strings and scope sets as JSON columns.
//! The single-use and rotation guarantees ride on conditional UPDATEs:
//! the row count tells the caller whether it won the compare-and-set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AccessToken, AuthorizationCode, Client, ConsentGrant, Permission, RefreshToken, Role, User,
};
use crate::storage::Store;

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn scope_json(scope: &[String]) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(scope).map_err(StoreError::backend)
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users
            (id, username, password_hash, status, failed_attempts, last_login_at, locked_until, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.status.as_str())
        .bind(user.failed_attempts)
        .bind(user.last_login_at)
        .bind(user.locked_until)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            _ => StoreError::backend(e),
        })?;

        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, status, failed_attempts,
                   last_login_at, locked_until, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, status, failed_attempts,
                   last_login_at, locked_until, created_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn record_login_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        // MySQL applies SET clauses left to right, so the later IFs see the
        // incremented counter. locked_until is only ever extended.
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_attempts = failed_attempts + 1,
                status = IF(failed_attempts >= ?, 'locked', status),
                locked_until = IF(failed_attempts >= ?,
                    IF(locked_until IS NULL OR locked_until < ?, ?, locked_until),
                    locked_until)
            WHERE id = ?
            "#,
        )
        .bind(threshold)
        .bind(threshold)
        .bind(locked_until)
        .bind(locked_until)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        self.find_user(user_id).await?.ok_or(StoreError::NotFound)
    }

    async fn record_login_success(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_attempts = 0,
                status = 'active',
                locked_until = NULL,
                last_login_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_client(&self, client: &Client) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clients
            (id, client_id, client_secret_hash, kind, redirect_uris, allowed_scopes,
             allowed_grant_types, require_consent, require_pkce, access_token_ttl,
             refresh_token_ttl, assertion_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(client.id.to_string())
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(client.kind.as_str())
        .bind(Self::scope_json(&client.redirect_uris)?)
        .bind(Self::scope_json(&client.allowed_scopes)?)
        .bind(Self::scope_json(&client.allowed_grant_types)?)
        .bind(client.require_consent)
        .bind(client.require_pkce)
        .bind(client.access_token_ttl)
        .bind(client.refresh_token_ttl)
        .bind(&client.assertion_key)
        .bind(client.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            _ => StoreError::backend(e),
        })?;

        Ok(())
    }

    async fn find_client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        sqlx::query_as::<_, Client>(
            r#"
            SELECT id, client_id, client_secret_hash, kind, redirect_uris, allowed_scopes,
                   allowed_grant_types, require_consent, require_pkce, access_token_ttl,
                   refresh_token_ttl, assertion_key, created_at
            FROM clients
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn find_client_by_client_id(
        &self,
        client_id: &str,
    ) -> Result<Option<Client>, StoreError> {
        sqlx::query_as::<_, Client>(
            r#"
            SELECT id, client_id, client_secret_hash, kind, redirect_uris, allowed_scopes,
                   allowed_grant_types, require_consent, require_pkce, access_token_ttl,
                   refresh_token_ttl, assertion_key, created_at
            FROM clients
            WHERE client_id = ?
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes
            (id, code_hash, client_id, user_id, redirect_uri, scope, nonce,
             code_challenge, code_challenge_method, auth_time, expires_at, used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(code.id.to_string())
        .bind(&code.code_hash)
        .bind(code.client_id.to_string())
        .bind(code.user_id.to_string())
        .bind(&code.redirect_uri)
        .bind(Self::scope_json(&code.scope)?)
        .bind(&code.nonce)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(code.auth_time)
        .bind(code.expires_at)
        .bind(code.used)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn find_code_by_hash(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        sqlx::query_as::<_, AuthorizationCode>(
            r#"
            SELECT id, code_hash, client_id, user_id, redirect_uri, scope, nonce,
                   code_challenge, code_challenge_method, auth_time, expires_at, used, created_at
            FROM authorization_codes
            WHERE code_hash = ?
            "#,
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn mark_code_used(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE authorization_codes
            SET used = TRUE
            WHERE id = ? AND used = FALSE
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_access_token(&self, token: &AccessToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO access_tokens
            (id, token_hash, client_id, user_id, scope, expires_at, revoked,
             auth_time, code_id, refresh_token_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.id.to_string())
        .bind(&token.token_hash)
        .bind(token.client_id.map(|id| id.to_string()))
        .bind(token.user_id.map(|id| id.to_string()))
        .bind(Self::scope_json(&token.scope)?)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.auth_time)
        .bind(token.code_id.map(|id| id.to_string()))
        .bind(token.refresh_token_id.map(|id| id.to_string()))
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn find_access_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessToken>, StoreError> {
        sqlx::query_as::<_, AccessToken>(
            r#"
            SELECT id, token_hash, client_id, user_id, scope, expires_at, revoked,
                   auth_time, code_id, refresh_token_id, created_at
            FROM access_tokens
            WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn revoke_access_token(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE access_tokens SET revoked = TRUE WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn revoke_access_tokens_for_code(&self, code_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE access_tokens SET revoked = TRUE WHERE code_id = ? AND revoked = FALSE
            "#,
        )
        .bind(code_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected())
    }

    async fn revoke_access_tokens_for_refresh(
        &self,
        refresh_token_id: Uuid,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE access_tokens SET revoked = TRUE WHERE refresh_token_id = ? AND revoked = FALSE
            "#,
        )
        .bind(refresh_token_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected())
    }

    async fn revoke_tokens_for_user_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<u64, StoreError> {
        let access = sqlx::query(
            r#"
            UPDATE access_tokens
            SET revoked = TRUE
            WHERE user_id = ? AND client_id = ? AND revoked = FALSE
            "#,
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let refresh = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE user_id = ? AND client_id = ? AND revoked = FALSE
            "#,
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(access.rows_affected() + refresh.rows_affected())
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
            (id, token_hash, client_id, user_id, scope, expires_at, revoked,
             predecessor_id, code_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.id.to_string())
        .bind(&token.token_hash)
        .bind(token.client_id.to_string())
        .bind(token.user_id.to_string())
        .bind(Self::scope_json(&token.scope)?)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.predecessor_id.map(|id| id.to_string()))
        .bind(token.code_id.map(|id| id.to_string()))
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, token_hash, client_id, user_id, scope, expires_at, revoked,
                   predecessor_id, code_id, created_at
            FROM refresh_tokens
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, StoreError> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, token_hash, client_id, user_id, scope, expires_at, revoked,
                   predecessor_id, code_id, created_at
            FROM refresh_tokens
            WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn find_refresh_successor(
        &self,
        predecessor_id: Uuid,
    ) -> Result<Option<RefreshToken>, StoreError> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, token_hash, client_id, user_id, scope, expires_at, revoked,
                   predecessor_id, code_id, created_at
            FROM refresh_tokens
            WHERE predecessor_id = ?
            "#,
        )
        .bind(predecessor_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn find_refresh_tokens_for_code(
        &self,
        code_id: Uuid,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT id, token_hash, client_id, user_id, scope, expires_at, revoked,
                   predecessor_id, code_id, created_at
            FROM refresh_tokens
            WHERE code_id = ?
            "#,
        )
        .bind(code_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn revoke_refresh_token(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE id = ? AND revoked = FALSE
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<ConsentGrant>, StoreError> {
        sqlx::query_as::<_, ConsentGrant>(
            r#"
            SELECT user_id, client_id, scope, granted_at, expires_at
            FROM consent_grants
            WHERE user_id = ? AND client_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn upsert_consent(&self, grant: &ConsentGrant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO consent_grants (user_id, client_id, scope, granted_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                scope = VALUES(scope),
                granted_at = VALUES(granted_at),
                expires_at = VALUES(expires_at)
            "#,
        )
        .bind(grant.user_id.to_string())
        .bind(grant.client_id.to_string())
        .bind(Self::scope_json(&grant.scope)?)
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn delete_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM consent_grants WHERE user_id = ? AND client_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn create_role(&self, role: &Role) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, name, created_at) VALUES (?, ?, ?)
            "#,
        )
        .bind(role.id.to_string())
        .bind(&role.name)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            _ => StoreError::backend(e),
        })?;

        Ok(())
    }

    async fn create_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, name, created_at) VALUES (?, ?, ?)
            "#,
        )
        .bind(permission.id.to_string())
        .bind(&permission.name)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            _ => StoreError::backend(e),
        })?;

        Ok(())
    }

    async fn grant_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT IGNORE INTO role_permissions (role_id, permission_id) VALUES (?, ?)
            "#,
        )
        .bind(role_id.to_string())
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn revoke_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?
            "#,
        )
        .bind(role_id.to_string())
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT IGNORE INTO user_roles (user_id, role_id) VALUES (?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn remove_role_from_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM user_roles WHERE user_id = ? AND role_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT p.name
            FROM user_roles ur
            JOIN role_permissions rp ON ur.role_id = rp.role_id
            JOIN permissions p ON rp.permission_id = p.id
            WHERE ur.user_id = ?
            ORDER BY p.name
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id FROM user_roles WHERE role_id = ?
            "#,
        )
        .bind(role_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(ids
            .into_iter()
            .filter_map(|id| Uuid::parse_str(&id).ok())
            .collect())
    }

    async fn purge_expired_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM authorization_codes WHERE expires_at < ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected())
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let access = sqlx::query(
            r#"
            DELETE FROM access_tokens WHERE expires_at < ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let refresh = sqlx::query(
            r#"
            DELETE FROM refresh_tokens WHERE expires_at < ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(access.rows_affected() + refresh.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StoreError::backend)
    }
}
