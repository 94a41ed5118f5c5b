//! Persistence gateway.
//!
//! All entities are owned by this layer; services hold identifiers and go
//! through the [`Store`] trait for every read and mutation. Two backends
//! implement the contract: [`mysql::MySqlStore`] for production and
//! [`memory::MemoryStore`] for tests and local development.
//!
//! Race-prone flags (authorization-code `used`, refresh-token `revoked`)
//! are guarded by compare-and-set operations that report whether the caller
//! won; `locked_until` is only ever extended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AccessToken, AuthorizationCode, Client, ConsentGrant, Permission, RefreshToken, Role, User,
};

pub mod memory;
pub mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ========================================================================
    // Users
    // ========================================================================

    async fn create_user(&self, user: &User) -> Result<(), StoreError>;

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Record a failed login attempt.
    ///
    /// Increments `failed_attempts` (last-write-wins, the counter is
    /// advisory). When the post-increment count reaches `threshold` the row
    /// is marked locked and `locked_until` is extended to at least
    /// `locked_until` — never shortened. Returns the updated user.
    async fn record_login_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<User, StoreError>;

    /// Reset the failure counter and stamp `last_login_at`.
    async fn record_login_success(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ========================================================================
    // Clients
    // ========================================================================

    async fn create_client(&self, client: &Client) -> Result<(), StoreError>;

    async fn find_client(&self, id: Uuid) -> Result<Option<Client>, StoreError>;

    async fn find_client_by_client_id(&self, client_id: &str)
        -> Result<Option<Client>, StoreError>;

    // ========================================================================
    // Authorization codes
    // ========================================================================

    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError>;

    async fn find_code_by_hash(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError>;

    /// Atomically flip `used` from false to true. Returns whether the
    /// caller won the race; losers observe `used = true` on re-read.
    async fn mark_code_used(&self, id: Uuid) -> Result<bool, StoreError>;

    // ========================================================================
    // Access tokens (sessions included)
    // ========================================================================

    async fn insert_access_token(&self, token: &AccessToken) -> Result<(), StoreError>;

    async fn find_access_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessToken>, StoreError>;

    async fn revoke_access_token(&self, id: Uuid) -> Result<(), StoreError>;

    async fn revoke_access_tokens_for_code(&self, code_id: Uuid) -> Result<u64, StoreError>;

    async fn revoke_access_tokens_for_refresh(
        &self,
        refresh_token_id: Uuid,
    ) -> Result<u64, StoreError>;

    /// Revoke every access and refresh token bound to a user-client pair.
    async fn revoke_tokens_for_user_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<u64, StoreError>;

    // ========================================================================
    // Refresh tokens
    // ========================================================================

    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), StoreError>;

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError>;

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, StoreError>;

    /// The token rotated out of this one, if any.
    async fn find_refresh_successor(
        &self,
        predecessor_id: Uuid,
    ) -> Result<Option<RefreshToken>, StoreError>;

    async fn find_refresh_tokens_for_code(
        &self,
        code_id: Uuid,
    ) -> Result<Vec<RefreshToken>, StoreError>;

    /// Atomically flip `revoked` from false to true. Returns whether the
    /// caller won the race (the rotation CAS).
    async fn revoke_refresh_token(&self, id: Uuid) -> Result<bool, StoreError>;

    // ========================================================================
    // Consent
    // ========================================================================

    async fn find_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<ConsentGrant>, StoreError>;

    async fn upsert_consent(&self, grant: &ConsentGrant) -> Result<(), StoreError>;

    async fn delete_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<(), StoreError>;

    // ========================================================================
    // RBAC
    // ========================================================================

    async fn create_role(&self, role: &Role) -> Result<(), StoreError>;

    async fn create_permission(&self, permission: &Permission) -> Result<(), StoreError>;

    async fn grant_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn revoke_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;

    async fn remove_role_from_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;

    /// Effective permission names for a user, as a single atomic read over
    /// `user_roles → role_permissions → permissions`.
    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError>;

    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    // ========================================================================
    // Housekeeping
    // ========================================================================

    async fn purge_expired_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Cheap connectivity probe for the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
