//! In-memory store.
//!
//! Backs the test suite and local development. Satisfies the same contract
//! and invariants as the MySQL store; the CAS operations take the table's
//! write lock, which makes them atomic with respect to each other.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AccessToken, AuthorizationCode, Client, ConsentGrant, Permission, RefreshToken, Role, User,
    UserStatus,
};
use crate::storage::Store;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    clients: HashMap<Uuid, Client>,
    codes: HashMap<Uuid, AuthorizationCode>,
    access_tokens: HashMap<Uuid, AccessToken>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    consents: HashMap<(Uuid, Uuid), ConsentGrant>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    role_permissions: HashSet<(Uuid, Uuid)>,
    user_roles: HashSet<(Uuid, Uuid)>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict);
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn record_login_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;

        user.failed_attempts += 1;
        if user.failed_attempts >= threshold {
            user.status = UserStatus::Locked;
            // Monotonic: never shorten an existing lockout.
            user.locked_until = Some(match user.locked_until {
                Some(existing) if existing > locked_until => existing,
                _ => locked_until,
            });
        }
        Ok(user.clone())
    }

    async fn record_login_success(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;

        user.failed_attempts = 0;
        user.locked_until = None;
        user.status = UserStatus::Active;
        user.last_login_at = Some(now);
        Ok(())
    }

    async fn create_client(&self, client: &Client) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .clients
            .values()
            .any(|c| c.client_id == client.client_id)
        {
            return Err(StoreError::Conflict);
        }
        tables.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn find_client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        Ok(self.tables.read().await.clients.get(&id).cloned())
    }

    async fn find_client_by_client_id(
        &self,
        client_id: &str,
    ) -> Result<Option<Client>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .clients
            .values()
            .find(|c| c.client_id == client_id)
            .cloned())
    }

    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.codes.values().any(|c| c.code_hash == code.code_hash) {
            return Err(StoreError::Conflict);
        }
        tables.codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_code_by_hash(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .codes
            .values()
            .find(|c| c.code_hash == code_hash)
            .cloned())
    }

    async fn mark_code_used(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let code = tables.codes.get_mut(&id).ok_or(StoreError::NotFound)?;
        if code.used {
            return Ok(false);
        }
        code.used = true;
        Ok(true)
    }

    async fn insert_access_token(&self, token: &AccessToken) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .access_tokens
            .values()
            .any(|t| t.token_hash == token.token_hash)
        {
            return Err(StoreError::Conflict);
        }
        tables.access_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_access_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessToken>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .access_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn revoke_access_token(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let token = tables
            .access_tokens
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        token.revoked = true;
        Ok(())
    }

    async fn revoke_access_tokens_for_code(&self, code_id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut revoked = 0;
        for token in tables.access_tokens.values_mut() {
            if token.code_id == Some(code_id) && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_access_tokens_for_refresh(
        &self,
        refresh_token_id: Uuid,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut revoked = 0;
        for token in tables.access_tokens.values_mut() {
            if token.refresh_token_id == Some(refresh_token_id) && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_tokens_for_user_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut revoked = 0;
        for token in tables.access_tokens.values_mut() {
            if token.user_id == Some(user_id) && token.client_id == Some(client_id) && !token.revoked
            {
                token.revoked = true;
                revoked += 1;
            }
        }
        for token in tables.refresh_tokens.values_mut() {
            if token.user_id == user_id && token.client_id == client_id && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .refresh_tokens
            .values()
            .any(|t| t.token_hash == token.token_hash)
        {
            return Err(StoreError::Conflict);
        }
        tables.refresh_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.tables.read().await.refresh_tokens.get(&id).cloned())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn find_refresh_successor(
        &self,
        predecessor_id: Uuid,
    ) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .refresh_tokens
            .values()
            .find(|t| t.predecessor_id == Some(predecessor_id))
            .cloned())
    }

    async fn find_refresh_tokens_for_code(
        &self,
        code_id: Uuid,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .refresh_tokens
            .values()
            .filter(|t| t.code_id == Some(code_id))
            .cloned()
            .collect())
    }

    async fn revoke_refresh_token(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let token = tables
            .refresh_tokens
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if token.revoked {
            return Ok(false);
        }
        token.revoked = true;
        Ok(true)
    }

    async fn find_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<ConsentGrant>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .consents
            .get(&(user_id, client_id))
            .cloned())
    }

    async fn upsert_consent(&self, grant: &ConsentGrant) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .consents
            .insert((grant.user_id, grant.client_id), grant.clone());
        Ok(())
    }

    async fn delete_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.consents.remove(&(user_id, client_id));
        Ok(())
    }

    async fn create_role(&self, role: &Role) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.roles.values().any(|r| r.name == role.name) {
            return Err(StoreError::Conflict);
        }
        tables.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn create_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.permissions.values().any(|p| p.name == permission.name) {
            return Err(StoreError::Conflict);
        }
        tables.permissions.insert(permission.id, permission.clone());
        Ok(())
    }

    async fn grant_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.roles.contains_key(&role_id) || !tables.permissions.contains_key(&permission_id)
        {
            return Err(StoreError::NotFound);
        }
        tables.role_permissions.insert((role_id, permission_id));
        Ok(())
    }

    async fn revoke_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.role_permissions.remove(&(role_id, permission_id));
        Ok(())
    }

    async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound);
        }
        tables.user_roles.insert((user_id, role_id));
        Ok(())
    }

    async fn remove_role_from_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.user_roles.remove(&(user_id, role_id));
        Ok(())
    }

    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables
            .user_roles
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .flat_map(|(_, role_id)| {
                tables
                    .role_permissions
                    .iter()
                    .filter(move |(rid, _)| rid == role_id)
                    .filter_map(|(_, pid)| tables.permissions.get(pid).map(|p| p.name.clone()))
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .user_roles
            .iter()
            .filter(|(_, rid)| *rid == role_id)
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn purge_expired_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.codes.len();
        tables.codes.retain(|_, c| c.expires_at > now);
        Ok((before - tables.codes.len()) as u64)
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.access_tokens.len() + tables.refresh_tokens.len();
        tables.access_tokens.retain(|_, t| t.expires_at > now);
        tables.refresh_tokens.retain(|_, t| t.expires_at > now);
        Ok((before - tables.access_tokens.len() - tables.refresh_tokens.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_user(username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: "$argon2id$fake".to_string(),
            status: UserStatus::Active,
            failed_attempts: 0,
            last_login_at: None,
            locked_until: None,
            created_at: Utc::now(),
        }
    }

    fn test_code(hash: &str) -> AuthorizationCode {
        let now = Utc::now();
        AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: hash.to_string(),
            client_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            scope: vec!["openid".to_string()],
            nonce: None,
            code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string(),
            code_challenge_method: "S256".to_string(),
            auth_time: now,
            expires_at: now + Duration::seconds(600),
            used: false,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_usernames_conflict() {
        let store = MemoryStore::new();
        store.create_user(&test_user("alice")).await.unwrap();

        let result = store.create_user(&test_user("alice")).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn mark_code_used_is_single_winner() {
        let store = MemoryStore::new();
        let code = test_code("hash-1");
        store.insert_code(&code).await.unwrap();

        assert!(store.mark_code_used(code.id).await.unwrap());
        assert!(!store.mark_code_used(code.id).await.unwrap());

        let reread = store.find_code_by_hash("hash-1").await.unwrap().unwrap();
        assert!(reread.used);
    }

    #[tokio::test]
    async fn locked_until_is_monotonic() {
        let store = MemoryStore::new();
        let user = test_user("bob");
        store.create_user(&user).await.unwrap();

        let now = Utc::now();
        let far = now + Duration::minutes(30);
        let near = now + Duration::minutes(5);

        // Lock far into the future, then try to shorten it.
        for _ in 0..5 {
            store.record_login_failure(user.id, 5, far).await.unwrap();
        }
        let updated = store.record_login_failure(user.id, 5, near).await.unwrap();

        assert_eq!(updated.status, UserStatus::Locked);
        assert_eq!(updated.locked_until, Some(far));
    }

    #[tokio::test]
    async fn login_success_resets_counters() {
        let store = MemoryStore::new();
        let user = test_user("carol");
        store.create_user(&user).await.unwrap();

        let until = Utc::now() + Duration::minutes(30);
        for _ in 0..5 {
            store.record_login_failure(user.id, 5, until).await.unwrap();
        }

        let now = Utc::now();
        store.record_login_success(user.id, now).await.unwrap();

        let reread = store.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(reread.failed_attempts, 0);
        assert_eq!(reread.status, UserStatus::Active);
        assert_eq!(reread.locked_until, None);
        assert_eq!(reread.last_login_at, Some(now));
    }

    #[tokio::test]
    async fn revoke_refresh_token_cas() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = RefreshToken {
            id: Uuid::new_v4(),
            token_hash: "rt-hash".to_string(),
            client_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            scope: vec![],
            expires_at: now + Duration::days(30),
            revoked: false,
            predecessor_id: None,
            code_id: None,
            created_at: now,
        };
        store.insert_refresh_token(&token).await.unwrap();

        assert!(store.revoke_refresh_token(token.id).await.unwrap());
        assert!(!store.revoke_refresh_token(token.id).await.unwrap());
    }

    #[tokio::test]
    async fn permissions_union_across_roles() {
        let store = MemoryStore::new();
        let user = test_user("dave");
        store.create_user(&user).await.unwrap();

        let now = Utc::now();
        let reader = Role {
            id: Uuid::new_v4(),
            name: "reader".to_string(),
            created_at: now,
        };
        let writer = Role {
            id: Uuid::new_v4(),
            name: "writer".to_string(),
            created_at: now,
        };
        let read = Permission {
            id: Uuid::new_v4(),
            name: "document:read".to_string(),
            created_at: now,
        };
        let write = Permission {
            id: Uuid::new_v4(),
            name: "document:write".to_string(),
            created_at: now,
        };

        store.create_role(&reader).await.unwrap();
        store.create_role(&writer).await.unwrap();
        store.create_permission(&read).await.unwrap();
        store.create_permission(&write).await.unwrap();
        // Both roles carry read; only writer carries write.
        store.grant_permission_to_role(reader.id, read.id).await.unwrap();
        store.grant_permission_to_role(writer.id, read.id).await.unwrap();
        store.grant_permission_to_role(writer.id, write.id).await.unwrap();
        store.assign_role_to_user(user.id, reader.id).await.unwrap();
        store.assign_role_to_user(user.id, writer.id).await.unwrap();

        let perms = store.permissions_for_user(user.id).await.unwrap();
        assert_eq!(
            perms,
            vec!["document:read".to_string(), "document:write".to_string()]
        );
    }

    #[tokio::test]
    async fn purge_removes_only_expired_codes() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut live = test_code("live");
        live.expires_at = now + Duration::seconds(600);
        let mut dead = test_code("dead");
        dead.expires_at = now - Duration::seconds(1);

        store.insert_code(&live).await.unwrap();
        store.insert_code(&dead).await.unwrap();

        assert_eq!(store.purge_expired_codes(now).await.unwrap(), 1);
        assert!(store.find_code_by_hash("live").await.unwrap().is_some());
        assert!(store.find_code_by_hash("dead").await.unwrap().is_none());
    }
}
