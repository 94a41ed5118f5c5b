//! Permission evaluator with a TTL cache.
//!
//! Resolves `user → roles → permissions` through the gateway and caches the
//! flattened set per user. Entries expire lazily on read; RBAC mutations go
//! through this service so they can publish invalidations for the affected
//! users. A reader racing an invalidation may observe a one-step-stale set
//! for at most one load turnaround, which callers tolerate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{mint_id, Clock};
use crate::error::StoreError;
use crate::models::{valid_permission_name, Permission, Role};
use crate::storage::Store;

/// Failures from the RBAC mutation surface.
#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("permission name must have the form resource:action")]
    InvalidName,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct CacheEntry {
    permissions: HashSet<String>,
    expires_at: DateTime<Utc>,
}

pub struct PermissionService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<Uuid, CacheEntry>>,
}

impl PermissionService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ttl_seconds: i64) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(ttl_seconds),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Effective permission names for a user.
    ///
    /// Serves from the cache when the entry is fresh; otherwise loads from
    /// the gateway and caches the result. Never returns a superset of the
    /// stored truth: the cache only ever holds sets that were read whole
    /// from storage.
    pub async fn permissions_of(&self, user_id: Uuid) -> Result<HashSet<String>, StoreError> {
        let now = self.clock.now();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&user_id) {
                if entry.expires_at > now {
                    return Ok(entry.permissions.clone());
                }
            }
        }

        let loaded: HashSet<String> = self
            .store
            .permissions_for_user(user_id)
            .await?
            .into_iter()
            .collect();

        let mut cache = self.cache.write().await;
        cache.insert(
            user_id,
            CacheEntry {
                permissions: loaded.clone(),
                expires_at: now + self.ttl,
            },
        );

        Ok(loaded)
    }

    pub async fn has_permission(&self, user_id: Uuid, name: &str) -> Result<bool, StoreError> {
        Ok(self.permissions_of(user_id).await?.contains(name))
    }

    pub async fn invalidate(&self, user_id: Uuid) {
        self.cache.write().await.remove(&user_id);
    }

    /// Bulk invalidation for role-level mutations.
    pub async fn invalidate_by_role(&self, role_id: Uuid) -> Result<(), StoreError> {
        let users = self.store.users_with_role(role_id).await?;
        let mut cache = self.cache.write().await;
        for user_id in users {
            cache.remove(&user_id);
        }
        Ok(())
    }

    // ========================================================================
    // RBAC mutations (admin surface); each publishes its invalidation.
    // ========================================================================

    pub async fn create_role(&self, name: &str) -> Result<Role, RbacError> {
        let role = Role {
            id: mint_id(),
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        self.store.create_role(&role).await?;
        Ok(role)
    }

    pub async fn create_permission(&self, name: &str) -> Result<Permission, RbacError> {
        if !valid_permission_name(name) {
            return Err(RbacError::InvalidName);
        }
        let permission = Permission {
            id: mint_id(),
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        self.store.create_permission(&permission).await?;
        Ok(permission)
    }

    pub async fn grant_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError> {
        self.store
            .grant_permission_to_role(role_id, permission_id)
            .await?;
        self.invalidate_by_role(role_id).await?;
        Ok(())
    }

    pub async fn revoke_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), RbacError> {
        self.store
            .revoke_permission_from_role(role_id, permission_id)
            .await?;
        self.invalidate_by_role(role_id).await?;
        Ok(())
    }

    pub async fn assign_role_to_user(&self, user_id: Uuid, role_id: Uuid) -> Result<(), RbacError> {
        self.store.assign_role_to_user(user_id, role_id).await?;
        self.invalidate(user_id).await;
        Ok(())
    }

    pub async fn remove_role_from_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<(), RbacError> {
        self.store.remove_role_from_user(user_id, role_id).await?;
        self.invalidate(user_id).await;
        Ok(())
    }
}
