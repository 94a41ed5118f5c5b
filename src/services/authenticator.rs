//! Session/credential authenticator.
//!
//! The only component that ever sees a plaintext password. Login verifies
//! the password on the blocking pool, enforces the per-IP rate limit and
//! the account lockout, and mints the opaque session artifact that the
//! authorize endpoint later reads back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::clock::{mint_id, Clock};
use crate::error::{AuthError, StoreError};
use crate::models::AccessToken;
use crate::services::rate_limit::LoginRateLimiter;
use crate::storage::Store;
use crate::utils::password::{dummy_verify, verify_password};
use crate::utils::secret::{generate_opaque_token, hash_token};

/// A freshly minted login session.
#[derive(Debug, Clone)]
pub struct SessionArtifact {
    /// Opaque session token; handed to the browser as a cookie, never
    /// persisted in plaintext.
    pub token: String,
    pub user_id: Uuid,
    pub auth_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    limiter: Arc<LoginRateLimiter>,
    lockout_threshold: i32,
    lockout_duration: Duration,
    session_ttl: Duration,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        limiter: Arc<LoginRateLimiter>,
        lockout_threshold: i32,
        lockout_duration_seconds: i64,
        session_ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            clock,
            limiter,
            lockout_threshold,
            lockout_duration: Duration::seconds(lockout_duration_seconds),
            session_ttl: Duration::seconds(session_ttl_seconds),
        }
    }

    /// Verify a username/password pair and mint a session.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<SessionArtifact, AuthError> {
        if let Err(retry_after_seconds) = self.limiter.check_and_record(client_ip) {
            return Err(AuthError::RateLimited {
                retry_after_seconds,
            });
        }

        let user = match self.store.find_user_by_username(username).await? {
            Some(user) => user,
            None => {
                // Unknown user: burn a hash anyway so the response time
                // matches the wrong-password path.
                let probe = password.to_string();
                tokio::task::spawn_blocking(move || dummy_verify(&probe))
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                return Err(AuthError::BadCredentials);
            }
        };

        let now = self.clock.now();
        if user.is_locked_at(now) {
            return Err(AuthError::Locked);
        }

        let candidate = password.to_string();
        let stored_hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&candidate, &stored_hash))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;

        if !valid {
            let updated = self
                .store
                .record_login_failure(user.id, self.lockout_threshold, now + self.lockout_duration)
                .await?;
            if updated.is_locked_at(now) {
                tracing::warn!(user_id = %user.id, "account locked after repeated failures");
            }
            return Err(AuthError::BadCredentials);
        }

        self.store.record_login_success(user.id, now).await?;

        let token = generate_opaque_token()?;
        let session = AccessToken {
            id: mint_id(),
            token_hash: hash_token(&token),
            client_id: None,
            user_id: Some(user.id),
            scope: vec![],
            expires_at: now + self.session_ttl,
            revoked: false,
            auth_time: Some(now),
            code_id: None,
            refresh_token_id: None,
            created_at: now,
        };
        self.store.insert_access_token(&session).await?;

        tracing::info!(user_id = %user.id, "login succeeded");

        Ok(SessionArtifact {
            token,
            user_id: user.id,
            auth_time: now,
            expires_at: session.expires_at,
        })
    }

    /// Resolve a session cookie value back to its live session record.
    pub async fn session_by_token(&self, token: &str) -> Result<Option<AccessToken>, StoreError> {
        let hash = hash_token(token);
        let now = self.clock.now();

        Ok(self
            .store
            .find_access_token_by_hash(&hash)
            .await?
            .filter(|t| t.is_session() && t.is_active_at(now)))
    }

    /// Revoke the session behind a cookie value, if it exists.
    pub async fn logout(&self, token: &str) -> Result<(), StoreError> {
        let hash = hash_token(token);
        if let Some(session) = self.store.find_access_token_by_hash(&hash).await? {
            if session.is_session() {
                self.store.revoke_access_token(session.id).await?;
            }
        }
        Ok(())
    }
}
