//! Token engine: issuance, refresh with rotation, revocation, introspection.
//!
//! Access tokens are signed JWTs whose hash is also stored server-side so
//! they can be revoked; refresh tokens are opaque. Each refresh revokes its
//! predecessor and links the successor to it, forming the rotation chain.
//! Replay of any revoked link that has a successor collapses the whole
//! chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{mint_id, Clock};
use crate::error::{CryptoError, StoreError, TokenError};
use crate::models::{AccessToken, Client, RefreshToken};
use crate::services::codes::ConsumedCode;
use crate::services::permission::PermissionService;
use crate::storage::Store;
use crate::utils::jwt::{AccessClaims, IdClaims, JwtSigner};
use crate::utils::secret::{generate_opaque_token, hash_token};

/// A successful token issuance, as returned to the orchestrator.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub scope: Vec<String>,
}

/// RFC 7662-shaped introspection result.
#[derive(Debug, Clone)]
pub struct Introspection {
    pub active: bool,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub sub: Option<String>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub permissions: Option<Vec<String>>,
}

impl Introspection {
    fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            exp: None,
            iat: None,
            permissions: None,
        }
    }
}

fn rng_failure(err: CryptoError) -> TokenError {
    TokenError::Store(StoreError::Unavailable(err.to_string()))
}

pub struct TokenEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    signer: JwtSigner,
    permissions: Arc<PermissionService>,
    rotation_enabled: bool,
    default_access_ttl: i64,
}

impl TokenEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        signer: JwtSigner,
        permissions: Arc<PermissionService>,
        rotation_enabled: bool,
        default_access_ttl: i64,
    ) -> Self {
        Self {
            store,
            clock,
            signer,
            permissions,
            rotation_enabled,
            default_access_ttl,
        }
    }

    pub fn signer(&self) -> &JwtSigner {
        &self.signer
    }

    // ========================================================================
    // Issuance
    // ========================================================================

    /// Issue tokens for a freshly consumed authorization code.
    ///
    /// Always an access token; a refresh token when the client is
    /// configured for them; an ID token when the `openid` scope was
    /// granted.
    pub async fn issue_from_code(
        &self,
        consumed: &ConsumedCode,
        client: &Client,
    ) -> Result<TokenGrant, TokenError> {
        let now = self.clock.now();
        let permissions = self.permission_snapshot(Some(consumed.user_id)).await?;

        let mut refresh_plaintext = None;
        let mut refresh_id = None;
        if client.issues_refresh_tokens() {
            let (plaintext, record) = self
                .mint_refresh(client, consumed.user_id, &consumed.scope, None, Some(consumed.code_id), now)
                .await?;
            refresh_plaintext = Some(plaintext);
            refresh_id = Some(record.id);
        }

        let (access_jwt, access_record) = self
            .mint_access(
                client,
                Some(consumed.user_id),
                &consumed.scope,
                permissions,
                Some(consumed.auth_time),
                Some(consumed.code_id),
                refresh_id,
                now,
            )
            .await?;

        let id_token = if consumed.scope.iter().any(|s| s == "openid") {
            Some(self.mint_id_token(consumed, client, now).await?)
        } else {
            None
        };

        tracing::info!(
            client_id = %client.client_id,
            user_id = %consumed.user_id,
            "issued tokens from authorization code"
        );

        Ok(TokenGrant {
            access_token: access_jwt,
            token_type: "Bearer".to_string(),
            expires_in: (access_record.expires_at - now).num_seconds(),
            refresh_token: refresh_plaintext,
            id_token,
            scope: consumed.scope.clone(),
        })
    }

    /// Client-credentials issuance: access token only, no user subject.
    ///
    /// The requested scope must be a subset of the client's allowed scopes;
    /// an omitted scope yields the empty set, matching the observed
    /// behaviour of the system this replaces.
    pub async fn issue_client_credentials(
        &self,
        client: &Client,
        requested_scope: &[String],
    ) -> Result<TokenGrant, TokenError> {
        if !client.allows_scopes(requested_scope) {
            return Err(TokenError::InvalidScope(
                "requested scope exceeds the client's allowed scopes".to_string(),
            ));
        }

        let now = self.clock.now();
        let (access_jwt, access_record) = self
            .mint_access(client, None, requested_scope, vec![], None, None, None, now)
            .await?;

        Ok(TokenGrant {
            access_token: access_jwt,
            token_type: "Bearer".to_string(),
            expires_in: (access_record.expires_at - now).num_seconds(),
            refresh_token: None,
            id_token: None,
            scope: requested_scope.to_vec(),
        })
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Redeem a refresh token.
    ///
    /// A requested scope narrows the issued access token to its
    /// intersection with the original grant; scopes outside the original
    /// are dropped silently, never an error. The successor refresh token
    /// keeps the original scope.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: &Client,
        requested_scope: Option<&[String]>,
    ) -> Result<TokenGrant, TokenError> {
        let hash = hash_token(refresh_token);
        let token = self
            .store
            .find_refresh_token_by_hash(&hash)
            .await?
            .ok_or_else(|| TokenError::InvalidGrant("unknown refresh token".to_string()))?;

        let now = self.clock.now();
        if token.is_expired_at(now) {
            return Err(TokenError::Expired);
        }

        if token.revoked {
            if self.store.find_refresh_successor(token.id).await?.is_some() {
                // The chain has been replayed: collapse it entirely.
                let revoked = revoke_rotation_chain(self.store.as_ref(), &token).await?;
                tracing::warn!(
                    refresh_token_id = %token.id,
                    revoked,
                    "refresh token replay detected, rotation chain revoked"
                );
                return Err(TokenError::InvalidGrant(
                    "refresh token reuse detected (possible replay)".to_string(),
                ));
            }
            return Err(TokenError::InvalidGrant(
                "refresh token has been revoked".to_string(),
            ));
        }

        if token.client_id != client.id {
            return Err(TokenError::ClientMismatch);
        }

        let issued_scope: Vec<String> = match requested_scope {
            Some(requested) if !requested.is_empty() => requested
                .iter()
                .filter(|s| token.scope.contains(*s))
                .cloned()
                .collect(),
            _ => token.scope.clone(),
        };

        let (refresh_out, active_refresh_id) = if self.rotation_enabled {
            if !self.store.revoke_refresh_token(token.id).await? {
                // Lost the rotation race: someone else spent this token
                // concurrently, which is indistinguishable from replay.
                let _ = revoke_rotation_chain(self.store.as_ref(), &token).await?;
                return Err(TokenError::InvalidGrant(
                    "refresh token reuse detected (possible replay)".to_string(),
                ));
            }
            let (plaintext, record) = self
                .mint_refresh(
                    client,
                    token.user_id,
                    &token.scope,
                    Some(token.id),
                    token.code_id,
                    now,
                )
                .await?;
            (plaintext, record.id)
        } else {
            (refresh_token.to_string(), token.id)
        };

        let permissions = self.permission_snapshot(Some(token.user_id)).await?;
        let (access_jwt, access_record) = self
            .mint_access(
                client,
                Some(token.user_id),
                &issued_scope,
                permissions,
                None,
                token.code_id,
                Some(active_refresh_id),
                now,
            )
            .await?;

        Ok(TokenGrant {
            access_token: access_jwt,
            token_type: "Bearer".to_string(),
            expires_in: (access_record.expires_at - now).num_seconds(),
            refresh_token: Some(refresh_out),
            id_token: None,
            scope: issued_scope,
        })
    }

    // ========================================================================
    // Revocation & introspection
    // ========================================================================

    /// RFC 7009 revocation. Unknown tokens succeed silently, and a token
    /// belonging to another client is not revealed as existing.
    pub async fn revoke(&self, token: &str, client: &Client) -> Result<(), TokenError> {
        let hash = hash_token(token);

        if let Some(access) = self.store.find_access_token_by_hash(&hash).await? {
            if access.client_id == Some(client.id) {
                self.store.revoke_access_token(access.id).await?;
            }
            return Ok(());
        }

        if let Some(refresh) = self.store.find_refresh_token_by_hash(&hash).await? {
            if refresh.client_id == client.id {
                // Revoking a refresh token takes its whole chain's access
                // tokens with it.
                revoke_rotation_chain(self.store.as_ref(), &refresh).await?;
            }
            return Ok(());
        }

        Ok(())
    }

    /// Server-to-server introspection. Inactive tokens reveal nothing.
    pub async fn introspect(&self, token: &str) -> Result<Introspection, TokenError> {
        let hash = hash_token(token);
        let now = self.clock.now();

        if let Some(access) = self.store.find_access_token_by_hash(&hash).await? {
            if !access.is_active_at(now) {
                return Ok(Introspection::inactive());
            }
            let client_id = match access.client_id {
                Some(id) => self.store.find_client(id).await?.map(|c| c.client_id),
                None => None,
            };
            let permissions = self.permission_snapshot(access.user_id).await?;
            return Ok(Introspection {
                active: true,
                scope: Some(access.scope.join(" ")),
                client_id,
                sub: access.user_id.map(|id| id.to_string()),
                exp: Some(access.expires_at.timestamp()),
                iat: Some(access.created_at.timestamp()),
                permissions: Some(permissions),
            });
        }

        if let Some(refresh) = self.store.find_refresh_token_by_hash(&hash).await? {
            if refresh.revoked || refresh.is_expired_at(now) {
                return Ok(Introspection::inactive());
            }
            let client_id = self
                .store
                .find_client(refresh.client_id)
                .await?
                .map(|c| c.client_id);
            return Ok(Introspection {
                active: true,
                scope: Some(refresh.scope.join(" ")),
                client_id,
                sub: Some(refresh.user_id.to_string()),
                exp: Some(refresh.expires_at.timestamp()),
                iat: Some(refresh.created_at.timestamp()),
                permissions: None,
            });
        }

        Ok(Introspection::inactive())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn permission_snapshot(
        &self,
        user_id: Option<Uuid>,
    ) -> Result<Vec<String>, StoreError> {
        match user_id {
            Some(user_id) => {
                let mut names: Vec<String> = self
                    .permissions
                    .permissions_of(user_id)
                    .await?
                    .into_iter()
                    .collect();
                names.sort();
                Ok(names)
            }
            None => Ok(vec![]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn mint_access(
        &self,
        client: &Client,
        user_id: Option<Uuid>,
        scope: &[String],
        permissions: Vec<String>,
        auth_time: Option<DateTime<Utc>>,
        code_id: Option<Uuid>,
        refresh_token_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(String, AccessToken), TokenError> {
        let ttl = if client.access_token_ttl > 0 {
            client.access_token_ttl
        } else {
            self.default_access_ttl
        };
        let expires_at = now + chrono::Duration::seconds(ttl);
        let id = mint_id();

        let claims = AccessClaims {
            iss: self.signer.issuer().to_string(),
            sub: user_id.map(|u| u.to_string()),
            aud: self.signer.audience().to_string(),
            client_id: client.client_id.clone(),
            scope: scope.join(" "),
            jti: id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            permissions,
        };
        let jwt = self.signer.sign_access(&claims)?;

        let record = AccessToken {
            id,
            token_hash: hash_token(&jwt),
            client_id: Some(client.id),
            user_id,
            scope: scope.to_vec(),
            expires_at,
            revoked: false,
            auth_time,
            code_id,
            refresh_token_id,
            created_at: now,
        };
        self.store.insert_access_token(&record).await?;

        Ok((jwt, record))
    }

    async fn mint_refresh(
        &self,
        client: &Client,
        user_id: Uuid,
        scope: &[String],
        predecessor_id: Option<Uuid>,
        code_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(String, RefreshToken), TokenError> {
        let plaintext = generate_opaque_token().map_err(rng_failure)?;
        let record = RefreshToken {
            id: mint_id(),
            token_hash: hash_token(&plaintext),
            client_id: client.id,
            user_id,
            scope: scope.to_vec(),
            expires_at: now + chrono::Duration::seconds(client.refresh_token_ttl),
            revoked: false,
            predecessor_id,
            code_id,
            created_at: now,
        };
        self.store.insert_refresh_token(&record).await?;

        Ok((plaintext, record))
    }

    async fn mint_id_token(
        &self,
        consumed: &ConsumedCode,
        client: &Client,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let preferred_username = if consumed.scope.iter().any(|s| s == "profile") {
            self.store
                .find_user(consumed.user_id)
                .await?
                .map(|u| u.username)
        } else {
            None
        };

        // Same zero-means-default fallback as mint_access; otherwise a
        // client configured with access_token_ttl = 0 would get an ID
        // token that is expired at issuance.
        let ttl = if client.access_token_ttl > 0 {
            client.access_token_ttl
        } else {
            self.default_access_ttl
        };

        let claims = IdClaims {
            iss: self.signer.issuer().to_string(),
            sub: consumed.user_id.to_string(),
            aud: client.client_id.clone(),
            exp: (now + chrono::Duration::seconds(ttl)).timestamp(),
            iat: now.timestamp(),
            auth_time: consumed.auth_time.timestamp(),
            nonce: consumed.nonce.clone(),
            preferred_username,
        };
        self.signer.sign_id(&claims)
    }
}

// ============================================================================
// Revocation cascades, shared with the authorization-code engine.
// ============================================================================

/// Revoke everything that was ever issued from an authorization code: its
/// access tokens and every rotation chain rooted in it.
pub async fn revoke_code_issuance(store: &dyn Store, code_id: Uuid) -> Result<u64, StoreError> {
    let mut revoked = store.revoke_access_tokens_for_code(code_id).await?;
    for refresh in store.find_refresh_tokens_for_code(code_id).await? {
        revoked += revoke_rotation_chain(store, &refresh).await?;
    }
    Ok(revoked)
}

/// Revoke an entire rotation chain, walking predecessors and successors
/// from the given link, together with the access tokens each link minted.
pub async fn revoke_rotation_chain(
    store: &dyn Store,
    token: &RefreshToken,
) -> Result<u64, StoreError> {
    let mut revoked = 0;

    let mut current = token.clone();
    loop {
        if store.revoke_refresh_token(current.id).await? {
            revoked += 1;
        }
        revoked += store.revoke_access_tokens_for_refresh(current.id).await?;
        match current.predecessor_id {
            Some(predecessor_id) => match store.find_refresh_token(predecessor_id).await? {
                Some(predecessor) => current = predecessor,
                None => break,
            },
            None => break,
        }
    }

    let mut cursor = token.id;
    while let Some(successor) = store.find_refresh_successor(cursor).await? {
        if store.revoke_refresh_token(successor.id).await? {
            revoked += 1;
        }
        revoked += store.revoke_access_tokens_for_refresh(successor.id).await?;
        cursor = successor.id;
    }

    Ok(revoked)
}
