//! Authorization-code engine.
//!
//! Codes are single-use, PKCE-bound (S256 only) and live for at most ten
//! minutes. Consumption runs the checks in a fixed order and flips the
//! `used` flag with a compare-and-set; the loser of a concurrent redeem
//! observes a replay. A replayed code revokes everything that was issued
//! from its first consumption.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::clock::{mint_id, Clock};
use crate::error::{CodeError, StoreError};
use crate::models::AuthorizationCode;
use crate::services::tokens::revoke_code_issuance;
use crate::storage::Store;
use crate::utils::pkce::{
    validate_code_challenge, validate_code_verifier, verify_s256, PKCE_METHOD_S256,
};
use crate::utils::secret::{generate_opaque_token, hash_token};

/// Maximum code lifetime; shorter configured TTLs are honoured, longer
/// ones are capped here.
const MAX_CODE_TTL_SECONDS: i64 = 600;

/// The payload handed to the token engine after a successful consume.
#[derive(Debug, Clone)]
pub struct ConsumedCode {
    pub code_id: Uuid,
    pub user_id: Uuid,
    pub scope: Vec<String>,
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
}

pub struct CodeEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CodeEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ttl_seconds: i64) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(ttl_seconds.min(MAX_CODE_TTL_SECONDS)),
        }
    }

    /// Issue a code for an authenticated, consented authorize request.
    ///
    /// Returns the plaintext code for the redirect; only its hash is
    /// stored.
    #[allow(clippy::too_many_arguments)]
    pub async fn issue(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        redirect_uri: &str,
        scope: &[String],
        nonce: Option<&str>,
        code_challenge: &str,
        code_challenge_method: &str,
        auth_time: DateTime<Utc>,
    ) -> Result<String, CodeError> {
        if code_challenge_method != PKCE_METHOD_S256 || !validate_code_challenge(code_challenge) {
            return Err(CodeError::Invalid);
        }

        let code = generate_opaque_token()
            .map_err(|e| CodeError::Store(StoreError::Unavailable(e.to_string())))?;
        let now = self.clock.now();

        let record = AuthorizationCode {
            id: mint_id(),
            code_hash: hash_token(&code),
            client_id,
            user_id,
            redirect_uri: redirect_uri.to_string(),
            scope: scope.to_vec(),
            nonce: nonce.map(String::from),
            code_challenge: code_challenge.to_string(),
            code_challenge_method: code_challenge_method.to_string(),
            auth_time,
            expires_at: now + self.ttl,
            used: false,
            created_at: now,
        };
        self.store.insert_code(&record).await?;

        Ok(code)
    }

    /// Consume a code presented at the token endpoint.
    ///
    /// Check order: existence/expiry, replay, client binding, redirect
    /// binding, PKCE. Replay (including losing the consumption race)
    /// revokes every token issued from the code before failing.
    pub async fn consume(
        &self,
        code: &str,
        client_id: Uuid,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<ConsumedCode, CodeError> {
        let record = self
            .store
            .find_code_by_hash(&hash_token(code))
            .await?
            .ok_or(CodeError::Invalid)?;

        if record.is_expired_at(self.clock.now()) {
            return Err(CodeError::Invalid);
        }

        if record.used {
            self.cascade_replay(&record).await?;
            return Err(CodeError::Replay);
        }

        if record.client_id != client_id {
            return Err(CodeError::ClientMismatch);
        }

        if record.redirect_uri != redirect_uri {
            return Err(CodeError::RedirectMismatch);
        }

        let verifier = code_verifier.ok_or(CodeError::VerifierMissing)?;
        if !validate_code_verifier(verifier) || !verify_s256(verifier, &record.code_challenge) {
            return Err(CodeError::VerifierMismatch);
        }

        if !self.store.mark_code_used(record.id).await? {
            // Lost the race: someone consumed this code concurrently.
            self.cascade_replay(&record).await?;
            return Err(CodeError::Replay);
        }

        Ok(ConsumedCode {
            code_id: record.id,
            user_id: record.user_id,
            scope: record.scope,
            nonce: record.nonce,
            auth_time: record.auth_time,
        })
    }

    async fn cascade_replay(&self, record: &AuthorizationCode) -> Result<(), CodeError> {
        let revoked = revoke_code_issuance(self.store.as_ref(), record.id).await?;
        tracing::warn!(
            code_id = %record.id,
            client_id = %record.client_id,
            revoked,
            "authorization code replay, revoking its issuance"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::AccessToken;
    use crate::storage::MemoryStore;
    use crate::utils::pkce::compute_s256_challenge;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const REDIRECT: &str = "https://app.example.com/callback";

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: CodeEngine,
        user_id: Uuid,
        client_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = CodeEngine::new(store.clone(), clock.clone(), 600);
        Fixture {
            store,
            clock,
            engine,
            user_id: mint_id(),
            client_id: mint_id(),
        }
    }

    async fn issue(f: &Fixture) -> String {
        f.engine
            .issue(
                f.user_id,
                f.client_id,
                REDIRECT,
                &["openid".to_string(), "profile".to_string()],
                Some("nonce-1"),
                &compute_s256_challenge(VERIFIER),
                PKCE_METHOD_S256,
                f.clock.now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn issue_then_consume_yields_the_issued_tuple() {
        let f = fixture().await;
        let auth_time = f.clock.now();
        let code = issue(&f).await;

        let consumed = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await
            .unwrap();

        assert_eq!(consumed.user_id, f.user_id);
        assert_eq!(
            consumed.scope,
            vec!["openid".to_string(), "profile".to_string()]
        );
        assert_eq!(consumed.nonce.as_deref(), Some("nonce-1"));
        assert_eq!(consumed.auth_time, auth_time);
    }

    #[tokio::test]
    async fn unknown_code_is_invalid() {
        let f = fixture().await;
        let result = f
            .engine
            .consume("no-such-code", f.client_id, REDIRECT, Some(VERIFIER))
            .await;
        assert!(matches!(result, Err(CodeError::Invalid)));
    }

    #[tokio::test]
    async fn expiry_boundary_is_exact() {
        let f = fixture().await;

        // At TTL - 1 the code still redeems.
        let code = issue(&f).await;
        f.clock.advance(Duration::seconds(599));
        assert!(f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await
            .is_ok());

        // At TTL + 1 it does not.
        let code = issue(&f).await;
        f.clock.advance(Duration::seconds(601));
        let result = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await;
        assert!(matches!(result, Err(CodeError::Invalid)));
    }

    #[tokio::test]
    async fn ttl_is_capped_at_ten_minutes() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = CodeEngine::new(store.clone(), clock.clone(), 7200);

        let code = engine
            .issue(
                mint_id(),
                mint_id(),
                REDIRECT,
                &[],
                None,
                &compute_s256_challenge(VERIFIER),
                PKCE_METHOD_S256,
                clock.now(),
            )
            .await
            .unwrap();

        let record = store
            .find_code_by_hash(&hash_token(&code))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.expires_at, record.created_at + Duration::seconds(600));
    }

    #[tokio::test]
    async fn issue_rejects_non_s256_methods() {
        let f = fixture().await;
        let result = f
            .engine
            .issue(
                f.user_id,
                f.client_id,
                REDIRECT,
                &[],
                None,
                VERIFIER, // plain: challenge == verifier
                "plain",
                f.clock.now(),
            )
            .await;
        assert!(matches!(result, Err(CodeError::Invalid)));
    }

    #[tokio::test]
    async fn second_consume_is_replay_and_revokes_the_issuance() {
        let f = fixture().await;
        let code = issue(&f).await;

        let consumed = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await
            .unwrap();

        // Simulate the token engine having issued from this code.
        let now = f.clock.now();
        let access = AccessToken {
            id: mint_id(),
            token_hash: "issued-access-hash".to_string(),
            client_id: Some(f.client_id),
            user_id: Some(f.user_id),
            scope: consumed.scope.clone(),
            expires_at: now + Duration::seconds(900),
            revoked: false,
            auth_time: None,
            code_id: Some(consumed.code_id),
            refresh_token_id: None,
            created_at: now,
        };
        f.store.insert_access_token(&access).await.unwrap();

        let result = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await;
        assert!(matches!(result, Err(CodeError::Replay)));

        let revoked = f
            .store
            .find_access_token_by_hash("issued-access-hash")
            .await
            .unwrap()
            .unwrap();
        assert!(revoked.revoked);
    }

    #[tokio::test]
    async fn code_is_bound_to_its_client() {
        let f = fixture().await;
        let code = issue(&f).await;

        let result = f
            .engine
            .consume(&code, mint_id(), REDIRECT, Some(VERIFIER))
            .await;
        assert!(matches!(result, Err(CodeError::ClientMismatch)));
    }

    #[tokio::test]
    async fn code_is_bound_to_its_redirect_uri() {
        let f = fixture().await;
        let code = issue(&f).await;

        let result = f
            .engine
            .consume(
                &code,
                f.client_id,
                "https://app.example.com/other",
                Some(VERIFIER),
            )
            .await;
        assert!(matches!(result, Err(CodeError::RedirectMismatch)));
    }

    #[tokio::test]
    async fn missing_verifier_is_rejected_before_pkce() {
        let f = fixture().await;
        let code = issue(&f).await;

        let result = f.engine.consume(&code, f.client_id, REDIRECT, None).await;
        assert!(matches!(result, Err(CodeError::VerifierMissing)));
    }

    #[tokio::test]
    async fn wrong_verifier_fails_pkce() {
        let f = fixture().await;
        let code = issue(&f).await;

        let wrong = "wrong_verifier_that_is_long_enough_to_pass_length_check";
        let result = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(wrong))
            .await;
        assert!(matches!(result, Err(CodeError::VerifierMismatch)));
    }

    #[tokio::test]
    async fn failed_pkce_leaves_the_code_unconsumed() {
        let f = fixture().await;
        let code = issue(&f).await;

        let wrong = "wrong_verifier_that_is_long_enough_to_pass_length_check";
        let _ = f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(wrong))
            .await;

        // The binding checks happen before the CAS, so the rightful
        // client can still redeem.
        assert!(f
            .engine
            .consume(&code, f.client_id, REDIRECT, Some(VERIFIER))
            .await
            .is_ok());
    }
}
