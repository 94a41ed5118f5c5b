//! Consent ledger.
//!
//! Records which scopes a user has granted to a client, answers the
//! coverage question on the authorize path, and cascades token revocation
//! when a grant is withdrawn. Re-recording unions with any surviving
//! grant; an expired grant is replaced outright.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::ConsentGrant;
use crate::storage::Store;

pub struct ConsentLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ConsentLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ttl_seconds: i64) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// True iff a non-expired grant covers every requested scope.
    pub async fn covers(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        requested: &[String],
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .find_consent(user_id, client_id)
            .await?
            .map(|grant| grant.covers(requested, now))
            .unwrap_or(false))
    }

    /// Record approval; the stored scope set is the union with any
    /// existing non-expired grant.
    pub async fn record(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        scopes: &[String],
    ) -> Result<ConsentGrant, StoreError> {
        let now = self.clock.now();

        let mut merged: Vec<String> = match self.store.find_consent(user_id, client_id).await? {
            Some(existing) if existing.expires_at > now => existing.scope,
            _ => vec![],
        };
        for scope in scopes {
            if !merged.contains(scope) {
                merged.push(scope.clone());
            }
        }

        let grant = ConsentGrant {
            user_id,
            client_id,
            scope: merged,
            granted_at: now,
            expires_at: now + self.ttl,
        };
        self.store.upsert_consent(&grant).await?;

        tracing::info!(%user_id, %client_id, scopes = ?grant.scope, "consent recorded");
        Ok(grant)
    }

    /// Withdraw consent and revoke every token bound to the pair.
    pub async fn revoke(&self, user_id: Uuid, client_id: Uuid) -> Result<(), StoreError> {
        self.store.delete_consent(user_id, client_id).await?;
        let revoked = self
            .store
            .revoke_tokens_for_user_client(user_id, client_id)
            .await?;
        tracing::info!(%user_id, %client_id, revoked, "consent withdrawn");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{mint_id, ManualClock};
    use crate::models::AccessToken;
    use crate::storage::MemoryStore;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        ledger: ConsentLedger,
        user_id: Uuid,
        client_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ConsentLedger::new(store.clone(), clock.clone(), 2_592_000);
        Fixture {
            store,
            clock,
            ledger,
            user_id: mint_id(),
            client_id: mint_id(),
        }
    }

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn coverage_requires_a_superset_grant() {
        let f = fixture().await;
        f.ledger
            .record(f.user_id, f.client_id, &scopes(&["openid", "profile"]))
            .await
            .unwrap();

        assert!(f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap());
        assert!(f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid", "profile"]))
            .await
            .unwrap());
        assert!(!f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid", "email"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn no_grant_means_no_coverage() {
        let f = fixture().await;
        assert!(!f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn re_recording_unions_scopes() {
        let f = fixture().await;
        f.ledger
            .record(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap();
        f.ledger
            .record(f.user_id, f.client_id, &scopes(&["profile"]))
            .await
            .unwrap();

        assert!(f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid", "profile"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_grants_do_not_cover_and_do_not_union() {
        let f = fixture().await;
        f.ledger
            .record(f.user_id, f.client_id, &scopes(&["openid", "profile"]))
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(2_592_001));
        assert!(!f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap());

        // A fresh approval after expiry starts from scratch.
        let grant = f
            .ledger
            .record(f.user_id, f.client_id, &scopes(&["email"]))
            .await
            .unwrap();
        assert_eq!(grant.scope, scopes(&["email"]));
    }

    #[tokio::test]
    async fn revoke_deletes_the_grant_and_revokes_tokens() {
        let f = fixture().await;
        f.ledger
            .record(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap();

        let now = f.clock.now();
        let token = AccessToken {
            id: mint_id(),
            token_hash: "pair-access".to_string(),
            client_id: Some(f.client_id),
            user_id: Some(f.user_id),
            scope: scopes(&["openid"]),
            expires_at: now + Duration::seconds(900),
            revoked: false,
            auth_time: None,
            code_id: None,
            refresh_token_id: None,
            created_at: now,
        };
        f.store.insert_access_token(&token).await.unwrap();

        f.ledger.revoke(f.user_id, f.client_id).await.unwrap();

        assert!(!f
            .ledger
            .covers(f.user_id, f.client_id, &scopes(&["openid"]))
            .await
            .unwrap());
        let revoked = f
            .store
            .find_access_token_by_hash("pair-access")
            .await
            .unwrap()
            .unwrap();
        assert!(revoked.revoked);
    }
}
