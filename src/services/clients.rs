//! Client registry: lookup, authentication, and request validation.
//!
//! Credentials arrive in one of three shapes: an HTTP Basic header, form
//! fields, or a signed JWT client assertion. Secrets are compared through
//! the password-hash verify; nothing here ever returns a secret.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::models::Client;
use crate::storage::Store;
use crate::utils::secret::verify_client_secret;

/// The only accepted `client_assertion_type`.
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Client credentials as extracted from the request by the orchestrator
/// (Basic header already decoded into the id/secret pair).
#[derive(Debug, Clone, Default)]
pub struct ClientCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

/// Claims of a `jwt-bearer` client assertion, RFC 7523.
#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
}

pub struct ClientRegistry {
    store: Arc<dyn Store>,
    issuer: String,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn Store>, issuer: &str) -> Self {
        Self {
            store,
            issuer: issuer.to_string(),
        }
    }

    /// Look a client up by its public identifier.
    pub async fn find(&self, client_id: &str) -> Result<Client, ClientError> {
        self.store
            .find_client_by_client_id(client_id)
            .await?
            .ok_or(ClientError::Unknown)
    }

    /// Authenticate a client from the credentials on a token-endpoint
    /// request.
    ///
    /// A public client authenticates by `client_id` presence alone; the
    /// grant path is responsible for requiring PKCE from it.
    pub async fn authenticate(&self, credentials: &ClientCredentials) -> Result<Client, ClientError> {
        if let Some(assertion) = credentials.client_assertion.as_deref() {
            let assertion_type = credentials.client_assertion_type.as_deref().unwrap_or("");
            if assertion_type != CLIENT_ASSERTION_TYPE_JWT_BEARER {
                return Err(ClientError::AuthFailed);
            }
            return self.authenticate_assertion(assertion).await;
        }

        let client_id = credentials
            .client_id
            .as_deref()
            .ok_or(ClientError::AuthFailed)?;
        let client = self.find(client_id).await?;

        match credentials.client_secret.as_deref() {
            Some(secret) => {
                let hash = client
                    .client_secret_hash
                    .as_deref()
                    .ok_or(ClientError::AuthFailed)?;
                let valid =
                    verify_client_secret(secret, hash).map_err(|_| ClientError::AuthFailed)?;
                if !valid {
                    return Err(ClientError::AuthFailed);
                }
                Ok(client)
            }
            None => {
                if client.is_public() {
                    Ok(client)
                } else {
                    Err(ClientError::AuthFailed)
                }
            }
        }
    }

    /// Verify a `jwt-bearer` assertion against the client's registered
    /// assertion key: `iss == sub == client_id`, `aud` is this issuer,
    /// `exp` enforced.
    async fn authenticate_assertion(&self, assertion: &str) -> Result<Client, ClientError> {
        // First pass without the key, only to learn which client claims to
        // be speaking. Nothing from this pass is trusted.
        let mut peek = Validation::new(Algorithm::HS256);
        peek.insecure_disable_signature_validation();
        peek.validate_aud = false;
        peek.validate_exp = false;
        let unverified = decode::<AssertionClaims>(assertion, &DecodingKey::from_secret(&[]), &peek)
            .map_err(|_| ClientError::AuthFailed)?;

        let client = self.find(&unverified.claims.sub).await?;
        let key = client.assertion_key.as_deref().ok_or(ClientError::AuthFailed)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.issuer.clone()]);
        validation.validate_exp = true;
        let verified = decode::<AssertionClaims>(
            assertion,
            &DecodingKey::from_secret(key.as_bytes()),
            &validation,
        )
        .map_err(|_| ClientError::AuthFailed)?;

        if verified.claims.iss != verified.claims.sub || verified.claims.sub != client.client_id {
            return Err(ClientError::AuthFailed);
        }

        Ok(client)
    }

    /// Exact-string redirect URI check; no normalisation of any kind.
    pub fn validate_redirect_uri(&self, client: &Client, uri: &str) -> bool {
        client.has_redirect_uri(uri)
    }

    pub fn validate_grant_type(&self, client: &Client, grant_type: &str) -> bool {
        client.allows_grant_type(grant_type)
    }
}
