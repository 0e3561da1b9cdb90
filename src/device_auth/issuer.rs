//! Seams to the rest of the system: who a granted user is, and what
//! credentials a device gets once its request is granted.

use super::error::DeviceAuthError;
use crate::jwks::JwksManager;
use crate::storage;
use async_trait::async_trait;
use base64ct::Encoding;
use josekit::jwt::JwtPayload;
use rand::RngCore;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub name: Option<String>,
    pub is_admin: bool,
}

/// Extra credential for clients speaking an older protocol (salted token pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryCredential {
    pub salt: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub token: String,
    pub secondary: Option<SecondaryCredential>,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` when the user no longer exists or may not sign in.
    async fn resolve(&self, user_id: &str) -> Result<Option<Identity>, DeviceAuthError>;
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, identity: &Identity) -> Result<IssuedCredentials, DeviceAuthError>;
}

/// Resolves identities from the `users` table.
#[derive(Clone)]
pub struct DbIdentityResolver {
    db: DatabaseConnection,
}

impl DbIdentityResolver {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityResolver for DbIdentityResolver {
    async fn resolve(&self, user_id: &str) -> Result<Option<Identity>, DeviceAuthError> {
        let user = storage::get_user_by_subject(&self.db, user_id)
            .await
            .map_err(|e| DeviceAuthError::Internal(format!("failed to load user: {e}")))?;

        Ok(user.filter(|u| u.enabled == 1).map(|u| Identity {
            id: u.subject,
            username: u.username,
            name: u.name,
            is_admin: u.is_admin == 1,
        }))
    }
}

/// Issues RS256 session tokens signed with the server key.
#[derive(Clone)]
pub struct JwtTokenIssuer {
    jwks: JwksManager,
    issuer: String,
    ttl_secs: i64,
}

impl JwtTokenIssuer {
    pub fn new(jwks: JwksManager, issuer: String, ttl_secs: i64) -> Self {
        Self {
            jwks,
            issuer,
            ttl_secs,
        }
    }

    fn payload(&self, identity: &Identity, now: SystemTime) -> JwtPayload {
        let mut payload = JwtPayload::new();
        payload.set_issuer(&self.issuer);
        payload.set_subject(&identity.id);
        payload.set_issued_at(&now);
        payload.set_expires_at(&(now + Duration::from_secs(self.ttl_secs.max(0) as u64)));
        payload.set_jwt_id(random_jti());
        let _ = payload.set_claim("username", Some(Value::String(identity.username.clone())));
        let _ = payload.set_claim("adm", Some(json!(identity.is_admin)));
        payload
    }
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    async fn issue(&self, identity: &Identity) -> Result<IssuedCredentials, DeviceAuthError> {
        let payload = self.payload(identity, SystemTime::now());
        let token = self
            .jwks
            .sign(&payload)
            .map_err(|e| DeviceAuthError::Internal(format!("failed to sign session token: {e}")))?;

        Ok(IssuedCredentials {
            token,
            secondary: None,
        })
    }
}

fn random_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Keys;
    use josekit::jws::RS256;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jwt_issuer_binds_token_to_identity() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let keys = Keys {
            jwks_path: temp_dir.path().join("jwks.json"),
            key_id: Some("test-key".to_string()),
            alg: "RS256".to_string(),
            private_key_path: temp_dir.path().join("private.json"),
        };
        let jwks = JwksManager::new(keys).await.expect("Failed to init keys");
        let issuer = JwtTokenIssuer::new(jwks.clone(), "https://tv.example.com".into(), 3600);

        let identity = Identity {
            id: "user-42".to_string(),
            username: "alice".to_string(),
            name: Some("Alice".to_string()),
            is_admin: true,
        };
        let issued = issuer.issue(&identity).await.expect("Failed to issue");
        assert!(issued.secondary.is_none());

        let public = jwks.private_jwk().to_public_key().unwrap();
        let verifier = RS256.verifier_from_jwk(&public).unwrap();
        let (payload, _header) =
            josekit::jwt::decode_with_verifier(&issued.token, &verifier).expect("Bad signature");

        assert_eq!(payload.subject(), Some("user-42"));
        assert_eq!(payload.issuer(), Some("https://tv.example.com"));
        assert_eq!(payload.claim("username"), Some(&json!("alice")));
        assert_eq!(payload.claim("adm"), Some(&json!(true)));
        assert!(payload.expires_at().is_some());
    }
}
