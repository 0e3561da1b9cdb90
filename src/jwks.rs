use crate::errors::AppError;
use crate::settings::Keys;
use base64ct::Encoding;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, RS256};
use josekit::jwt;
use josekit::jwt::JwtPayload;
use rand::RngCore;
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;

/// Signing key for device session tokens, persisted on first start.
#[derive(Clone)]
pub struct JwksManager {
    public_jwks_value: Arc<Value>,
    private_jwk: Arc<Jwk>,
}

impl JwksManager {
    pub async fn new(cfg: Keys) -> Result<Self, AppError> {
        if cfg.alg != "RS256" {
            return Err(AppError::Jose(format!(
                "unsupported signing algorithm {}, only RS256 is available",
                cfg.alg
            )));
        }

        if let Some(parent) = cfg.jwks_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = cfg.private_key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let private_jwk = if cfg.private_key_path.exists() {
            let s = fs::read_to_string(&cfg.private_key_path)?;
            serde_json::from_str::<Jwk>(&s)?
        } else {
            let mut jwk = Jwk::generate_rsa_key(2048)?;
            let kid = cfg.key_id.clone().unwrap_or_else(random_kid);
            jwk.set_key_id(&kid);
            jwk.set_algorithm(cfg.alg.as_str());
            jwk.set_key_use("sig");
            fs::write(&cfg.private_key_path, serde_json::to_string_pretty(&jwk)?)?;
            tracing::info!(kid = %kid, "Generated new signing key");
            jwk
        };

        // Public set is always rebuilt from the private key so it cannot drift
        let public_jwks_value = json!({ "keys": [public_jwk(&private_jwk)?] });
        fs::write(
            &cfg.jwks_path,
            serde_json::to_string_pretty(&public_jwks_value)?,
        )?;

        Ok(Self {
            public_jwks_value: Arc::new(public_jwks_value),
            private_jwk: Arc::new(private_jwk),
        })
    }

    pub fn jwks_json(&self) -> Value {
        (*self.public_jwks_value).clone()
    }

    pub fn private_jwk(&self) -> Jwk {
        (*self.private_jwk).clone()
    }

    pub fn sign(&self, payload: &JwtPayload) -> Result<String, AppError> {
        let signer = RS256.signer_from_jwk(&self.private_jwk)?;
        let mut header = JwsHeader::new();
        if let Some(kid) = self.private_jwk.key_id() {
            header.set_key_id(kid);
        }
        header.set_algorithm("RS256");
        header.set_token_type("JWT");
        Ok(jwt::encode_with_signer(payload, &header, &signer)?)
    }
}

/// `to_public_key` keeps only the key material, so `kid`, `alg` and `use`
/// are copied over for verifiers that select keys by id.
fn public_jwk(private_jwk: &Jwk) -> Result<Value, AppError> {
    let mut public = private_jwk.to_public_key()?;
    if let Some(kid) = private_jwk.key_id() {
        public.set_key_id(kid);
    }
    if let Some(alg) = private_jwk.algorithm() {
        public.set_algorithm(alg);
    }
    if let Some(key_use) = private_jwk.key_use() {
        public.set_key_use(key_use);
    }
    Ok(serde_json::to_value(public)?)
}

fn random_kid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
