//! Device secrets and signed access tokens.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Fresh device secret: 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Argon2id PHC string for a device secret.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("failed to hash device secret: {e}"))
}

pub fn verify_secret(secret: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored secret hash is not a valid PHC string: {}", e);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Device,
    Operator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Device id for device tokens, user id for operator tokens.
    pub sub: String,
    pub org: String,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signer/verifier shared by the device and operator extractors.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    device_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, device_ttl_days: i64) -> Self {
        TokenIssuer {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            device_ttl: Duration::days(device_ttl_days),
        }
    }

    pub fn device_ttl(&self) -> Duration {
        self.device_ttl
    }

    pub fn issue_device_token(&self, device_id: &str, organization_id: &str) -> Result<String> {
        self.issue(TokenType::Device, device_id, organization_id, self.device_ttl)
    }

    /// Operator tokens normally come from the user service that shares this
    /// secret; minting them here serves tooling and tests.
    pub fn issue_operator_token(
        &self,
        user_id: &str,
        organization_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        self.issue(TokenType::Operator, user_id, organization_id, ttl)
    }

    fn issue(&self, typ: TokenType, sub: &str, org: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            org: org.to_string(),
            typ,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}
