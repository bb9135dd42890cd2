//! Signed, time-bounded credentials embedded in mutation jobs.
//!
//! A job can run hours after it was scheduled, in a worker process with no
//! interactive session, so the platform session token travels inside the
//! job. It is wrapped as `<payload>.<signature>` where the payload is the
//! base64url JSON `{"tok": <platform token>, "exp": <unix seconds>}` and the
//! signature is the hex HMAC-SHA256 of the payload under the job secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// How long an issued credential stays valid.
pub const CREDENTIAL_TTL_HOURS: i64 = 72;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("job credential is missing")]
    Missing,
    #[error("job credential is malformed: {0}")]
    Malformed(String),
    #[error("job credential signature does not match")]
    BadSignature,
    #[error("job credential expired at {0}")]
    Expired(DateTime<Utc>),
}

#[derive(Serialize, Deserialize)]
struct Claims {
    tok: String,
    exp: i64,
}

#[derive(Clone)]
pub struct CredentialIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl: Duration::hours(CREDENTIAL_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub fn issue(&self, platform_token: &str, now: DateTime<Utc>) -> String {
        let claims = Claims {
            tok: platform_token.to_string(),
            exp: (now + self.ttl).timestamp(),
        };
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }

    /// Verify `credential` and return the platform token inside it.
    pub fn decode(&self, credential: &str, now: DateTime<Utc>) -> Result<String, CredentialError> {
        if credential.trim().is_empty() {
            return Err(CredentialError::Missing);
        }
        let (payload, signature) = credential
            .split_once('.')
            .ok_or_else(|| CredentialError::Malformed("missing signature".to_string()))?;
        let signature = hex::decode(signature)
            .map_err(|e| CredentialError::Malformed(format!("signature: {}", e)))?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| CredentialError::Malformed(format!("payload: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&json)
            .map_err(|e| CredentialError::Malformed(format!("claims: {}", e)))?;

        let expires = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| CredentialError::Malformed("expiry out of range".to_string()))?;
        if now >= expires {
            return Err(CredentialError::Expired(expires));
        }
        Ok(claims.tok)
    }
}
