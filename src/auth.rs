//! Credential validation and hashing for the auth handshake.
//!
//! The broker does not mint credentials. API keys come from the product's
//! control plane and must match the `<appId>.<keyId>:<secret>` shape; access
//! tokens are JWTs minted by an external identity provider. Validation depth
//! is governed by [`JwtMode`]: `strict` enforces structure and expiry,
//! `permissive` only requires a parseable token (local development).
//!
//! The credential hash keys the resume check. It is a deterministic digest,
//! not a secret: equal credentials hash equally across processes and
//! restarts, and the hex output may appear in audit logs.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::JwtMode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("API key does not match <appId>.<keyId>:<secret>")]
    MalformedApiKey,

    #[error("access token is not a valid JWT: {0}")]
    MalformedToken(String),

    #[error("access token is expired")]
    ExpiredToken,
}

/// Credentials presented in the first WebSocket frame.
///
/// Both components are optional; a connection with a non-empty access token
/// is accounted in the authenticated bucket, everything else is anonymous.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(api_key: Option<String>, access_token: Option<String>) -> Self {
        Self {
            api_key,
            access_token,
        }
    }

    /// Whether this connection counts against the authenticated bucket.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Validate whichever components are present.
    pub fn validate(&self, mode: JwtMode) -> Result<(), AuthError> {
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                validate_api_key_shape(key)?;
            }
        }
        if let Some(token) = self.access_token.as_deref() {
            if !token.is_empty() {
                validate_access_token(token, mode)?;
            }
        }
        Ok(())
    }

    /// The resume key for these credentials.
    pub fn hash(&self) -> String {
        hash_credentials(self.api_key.as_deref(), self.access_token.as_deref())
    }
}

/// Deterministic digest of (api key, access token) used to key resume.
///
/// Absent components and empty strings hash identically. The two components
/// are length-prefixed before hashing so no concatenation of one can
/// impersonate a split of the other.
pub fn hash_credentials(api_key: Option<&str>, access_token: Option<&str>) -> String {
    let key = api_key.unwrap_or("");
    let token = access_token.unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update((token.len() as u64).to_le_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time equality for credential hashes.
///
/// The hash is not confidential, but the comparison sits on the resume path
/// where an attacker controls one side, so it does not short-circuit.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Check the `<appId>.<keyId>:<secret>` shape. All three parts non-empty.
fn validate_api_key_shape(key: &str) -> Result<(), AuthError> {
    let (name, secret) = key.split_once(':').ok_or(AuthError::MalformedApiKey)?;
    let (app_id, key_id) = name.split_once('.').ok_or(AuthError::MalformedApiKey)?;
    if app_id.is_empty() || key_id.is_empty() || secret.is_empty() {
        return Err(AuthError::MalformedApiKey);
    }
    Ok(())
}

/// Validate an access token according to the configured mode.
///
/// The identity provider's keys are not available to the broker, so neither
/// mode verifies a signature; `strict` decodes the claims and enforces
/// structure plus `exp`, `permissive` only requires a decodable header.
fn validate_access_token(token: &str, mode: JwtMode) -> Result<(), AuthError> {
    match mode {
        JwtMode::Permissive => {
            let segments = token.split('.').count();
            if segments != 3 {
                return Err(AuthError::MalformedToken(format!(
                    "expected 3 segments, found {segments}"
                )));
            }
            jsonwebtoken::decode_header(token)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
            Ok(())
        }
        JwtMode::Strict => {
            let header = jsonwebtoken::decode_header(token)
                .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
            let mut validation = jsonwebtoken::Validation::new(header.alg);
            validation.insecure_disable_signature_validation();
            validation.validate_aud = false;
            // exp stays in required_spec_claims: a token that cannot expire
            // is rejected outright in strict mode.
            match jsonwebtoken::decode::<serde_json::Value>(
                token,
                &jsonwebtoken::DecodingKey::from_secret(&[]),
                &validation,
            ) {
                Ok(_) => Ok(()),
                Err(e) => match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        Err(AuthError::ExpiredToken)
                    }
                    _ => Err(AuthError::MalformedToken(e.to_string())),
                },
            }
        }
    }
}
