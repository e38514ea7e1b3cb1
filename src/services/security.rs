//! Authorization, report signing and audit: the security collaborators the
//! controller consults without interpreting.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::models::job::{AuthContext, JobId};

const NONCE_LEN: usize = 12;

pub const RESOURCE_JOBS: &str = "jobs";
pub const ACTION_SUBMIT: &str = "submit";
pub const ACTION_CANCEL: &str = "cancel";
pub const RESOURCE_SYSTEM: &str = "system";
pub const ACTION_ADMIN: &str = "admin";

pub trait AuthorizationCheck: Send + Sync {
    fn authorize(&self, context: &AuthContext, resource: &str, action: &str) -> bool;
}

/// Grants everything. Used when no JWT secret is configured.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

impl AuthorizationCheck for AllowAll {
    fn authorize(&self, _context: &AuthContext, _resource: &str, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Claims {
    fn permits(&self, resource: &str, action: &str) -> bool {
        self.permissions.iter().any(|p| {
            p == "*" || *p == format!("{resource}:{action}") || *p == format!("{resource}:*")
        })
    }
}

/// Checks the bearer token in the [`AuthContext`] as an HS256 JWT carrying a
/// `permissions` claim of `resource:action` grants.
pub struct JwtAuthorizer {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl AuthorizationCheck for JwtAuthorizer {
    fn authorize(&self, context: &AuthContext, resource: &str, action: &str) -> bool {
        let Some(token) = context.token.as_deref() else {
            return false;
        };
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims.permits(resource, action),
            Err(e) => {
                tracing::debug!(subject = %context.subject, error = %e, "Token rejected");
                false
            }
        }
    }
}

pub trait SecuritySigner: Send + Sync {
    /// Signature over `payload`, or `None` when signing is disabled.
    fn sign(&self, payload: &[u8], context: &AuthContext) -> Result<Option<String>, SignError>;
}

#[derive(Debug, Clone, Default)]
pub struct UnsignedSigner;

impl SecuritySigner for UnsignedSigner {
    fn sign(&self, _payload: &[u8], _context: &AuthContext) -> Result<Option<String>, SignError> {
        Ok(None)
    }
}

/// AES-256-GCM used as a MAC: the payload is authenticated as associated data
/// with an empty message. Output is base64 of nonce (12 bytes) followed by the tag.
pub struct GcmSigner {
    cipher: Aes256Gcm,
}

impl GcmSigner {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, SignError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| SignError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(SignError::InvalidKey);
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| SignError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(signature) else {
            return false;
        };
        if raw.len() <= NONCE_LEN {
            return false;
        }
        let (nonce_bytes, tag) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: tag, aad: payload })
            .is_ok()
    }
}

impl SecuritySigner for GcmSigner {
    fn sign(&self, payload: &[u8], _context: &AuthContext) -> Result<Option<String>, SignError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let tag = self
            .cipher
            .encrypt(&nonce, Payload { msg: &[], aad: payload })
            .map_err(|_| SignError::SignFailed)?;

        let mut output = nonce.to_vec();
        output.extend(tag);
        Ok(Some(base64::engine::general_purpose::STANDARD.encode(output)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("Invalid signing key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Signing failed")]
    SignFailed,

    #[error("Report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle facts handed to the [`AuditSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Admitted { job_id: JobId, subject: String, priority: u8 },
    Rejected { subject: String, reason: String },
    Started { job_id: JobId },
    Completed { job_id: JobId, success: bool, iterations: u32 },
    Failed { job_id: JobId, reason: String },
    Cancelled { job_id: JobId },
    TimedOut { job_id: JobId },
    Shutdown { emergency: bool, cancelled_jobs: usize },
}

/// Fire-and-forget event recorder. Implementations must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as a structured `tracing` event on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "audit", event = %json),
            Err(e) => tracing::warn!(target: "audit", error = %e, "Unserializable audit event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn token(secret: &str, permissions: &[&str]) -> String {
        let claims = Claims {
            sub: "operator".into(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_jwt_permissions() {
        let auth = JwtAuthorizer::new("secret");
        let ctx = AuthContext::with_token("operator", token("secret", &["jobs:submit"]));
        assert!(auth.authorize(&ctx, RESOURCE_JOBS, ACTION_SUBMIT));
        assert!(!auth.authorize(&ctx, RESOURCE_JOBS, ACTION_CANCEL));

        let wildcard = AuthContext::with_token("operator", token("secret", &["jobs:*"]));
        assert!(auth.authorize(&wildcard, RESOURCE_JOBS, ACTION_CANCEL));
        assert!(!auth.authorize(&wildcard, RESOURCE_SYSTEM, ACTION_ADMIN));
    }

    #[test]
    fn test_jwt_rejects_bad_tokens() {
        let auth = JwtAuthorizer::new("secret");
        assert!(!auth.authorize(&AuthContext::new("anon"), RESOURCE_JOBS, ACTION_SUBMIT));
        let forged = AuthContext::with_token("operator", token("other", &["*"]));
        assert!(!auth.authorize(&forged, RESOURCE_JOBS, ACTION_SUBMIT));
    }

    #[test]
    fn test_gcm_sign_verify() {
        let signer = GcmSigner::new(KEY).unwrap();
        let sig = signer.sign(b"report body", &AuthContext::default()).unwrap().unwrap();
        assert!(signer.verify(b"report body", &sig));
        assert!(!signer.verify(b"tampered body", &sig));
        assert!(!signer.verify(b"report body", "not base64!"));
    }

    #[test]
    fn test_gcm_rejects_short_key() {
        assert!(matches!(GcmSigner::new("c2hvcnQ="), Err(SignError::InvalidKey)));
    }

    #[test]
    fn test_audit_event_json() {
        let json = serde_json::to_value(AuditEvent::Shutdown {
            emergency: true,
            cancelled_jobs: 7,
        })
        .unwrap();
        assert_eq!(json["event"], "shutdown");
        assert_eq!(json["cancelled_jobs"], 7);
    }
}
