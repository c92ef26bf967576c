//! Bearer credential decoding.
//!
//! A credential is a three-segment `header.payload.signature` string whose
//! payload segment is base64url-encoded JSON. Only the payload is read and
//! the signature is never checked: the client does not hold the signing key,
//! so everything derived here is advisory. The server remains the only
//! authority on whether a credential is accepted.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns the current time as whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    (now_ms() / 1000) as i64
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected 3 dot-separated segments, found {found}")]
    Segments { found: usize },
    #[error("payload is not valid base64url: {message}")]
    Base64 { message: String },
    #[error("payload is not a JSON claim set: {message}")]
    Json { message: String },
    #[error("claim set has no exp")]
    MissingExpiry,
}

/// Claims carried in the credential payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: Option<String>,
    pub issued_at: Option<i64>,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

/// An opaque bearer credential as issued by the login endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token, for the `Authorization` header and storage.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the payload claims without verifying the signature.
    pub fn claims(&self) -> Result<Claims, DecodeError> {
        let segments: Vec<&str> = self.0.split('.').collect();
        if segments.len() != 3 {
            return Err(DecodeError::Segments {
                found: segments.len(),
            });
        }
        let payload = segments[1].trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| DecodeError::Base64 {
                message: e.to_string(),
            })?;
        let raw: RawClaims = serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json {
            message: e.to_string(),
        })?;
        let expires_at = raw.exp.ok_or(DecodeError::MissingExpiry)?;
        Ok(Claims {
            subject: raw.sub,
            issued_at: raw.iat,
            expires_at,
        })
    }

    /// Expiry in Unix seconds, or `None` when the credential cannot be decoded.
    pub fn expires_at(&self) -> Option<i64> {
        self.claims().ok().map(|c| c.expires_at)
    }

    /// Undecodable credentials count as expired.
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        match self.expires_at() {
            Some(exp) => exp <= now_secs,
            None => true,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }

    /// Time left until `exp`, or `None` once expired (or undecodable).
    pub fn remaining_at(&self, now_ms: u64) -> Option<Duration> {
        let exp_ms = u64::try_from(self.expires_at()?).ok()?.saturating_mul(1000);
        if exp_ms <= now_ms {
            return None;
        }
        Some(Duration::from_millis(exp_ms - now_ms))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

impl From<String> for Credential {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Build an unsigned credential around the given claims.
///
/// The signature segment is a placeholder, so the server will reject it. Used
/// by tests and local tooling that only exercise client-side expiry handling.
pub fn encode_unsigned(claims: &serde_json::Value) -> Credential {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    Credential(format!("{header}.{payload}.sig"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_registered_claims() {
        let cred = encode_unsigned(&json!({"sub": "a@b.c", "iat": 100, "exp": 200}));
        let claims = cred.claims().unwrap();
        assert_eq!(claims.subject.as_deref(), Some("a@b.c"));
        assert_eq!(claims.issued_at, Some(100));
        assert_eq!(claims.expires_at, 200);
    }

    #[test]
    fn accepts_padded_payload() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"exp":42}"#);
        let cred = Credential::new(format!("{header}.{payload}.x"));
        assert_eq!(cred.expires_at(), Some(42));
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let cred = Credential::new("only.two");
        assert_eq!(cred.claims(), Err(DecodeError::Segments { found: 2 }));
        assert!(cred.is_expired());
    }

    #[test]
    fn rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        let cred = Credential::new(format!("h.{payload}.s"));
        assert!(matches!(cred.claims(), Err(DecodeError::Json { .. })));
        assert!(cred.is_expired());
    }

    #[test]
    fn rejects_bad_base64() {
        let cred = Credential::new("h.!!!.s");
        assert!(matches!(cred.claims(), Err(DecodeError::Base64 { .. })));
    }

    #[test]
    fn missing_exp_counts_as_expired() {
        let cred = encode_unsigned(&json!({"sub": "x"}));
        assert_eq!(cred.claims(), Err(DecodeError::MissingExpiry));
        assert!(cred.is_expired_at(0));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let cred = encode_unsigned(&json!({"exp": 1_000}));
        assert!(!cred.is_expired_at(999));
        assert!(cred.is_expired_at(1_000));
        assert!(cred.is_expired_at(1_001));
    }

    #[test]
    fn remaining_counts_down_in_millis() {
        let cred = encode_unsigned(&json!({"exp": 1_000}));
        assert_eq!(
            cred.remaining_at(999_500),
            Some(Duration::from_millis(500))
        );
        assert_eq!(cred.remaining_at(1_000_000), None);
    }

    #[test]
    fn debug_hides_raw_token() {
        let cred = Credential::new("secret.secret.secret");
        assert!(!format!("{cred:?}").contains("secret"));
    }
}
