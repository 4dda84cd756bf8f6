//! Authentication for the ingestion endpoint and webhook payload signing
//!
//! Token checks fail closed: a missing header, malformed header, unknown
//! user, or mismatched token is always a rejection. Comparisons run in
//! constant time so a prefix-matching token leaks nothing. Tokens are
//! generated outside this process and stored in the user profile.

use crate::config::{UserConfigStore, UserProfile};
use crate::error::DispatchError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

//
// ================= Token Guard =================
//

/// Why an ingestion request was rejected, with the HTTP status to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingUserHeader,
    MissingAuthHeader,
    MalformedAuthHeader,
    UnknownUser,
    InvalidToken,
}

impl AuthFailure {
    pub fn status(&self) -> u16 {
        match self {
            AuthFailure::MissingUserHeader
            | AuthFailure::MissingAuthHeader
            | AuthFailure::MalformedAuthHeader => 401,
            AuthFailure::UnknownUser => 404,
            AuthFailure::InvalidToken => 403,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::MissingUserHeader => "X-User-ID header is required",
            AuthFailure::MissingAuthHeader => "Authorization header is required",
            AuthFailure::MalformedAuthHeader => {
                "Invalid Authorization header format. Expected: Bearer <token>"
            }
            AuthFailure::UnknownUser => "Unknown user",
            AuthFailure::InvalidToken => "Invalid API token",
        }
    }
}

impl From<AuthFailure> for DispatchError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::UnknownUser => DispatchError::Config(failure.message().to_string()),
            _ => DispatchError::Auth(failure.message().to_string()),
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") || parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// Validate `(X-User-ID, Authorization)` for the ingestion endpoint and
/// return the authenticated profile.
pub fn authenticate(
    store: &UserConfigStore,
    user_id: Option<&str>,
    authorization: Option<&str>,
) -> std::result::Result<UserProfile, AuthFailure> {
    let user_id = user_id
        .filter(|v| !v.trim().is_empty())
        .ok_or(AuthFailure::MissingUserHeader)?;
    let authorization = authorization.ok_or(AuthFailure::MissingAuthHeader)?;
    let token = extract_bearer_token(authorization).ok_or(AuthFailure::MalformedAuthHeader)?;

    let profile = store.load(user_id).map_err(|_| AuthFailure::UnknownUser)?;

    let expected = profile.api_token.as_deref().unwrap_or("");
    if expected.is_empty() || !constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        return Err(AuthFailure::InvalidToken);
    }

    Ok(profile)
}

/// SHA-256 digest of a token, the form operator tooling stores and logs.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//
// ================= Payload Signatures =================
//

/// Hex HMAC-SHA256 over `"{timestamp}." + payload`.
pub fn compute_signature(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Build the `Signature` header value: `t=<timestamp>,v1=<hex>`.
pub fn sign_payload(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload))
}

/// Verify a `Signature: t=...,v1=...` header against any of the given
/// secrets (primary plus rotation).
pub fn verify_signature(header: &str, payload: &[u8], secrets: &[&str]) -> bool {
    let mut timestamp = None;
    let mut received = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => received = Some(value),
            _ => {}
        }
    }
    let (Some(timestamp), Some(received)) = (timestamp, received) else {
        return false;
    };

    secrets.iter().any(|secret| {
        let expected = compute_signature(secret, timestamp, payload);
        constant_time_eq(expected.as_bytes(), received.as_bytes())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "ledger": { "access_token": "ledger-token" },
        "notification": { "webhook_url": "https://x", "webhook_secret": "s" },
        "api_token": "correct-horse"
    }"#;

    fn store_with_user(dir: &tempfile::TempDir) -> UserConfigStore {
        std::fs::write(dir.path().join("dad.json"), PROFILE).unwrap();
        UserConfigStore::new(dir.path())
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer"), None);
        assert_eq!(extract_bearer_token("Bearer a b"), None);
        assert_eq!(extract_bearer_token(""), None);
    }

    #[test]
    fn test_fail_closed_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_user(&dir);

        assert_eq!(
            authenticate(&store, None, Some("Bearer correct-horse")).unwrap_err(),
            AuthFailure::MissingUserHeader
        );
        assert_eq!(
            authenticate(&store, Some("dad"), None).unwrap_err(),
            AuthFailure::MissingAuthHeader
        );
        assert_eq!(
            authenticate(&store, Some("dad"), Some("correct-horse")).unwrap_err(),
            AuthFailure::MalformedAuthHeader
        );
        assert_eq!(
            authenticate(&store, Some("ghost"), Some("Bearer correct-horse")).unwrap_err(),
            AuthFailure::UnknownUser
        );
        assert_eq!(
            authenticate(&store, Some("dad"), Some("Bearer wrong")).unwrap_err(),
            AuthFailure::InvalidToken
        );

        let profile = authenticate(&store, Some("dad"), Some("Bearer correct-horse")).unwrap();
        assert_eq!(profile.user_id, "dad");
    }

    #[test]
    fn test_user_without_token_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mom.json"),
            r#"{
                "ledger": { "access_token": "t" },
                "notification": { "webhook_url": "https://x", "webhook_secret": "s" }
            }"#,
        )
        .unwrap();
        let store = UserConfigStore::new(dir.path());

        assert_eq!(
            authenticate(&store, Some("mom"), Some("Bearer anything")).unwrap_err(),
            AuthFailure::InvalidToken
        );
        // An empty provided token must not match an absent stored token
        assert_eq!(
            authenticate(&store, Some("mom"), Some("Bearer ")).unwrap_err(),
            AuthFailure::MalformedAuthHeader
        );
    }

    #[test]
    fn test_signature_round_trip() {
        let payload = br#"{"trigger":"STORE_TRANSACTION"}"#;
        let header = sign_payload("s3cret", "1719400000", payload);

        assert!(verify_signature(&header, payload, &["s3cret"]));
        // Rotation: either secret verifies
        assert!(verify_signature(&header, payload, &["new-secret", "s3cret"]));
        assert!(!verify_signature(&header, payload, &["other"]));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let payload = br#"{"amount":"10"}"#;
        let header = sign_payload("s3cret", "1719400000", payload);

        assert!(!verify_signature(&header, br#"{"amount":"99"}"#, &["s3cret"]));
        assert!(!verify_signature("t=1719400000", payload, &["s3cret"]));
        assert!(!verify_signature("v1=deadbeef", payload, &["s3cret"]));
        assert!(!verify_signature("", payload, &["s3cret"]));
        // Replayed signature under a different timestamp
        let forged = format!("t=999,v1={}", compute_signature("s3cret", "1719400000", payload));
        assert!(!verify_signature(&forged, payload, &["s3cret"]));
    }

    #[test]
    fn test_token_digest_is_stable_hex() {
        let digest = hash_token("correct-horse");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_token("correct-horse"));
        assert_ne!(digest, hash_token("correct-horsf"));
    }
}
