//! Identity verification for anonymized submissions.
//!
//! A client proves that anonymized id `U` belongs to its account by sending
//! `hex(sha256(R || decimal(U)))`, where `R` is the real identity known to the
//! identity provider. The real identity never leaves this module.

pub mod provider;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub use provider::{HeaderProvider, IdentityProvider, OAuthProvider, Provider};

/// Authentication failures. Neither variant carries identity material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The caller has no verifiable real identity.
    #[error("not authenticated: {reason}")]
    Unauthenticated { reason: String },

    /// The caller is authenticated but the proof does not match.
    #[error("hash mismatch, authentication failure")]
    Forbidden,
}

impl AuthError {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden => "forbidden",
        }
    }
}

/// Claimed anonymized identity and its proof, as taken from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: i64,
    pub hash: String,
}

/// Computes the hex-encoded proof for `real_identity` and `user_id`.
pub fn expected_hash(real_identity: &str, user_id: i64) -> String {
    hex::encode(digest(real_identity, user_id))
}

/// Checks the claimed proof against the real identity.
///
/// Hex digits decode case-insensitively. Digests compare in constant time.
pub fn verify(info: &UserInfo, real_identity: &str) -> Result<(), AuthError> {
    let claimed = hex::decode(&info.hash).map_err(|_| AuthError::Forbidden)?;
    let expected = digest(real_identity, info.user_id);

    if bool::from(expected.as_slice().ct_eq(&claimed)) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

fn digest(real_identity: &str, user_id: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(real_identity.as_bytes());
    hasher.update(user_id.to_string().as_bytes());
    hasher.finalize().into()
}

/// Resolves the caller's real identity through `provider` and verifies the proof.
pub async fn authenticate_against<P: IdentityProvider>(
    provider: &P,
    headers: &HeaderMap,
    info: &UserInfo,
) -> Result<(), AuthError> {
    let real_identity = provider.current_identity(headers).await?;
    verify(info, &real_identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const ALICE_42: &str = "c7ba6cc5563f2eca684021bd6748dd3e71f072a633d3e28d321f9347e2ecb41d";

    #[test]
    fn test_expected_hash_known_vectors() {
        assert_eq!(expected_hash("alice@example.com", 42), ALICE_42);
        assert_eq!(
            expected_hash("bob@example.com", 523523),
            "939be72defc48f3ea321880e37156059c7331895a6cf5a515a00adbd7ee01eb4"
        );
    }

    #[test]
    fn test_verify_accepts_matching_proof() {
        let info = UserInfo {
            user_id: 42,
            hash: ALICE_42.to_string(),
        };
        assert_eq!(verify(&info, "alice@example.com"), Ok(()));
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let info = UserInfo {
            user_id: 42,
            hash: ALICE_42.to_ascii_uppercase(),
        };
        assert_eq!(verify(&info, "alice@example.com"), Ok(()));
    }

    #[test]
    fn test_verify_accepts_mixed_case_proof() {
        let mixed: String = ALICE_42
            .chars()
            .enumerate()
            .map(|(i, c)| if i % 2 == 0 { c.to_ascii_uppercase() } else { c })
            .collect();
        let info = UserInfo {
            user_id: 42,
            hash: mixed,
        };
        assert_eq!(verify(&info, "alice@example.com"), Ok(()));
    }

    #[test]
    fn test_verify_rejects_other_identity() {
        let info = UserInfo {
            user_id: 42,
            hash: ALICE_42.to_string(),
        };
        assert_eq!(verify(&info, "mallory@example.com"), Err(AuthError::Forbidden));
    }

    #[test]
    fn test_verify_rejects_other_user_id() {
        let info = UserInfo {
            user_id: 43,
            hash: ALICE_42.to_string(),
        };
        assert_eq!(verify(&info, "alice@example.com"), Err(AuthError::Forbidden));
    }

    #[test]
    fn test_verify_rejects_truncated_and_empty_proof() {
        let extended = format!("{ALICE_42}00");
        for hash in ["", &ALICE_42[..63], &ALICE_42[..62], "not-hex", extended.as_str()] {
            let info = UserInfo {
                user_id: 42,
                hash: hash.to_string(),
            };
            assert_eq!(verify(&info, "alice@example.com"), Err(AuthError::Forbidden));
        }
    }

    #[tokio::test]
    async fn test_authenticate_against_header_provider() {
        let provider = HeaderProvider::new("X-Authenticated-User");
        let info = UserInfo {
            user_id: 42,
            hash: ALICE_42.to_string(),
        };

        let mut headers = HeaderMap::new();
        let missing = authenticate_against(&provider, &headers, &info).await;
        assert!(matches!(missing, Err(AuthError::Unauthenticated { .. })));

        headers.insert(
            "x-authenticated-user",
            HeaderValue::from_static("alice@example.com"),
        );
        assert_eq!(authenticate_against(&provider, &headers, &info).await, Ok(()));

        headers.insert(
            "x-authenticated-user",
            HeaderValue::from_static("eve@example.com"),
        );
        assert_eq!(
            authenticate_against(&provider, &headers, &info).await,
            Err(AuthError::Forbidden)
        );
    }

    #[test]
    fn test_error_labels() {
        assert_eq!(AuthError::Forbidden.label(), "forbidden");
        assert_eq!(
            AuthError::Unauthenticated {
                reason: "no token".into()
            }
            .label(),
            "unauthenticated"
        );
    }
}
