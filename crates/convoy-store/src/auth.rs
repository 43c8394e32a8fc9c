//! Password hashing for orchestrator user records.
//!
//! New hashes use argon2id in PHC string format. Earlier releases stored
//! `salt_hex$sha256_hex`; those still verify, and callers rehash them on the
//! next successful login so the upgrade happens progressively.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Hash a password with argon2id.
///
/// # Errors
///
/// Returns an error if the hasher rejects its inputs.
pub fn hash_password(password: &str) -> StoreResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| StoreError::PasswordHash {
            detail: err.to_string(),
        })?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash, accepting both the argon2id PHC
/// format and the legacy `salt_hex$sha256_hex` format.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with("$argon2") {
        return PasswordHash::new(stored)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);
    }
    verify_legacy_sha256(password, stored)
}

/// Whether a stored hash predates argon2id and should be rewritten after the
/// next successful verification.
#[must_use]
pub fn needs_rehash(stored: &str) -> bool {
    !stored.starts_with("$argon2")
}

fn verify_legacy_sha256(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    let computed = hex_encode(&digest);
    constant_time_eq(computed.as_bytes(), expected.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_round_trip() {
        let hash = hash_password("hunter2").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!needs_rehash(&hash));
    }

    #[test]
    fn legacy_sha256_still_verifies() {
        let salt = "deadbeef";
        let mut hasher = Sha256::new();
        hasher.update(b"hunter2");
        hasher.update(salt.as_bytes());
        let stored = format!("{salt}${}", hex_encode(&hasher.finalize()));

        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert!(needs_rehash(&stored));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_password("x", "not-a-hash"));
        assert!(!verify_password("x", "$argon2id$garbage"));
        assert!(!verify_password("x", ""));
    }
}
