//! Password hashing for the Users/Auth persistence service.
//!
//! Uses PBKDF2-HMAC-SHA256 (via `ring`) with a random per-password salt.
//! Derived key material is zeroed from memory when dropped using the
//! `zeroize` crate.

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::error::Error as StdError;
use std::fmt;
use std::num::NonZeroU32;
use zeroize::Zeroize;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const ITERATIONS: u32 = 100_000;

#[derive(Debug)]
pub enum AuthError {
    RandomGeneration,
    InvalidFormat(String),
    TooShort,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::RandomGeneration => write!(f, "failed to generate random bytes"),
            AuthError::InvalidFormat(msg) => write!(f, "invalid hash format: {}", msg),
            AuthError::TooShort => write!(f, "password must be at least 6 characters"),
        }
    }
}

impl StdError for AuthError {}

/// Derived password hash, zeroed on drop.
struct DerivedKey([u8; HASH_LEN]);

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Hash a plaintext password into the storable form `pbkdf2$<iterations>$<salt_hex>$<hash_hex>`.
///
/// The root CLI bootstrap and `Users::add_user` both require passwords of at
/// least 6 characters, confirmed twice at the CLI.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    if password.len() < 6 {
        return Err(AuthError::TooShort);
    }
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| AuthError::RandomGeneration)?;

    let mut derived = DerivedKey([0u8; HASH_LEN]);
    let iterations = NonZeroU32::new(ITERATIONS).expect("iterations is nonzero");
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut derived.0,
    );

    Ok(format!(
        "pbkdf2${}${}${}",
        ITERATIONS,
        hex_encode(&salt),
        hex_encode(&derived.0)
    ))
}

/// Verify a plaintext password against a stored hash produced by [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != "pbkdf2" {
        return Err(AuthError::InvalidFormat(stored.to_string()));
    }
    let iterations: u32 = parts[1]
        .parse()
        .map_err(|_| AuthError::InvalidFormat("iterations".into()))?;
    let salt = hex_decode(parts[2]).map_err(|_| AuthError::InvalidFormat("salt".into()))?;
    let expected = hex_decode(parts[3]).map_err(|_| AuthError::InvalidFormat("hash".into()))?;
    if expected.len() != HASH_LEN {
        return Err(AuthError::InvalidFormat("hash length".into()));
    }

    let iterations = NonZeroU32::new(iterations).ok_or(AuthError::InvalidFormat("iterations".into()))?;
    let verified = pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &expected,
    );
    Ok(verified.is_ok())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("wrong password", &hash).unwrap());
    }

    #[test]
    fn hashes_differ_due_to_salt() {
        let h1 = hash_password("same-password").unwrap();
        let h2 = hash_password("same-password").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password("same-password", &h1).unwrap());
        assert!(verify_password("same-password", &h2).unwrap());
    }

    #[test]
    fn rejects_too_short_password() {
        assert!(matches!(hash_password("abc"), Err(AuthError::TooShort)));
    }

    #[test]
    fn rejects_malformed_stored_hash() {
        assert!(verify_password("x", "not-a-hash").is_err());
    }
}
