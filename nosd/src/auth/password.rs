//! Password hashing and verification using Argon2
//!
//! Parameters are pinned so every stored hash carries the same cost
//! profile; verification is constant-time inside the argon2 crate.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use nos_common::{Error, Result};
use subtle::ConstantTimeEq;

/// Memory cost in KiB (64 MiB).
const M_COST: u32 = 64 * 1024;
const T_COST: u32 = 1;
const P_COST: u32 = 4;
const OUTPUT_LEN: usize = 32;

fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(M_COST, T_COST, P_COST, Some(OUTPUT_LEN))
        .map_err(|e| Error::Internal(format!("argon2 params: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password with the pinned Argon2id parameters.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash.
///
/// `plain:<pw>` / `dev:<pw>` are development-only seed formats and must
/// never appear in production data. Anything else must be a well-formed
/// PHC string with at least six `$`-delimited segments.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    if let Some(plain) = stored.strip_prefix("plain:").or_else(|| stored.strip_prefix("dev:")) {
        return Ok(plain.as_bytes().ct_eq(password.as_bytes()).into());
    }

    if stored.split('$').count() < 6 {
        return Ok(false);
    }

    let parsed = match PasswordHash::new(stored) {
        Ok(p) => p,
        Err(_) => return Ok(false),
    };

    Ok(hasher()?
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
