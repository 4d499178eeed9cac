//! TOTP and recovery codes
//!
//! Standard 30-second, SHA-1, 6-digit TOTP. Verification tolerates one
//! step of clock drift in either direction; two or more steps out is a
//! rejection. Recovery codes are one-shot `XXXX-XXXX` hex credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// TOTP time step in seconds.
pub const TIME_STEP: u64 = 30;

/// Accepted drift in steps on either side of now.
const DRIFT_STEPS: i64 = 1;

/// Number of recovery codes issued per enrollment.
pub const RECOVERY_CODE_COUNT: usize = 10;

/// A one-shot recovery code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCode {
    pub code: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

/// A user's TOTP secret and recovery codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpSecret {
    pub secret: String,
    pub verified: bool,
    pub backup_codes: Vec<RecoveryCode>,
}

/// Generate a random base32 secret.
pub fn generate_secret() -> String {
    use rand::Rng;
    const BASE32_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let idx = rng.gen_range(0..BASE32_CHARS.len());
            BASE32_CHARS[idx] as char
        })
        .collect()
}

/// Generate a fresh recovery code set.
pub fn generate_recovery_codes() -> Vec<RecoveryCode> {
    use rand::RngCore;

    let now = Utc::now();
    (0..RECOVERY_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            let hex = hex::encode(bytes);
            RecoveryCode {
                code: format!("{}-{}", &hex[..4], &hex[4..]).to_uppercase(),
                created_at: now,
                used_at: None,
            }
        })
        .collect()
}

/// Provisioning URI for QR enrollment.
pub fn provisioning_uri(username: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/NOS:{}?secret={}&issuer=NOS&algorithm=SHA1&digits=6&period=30",
        username, secret
    )
}

/// Verify a TOTP code against the current time.
pub fn verify_totp(secret: &str, code: &str) -> bool {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    verify_totp_at(secret, code, now)
}

/// Verify a TOTP code at an explicit unix time (testable form).
pub fn verify_totp_at(secret: &str, code: &str, now_secs: u64) -> bool {
    let step = (now_secs / TIME_STEP) as i64;
    for offset in -DRIFT_STEPS..=DRIFT_STEPS {
        let candidate = match generate_totp(secret, (step + offset) as u64) {
            Some(c) => c,
            None => return false,
        };
        if candidate.as_bytes().ct_eq(code.as_bytes()).into() {
            return true;
        }
    }
    false
}

/// Generate the 6-digit code for a time step.
pub fn generate_totp(secret: &str, time_step: u64) -> Option<String> {
    let key = decode_base32(secret)?;
    let hmac = hmac_sha1(&key, &time_step.to_be_bytes());

    let offset = (hmac[hmac.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        hmac[offset] & 0x7f,
        hmac[offset + 1],
        hmac[offset + 2],
        hmac[offset + 3],
    ]) % 1_000_000;

    Some(format!("{:06}", code))
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    const BLOCK_SIZE: usize = 64;

    let mut key_padded = vec![0u8; BLOCK_SIZE];
    if key.len() <= BLOCK_SIZE {
        key_padded[..key.len()].copy_from_slice(key);
    } else {
        let hashed = Sha1::digest(key);
        key_padded[..hashed.len()].copy_from_slice(&hashed);
    }

    let mut ipad = vec![0x36u8; BLOCK_SIZE];
    let mut opad = vec![0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key_padded[i];
        opad[i] ^= key_padded[i];
    }

    let mut inner = Sha1::new();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha1::new();
    outer.update(&opad);
    outer.update(&inner_hash);
    outer.finalize().to_vec()
}

fn decode_base32(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let mut bits: Vec<bool> = Vec::with_capacity(input.len() * 5);

    for c in input.chars() {
        if c == '=' {
            break;
        }
        let val = ALPHABET.find(c)?;
        for i in (0..5).rev() {
            bits.push((val & (1 << i)) != 0);
        }
    }

    let mut bytes = Vec::with_capacity(bits.len() / 8);
    for chunk in bits.chunks(8) {
        if chunk.len() == 8 {
            let mut byte = 0u8;
            for (i, &bit) in chunk.iter().enumerate() {
                if bit {
                    byte |= 1 << (7 - i);
                }
            }
            bytes.push(byte);
        }
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "JBSWY3DPEHPK3PXP";

    #[test]
    fn test_code_shape() {
        let code = generate_totp(SECRET, 12345678).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_drift_window() {
        let now = 1_700_000_000u64;
        let step = now / TIME_STEP;

        for offset in [-1i64, 0, 1] {
            let code = generate_totp(SECRET, (step as i64 + offset) as u64).unwrap();
            assert!(
                verify_totp_at(SECRET, &code, now),
                "offset {} must be accepted",
                offset
            );
        }

        for offset in [-3i64, -2, 2, 3] {
            let code = generate_totp(SECRET, (step as i64 + offset) as u64).unwrap();
            assert!(
                !verify_totp_at(SECRET, &code, now),
                "offset {} must be rejected",
                offset
            );
        }
    }

    #[test]
    fn test_wrong_code_rejected() {
        assert!(!verify_totp_at(SECRET, "000000", 1_700_000_000));
        assert!(!verify_totp_at(SECRET, "not6digits", 1_700_000_000));
    }

    #[test]
    fn test_recovery_code_format() {
        let codes = generate_recovery_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        for rc in &codes {
            assert_eq!(rc.code.len(), 9);
            let (head, tail) = rc.code.split_at(4);
            assert!(head.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(&tail[..1], "-");
            assert!(tail[1..].chars().all(|c| c.is_ascii_hexdigit()));
            assert!(rc.used_at.is_none());
        }
    }

    #[test]
    fn test_secret_is_base32() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(decode_base32(&secret).is_some());
    }

    #[test]
    fn test_provisioning_uri() {
        let uri = provisioning_uri("alice", SECRET);
        assert!(uri.starts_with("otpauth://totp/NOS:alice?secret="));
        assert!(uri.contains("period=30"));
    }
}
