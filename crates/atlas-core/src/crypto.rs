//! API-key encryption at rest.
//!
//! Credentials are sealed with AES-256-GCM; the stored form is
//! base64(nonce || ciphertext). The key comes from `ai.crypto_key`
//! (base64-encoded 32 bytes). Decryption happens only at the point of
//! use — keys never sit in memory longer than a request needs them.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AtlasError, Result};

pub struct KeyVault {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl KeyVault {
    /// Build a vault from the base64-encoded 32-byte master key.
    pub fn new(crypto_key_b64: &str) -> Result<Self> {
        let raw = B64
            .decode(crypto_key_b64.trim())
            .map_err(|e| AtlasError::Config(format!("invalid crypto key encoding: {e}")))?;
        if raw.len() != 32 {
            return Err(AtlasError::Config(format!(
                "crypto key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &raw)
            .map_err(|_| AtlasError::Config("crypto key rejected".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Seal a plaintext API key for storage.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AtlasError::Internal("nonce generation failed".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| AtlasError::Internal("seal failed".to_string()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&buf);
        Ok(B64.encode(out))
    }

    /// Open a sealed API key. Fails on tampered or foreign-key material.
    pub fn open(&self, sealed_b64: &str) -> Result<String> {
        let raw = B64
            .decode(sealed_b64.trim())
            .map_err(|e| AtlasError::Validation(format!("invalid sealed key encoding: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(AtlasError::Validation("sealed key too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| AtlasError::Validation("bad nonce".to_string()))?;

        let mut buf = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| AtlasError::Validation("decryption failed".to_string()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| AtlasError::Validation("decrypted key is not UTF-8".to_string()))
    }

    /// Short non-reversible hint for display ("sk-…f3ab").
    pub fn hint(plaintext: &str) -> String {
        let trimmed = plaintext.trim();
        if trimmed.len() <= 8 {
            return "****".to_string();
        }
        let head: String = trimmed.chars().take(3).collect();
        let tail: String = trimmed
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{head}…{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::new(&B64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let v = vault();
        let sealed = v.seal("sk-test-123456").unwrap();
        assert_ne!(sealed, "sk-test-123456");
        assert_eq!(v.open(&sealed).unwrap(), "sk-test-123456");
    }

    #[test]
    fn tampered_material_fails() {
        let v = vault();
        let sealed = v.seal("sk-test-123456").unwrap();
        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(v.open(&B64.encode(raw)).is_err());
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(KeyVault::new(&B64.encode([1u8; 16])).is_err());
    }
}
