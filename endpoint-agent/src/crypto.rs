//! Crypto helpers shared by the handshake and the stream transport
//!
//! Provides:
//! - Random bytes and printable random strings
//! - HMAC-SHA512 request signatures (standard and URL-safe base64)
//! - Constant-time signature comparison
//! - Curve25519 sealed boxes framed as `nonce(24) || ciphertext`

use crate::errors::AgentError;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};
use base64::Engine as _;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;

/// Sealed box nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Smallest frame that can hold a nonce plus an authentication tag
const MIN_SEALED_LEN: usize = 32;

const KEY_LEN: usize = 32;

/// Base64 encoded Curve25519 key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl KeyPair {
    /// Generate a fresh box key pair (encryption only, not signing)
    pub fn generate() -> Result<Self, AgentError> {
        let raw: [u8; KEY_LEN] = rand_bytes(KEY_LEN)?
            .try_into()
            .map_err(|_| AgentError::unknown("crypto: Random read error", "short read"))?;
        let secret = SecretKey::from(raw);
        let public = secret.public_key();

        Ok(Self {
            public_key: STANDARD.encode(public.as_bytes()),
            private_key: STANDARD.encode(secret.to_bytes()),
        })
    }
}

pub fn rand_bytes(size: usize) -> Result<Vec<u8>, AgentError> {
    let mut bytes = vec![0u8; size];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AgentError::unknown("crypto: Random read error", e))?;
    Ok(bytes)
}

/// Random alphanumeric string of exactly `n` characters
pub fn rand_str(n: usize) -> Result<String, AgentError> {
    let size = (n as f64 * 1.25).ceil() as usize;

    for _ in 0..10 {
        let encoded = STANDARD_NO_PAD.encode(rand_bytes(size)?);
        let filtered: String = encoded.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if filtered.len() >= n {
            return Ok(filtered[..n].to_string());
        }
    }

    Err(AgentError::unknown("crypto: Random generate error", "exhausted attempts"))
}

fn hmac_sha512(secret: &str, parts: &[&str]) -> Result<Vec<u8>, AgentError> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|e| AgentError::unknown("crypto: Invalid hmac key", e))?;
    mac.update(parts.join("&").as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA512 over `parts` joined by `&`, standard base64
pub fn sign(secret: &str, parts: &[&str]) -> Result<String, AgentError> {
    Ok(STANDARD.encode(hmac_sha512(secret, parts)?))
}

/// HMAC-SHA512 over `parts` joined by `&`, URL-safe base64 (header form)
pub fn sign_url(secret: &str, parts: &[&str]) -> Result<String, AgentError> {
    Ok(URL_SAFE.encode(hmac_sha512(secret, parts)?))
}

pub fn constant_time_eq(expected: &str, given: &str) -> bool {
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}

/// Strip control characters and cap the length in characters
pub fn filter_str(value: &str, max_len: usize) -> String {
    value.chars().filter(|c| !c.is_control()).take(max_len).collect()
}

fn decode_key(encoded: &str, msg: &str) -> Result<[u8; KEY_LEN], AgentError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| AgentError::parse_with(msg, e))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| AgentError::parse_with(msg, format!("bad key length {}", raw.len())))
}

/// Sealed box bound to the local private key and the trusted remote public key
pub struct Sealer {
    cipher: SalsaBox,
}

impl Sealer {
    pub fn new(private_key: &str, remote_public_key: &str) -> Result<Self, AgentError> {
        let private = decode_key(private_key, "crypto: Failed to decode client private key")?;
        let public = decode_key(remote_public_key, "crypto: Failed to decode server public key")?;

        Ok(Self {
            cipher: SalsaBox::new(&PublicKey::from(public), &SecretKey::from(private)),
        })
    }

    /// Seal with a fresh random nonce, returning `nonce || ciphertext`
    pub fn seal(&self, msg: &[u8]) -> Result<Vec<u8>, AgentError> {
        let mut frame = rand_bytes(NONCE_LEN)?;
        let sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&frame), msg)
            .map_err(|e| AgentError::write("crypto: Failed to seal message", e))?;
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, AgentError> {
        if frame.len() < MIN_SEALED_LEN {
            return Err(AgentError::parse(format!(
                "crypto: Sealed data too short ({})",
                frame.len()
            )));
        }

        let (nonce, body) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), body)
            .map_err(|_| AgentError::parse("crypto: Failed to decrypt data"))
    }
}
