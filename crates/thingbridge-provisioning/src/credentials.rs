//! Device tokens and the credential envelope sent to the chip.
//!
//! The broker credentials are sealed with AES-256-GCM under
//! `sha256(physical_id + token)`. Both inputs travel with the provisioning
//! response, so only firmware that knows the derivation can use them.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thingbridge_core::{Error, Result};

/// Random bytes in a device token.
pub const TOKEN_BYTES: usize = 32;

const NONCE_LEN: usize = 12;

/// Fresh device token: 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn chip_cipher(physical_id: &str, token: &str) -> Aes256Gcm {
    let key = Sha256::digest(format!("{physical_id}{token}").as_bytes());
    Aes256Gcm::new(&key)
}

/// Seal `username|password` for the chip. Returns hex(nonce ‖ ciphertext).
pub fn seal_credentials(physical_id: &str, token: &str, username: &str, password: &str) -> Result<String> {
    let cipher = chip_cipher(physical_id, token);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, format!("{username}|{password}").as_bytes())
        .map_err(|_| Error::Internal("failed to seal device credentials".to_string()))?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(hex::encode(combined))
}

/// Open an envelope produced by [`seal_credentials`], the way firmware
/// does. Returns `(username, password)`.
pub fn open_credentials(physical_id: &str, token: &str, sealed: &str) -> Result<(String, String)> {
    let bytes = hex::decode(sealed)
        .map_err(|e| Error::validation(format!("sealed credentials are not hex: {e}")))?;
    if bytes.len() <= NONCE_LEN {
        return Err(Error::validation("sealed credentials are too short"));
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let plaintext = chip_cipher(physical_id, token)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::validation("sealed credentials do not match this device"))?;
    let text = String::from_utf8(plaintext)
        .map_err(|_| Error::validation("sealed credentials are not UTF-8"))?;

    let (username, password) = text
        .split_once('|')
        .ok_or_else(|| Error::validation("sealed credentials have no separator"))?;
    Ok((username.to_string(), password.to_string()))
}
