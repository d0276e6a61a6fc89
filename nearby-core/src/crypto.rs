//! Link encryption: ChaCha20-Poly1305 keyed per peer pair, 64-bit counter nonces.

use chacha20poly1305::aead::{Aead, KeyInit, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

const SESSION_KEY_CONTEXT: &[u8] = b"nearby-session-v1";

/// Derive the pairwise link key from an X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_KEY_CONTEXT);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Key for the frames `sender` writes on a link. The two directions never share a
/// key, so both may count nonces from zero.
pub fn direction_key(session_key: &[u8; 32], sender: PeerId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_key);
    hasher.update(sender.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("nonce space exhausted")]
    NonceExhausted,
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    bytes
}

/// Encrypt one frame payload with an explicit counter.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    cipher
        .encrypt(Nonce::<ChaCha20Poly1305>::from_slice(&nonce), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Decrypt one frame payload with an explicit counter.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    cipher
        .decrypt(Nonce::<ChaCha20Poly1305>::from_slice(&nonce), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

/// One direction of a link, keyed with [`direction_key`]. Sealing and opening sides
/// stay in step as long as frames arrive in order.
pub struct FrameCipher {
    key: [u8; 32],
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let out = encrypt_wire(&self.key, self.counter, plaintext)?;
        self.advance()?;
        Ok(out)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let out = decrypt_wire(&self.key, self.counter, ciphertext)?;
        self.advance()?;
        Ok(out)
    }

    fn advance(&mut self) -> Result<(), WireCryptoError> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(WireCryptoError::NonceExhausted)?;
        Ok(())
    }
}
