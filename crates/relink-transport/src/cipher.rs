//! Payload cipher collaborator.
//!
//! The transport never interprets payload bytes; it only needs an in-place,
//! length-preserving transform to unwrap the init handshake. The same
//! operation must encrypt and decrypt (stream-cipher style), so carriers and
//! the facade can stay agnostic of direction.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

/// In-place, length-preserving payload transform keyed by a key/IV pair.
pub trait PayloadCipher: Send + Sync {
    /// Transform `buf` in place. Applying the transform twice restores the
    /// original bytes.
    fn apply(&self, buf: &mut [u8]);
}

/// ChaCha20 stream-cipher transform.
pub struct ChaCha20Cipher {
    key: [u8; 32],
    iv: [u8; 12],
}

impl ChaCha20Cipher {
    /// Build a cipher from a 256-bit key and 96-bit IV.
    pub fn new(key: [u8; 32], iv: [u8; 12]) -> Self {
        ChaCha20Cipher { key, iv }
    }
}

impl PayloadCipher for ChaCha20Cipher {
    fn apply(&self, buf: &mut [u8]) {
        let mut cipher = ChaCha20::new((&self.key).into(), (&self.iv).into());
        cipher.apply_keystream(buf);
    }
}

/// Identity transform for plaintext deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl PayloadCipher for NullCipher {
    fn apply(&self, _buf: &mut [u8]) {}
}
