//! Message sealing capability.
//!
//! Secure storage and the actual key management live outside the engine; the
//! engine only needs to seal outgoing data-channel frames and open incoming
//! ones. The capability is injected, [`NoopSealer`] is used when the
//! deployment does not encrypt.

use std::{fmt, fs::File, io::Read, path::Path};

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SealError {
    #[error("sealed frame too short")]
    Truncated,
    #[error("encryption failure")]
    Encryption,
    #[error("decryption failure")]
    Decryption,
}

pub trait MessageSealer: Send + Sync + fmt::Debug + 'static {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// Passes frames through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSealer;

impl MessageSealer for NoopSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(sealed.to_vec())
    }
}

/// XChaCha20-Poly1305 with a shared organization key.
///
/// Frame layout: `nonce (24 bytes) || ciphertext`.
#[derive(Clone)]
pub struct ChaChaSealer {
    cipher: XChaCha20Poly1305,
}

impl ChaChaSealer {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(GenericArray::from_slice(key)),
        }
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        XChaCha20Poly1305::generate_key(&mut OsRng).into()
    }

    /// Reads a raw 32 byte key file.
    pub fn from_key_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to open key file {}: {e}", path.display()),
            )
        })?;
        let mut key = [0u8; KEY_SIZE];
        file.read_exact(&mut key).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to read key file {}: {e}", path.display()),
            )
        })?;
        Ok(Self::new(&key))
    }
}

impl fmt::Debug for ChaChaSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChaChaSealer")
    }
}

impl MessageSealer for ChaChaSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SealError::Encryption)?;
        let mut frame = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < NONCE_SIZE {
            return Err(SealError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chacha_frames_open_with_same_key_only() {
        let key = ChaChaSealer::generate_key();
        let sealer = ChaChaSealer::new(&key);
        let frame = sealer.seal(b"{\"lat\":1.0}").unwrap();
        assert_ne!(&frame[NONCE_SIZE..], b"{\"lat\":1.0}");
        assert_eq!(sealer.open(&frame).unwrap(), b"{\"lat\":1.0}");

        let other = ChaChaSealer::new(&ChaChaSealer::generate_key());
        assert_eq!(other.open(&frame), Err(SealError::Decryption));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let sealer = ChaChaSealer::new(&[7u8; KEY_SIZE]);
        assert_eq!(sealer.open(&[0u8; 10]), Err(SealError::Truncated));
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("org.key");
        let key = ChaChaSealer::generate_key();
        std::fs::write(&path, key).unwrap();
        let sealer = ChaChaSealer::from_key_file(&path).unwrap();
        let frame = ChaChaSealer::new(&key).seal(b"hello").unwrap();
        assert_eq!(sealer.open(&frame).unwrap(), b"hello");
    }
}
