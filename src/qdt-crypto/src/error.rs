//! Error types for cryptographic operations.

use thiserror::Error;

/// Error type for key derivation, sealing, and opening.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The shared token is empty; no key material can be derived from it
    #[error("token is empty")]
    EmptyToken,

    /// A handshake nonce had the wrong length
    #[error("handshake nonce must be {expected} bytes, got {got}")]
    BadNonceLength { expected: usize, got: usize },

    /// HKDF expansion failed (output length out of range)
    #[error("key derivation failed")]
    Derive,

    /// AEAD open failed: wrong key, corrupted ciphertext, or mismatched AAD
    #[error("decryption failed")]
    Decrypt,

    /// AEAD seal failed
    #[error("encryption failed")]
    Encrypt,

    /// The receive counter was already admitted by the replay window
    #[error("replay detected")]
    Replay,
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
