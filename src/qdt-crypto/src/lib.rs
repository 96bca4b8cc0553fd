//! # QDT Crypto
//!
//! Cryptographic primitives for the QDT tunnel protocol.
//!
//! ## Features
//!
//! - **Key derivation**: HKDF-SHA256 from a shared token and handshake nonces
//! - **AEAD cipher state**: ChaCha20-Poly1305 with counter-based nonces
//! - **Replay protection**: sliding-bitmap window over receive counters
//! - **Constant-time operations**: for token comparison
//! - **Secret hygiene**: key material zeroized on drop
//!
//! ## Example
//!
//! ```
//! use qdt_crypto::{derive_key_material, new_handshake_nonce, CipherState, ReplayWindow};
//!
//! let client_nonce = new_handshake_nonce();
//! let server_nonce = new_handshake_nonce();
//! let km = derive_key_material("shared-token", &client_nonce, &server_nonce).unwrap();
//!
//! let (send, _recv) = CipherState::client_pair(&km, ReplayWindow::new(2048)).unwrap();
//! let counter = send.next_counter();
//! let mut out = Vec::new();
//! send.seal_into(&mut out, counter, b"aad", b"payload").unwrap();
//! ```

pub mod cipher;
pub mod constant_time;
pub mod error;
pub mod keys;
pub mod replay;
pub mod rng;

pub use cipher::{CipherState, AEAD_NONCE_LEN, TAG_LEN};
pub use constant_time::ct_eq;
pub use error::{CryptoError, Result};
pub use keys::{
    derive_key_material, new_handshake_nonce, KeyMaterial, HANDSHAKE_NONCE_LEN, KEY_LEN,
    NONCE_PREFIX_LEN,
};
pub use replay::ReplayWindow;
