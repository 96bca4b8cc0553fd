//! Session key derivation.
//!
//! Both peers derive identical key material from the shared token and the
//! pair of handshake nonces. Direction is fixed by role: the client seals
//! with `client_key`/`client_nonce_prefix`, the server with the server
//! halves, so a counter never repeats under one key.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::rng;

/// Length of each handshake nonce exchanged in `/connect`.
pub const HANDSHAKE_NONCE_LEN: usize = 16;

/// Length of the per-direction AEAD nonce prefix.
pub const NONCE_PREFIX_LEN: usize = 4;

/// ChaCha20-Poly1305 key length.
pub const KEY_LEN: usize = 32;

/// HKDF info label; versioned so a future derivation change cannot
/// silently interoperate with this one.
const HKDF_INFO: &[u8] = b"qdt-aead-v1";

/// Per-session key material for both directions.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub client_key: [u8; KEY_LEN],
    pub server_key: [u8; KEY_LEN],
    pub client_nonce_prefix: [u8; NONCE_PREFIX_LEN],
    pub server_nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Generate a fresh 16-byte handshake nonce.
pub fn new_handshake_nonce() -> [u8; HANDSHAKE_NONCE_LEN] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rng::fill(&mut nonce);
    nonce
}

/// Derive session key material from the shared token and handshake nonces.
///
/// `HKDF-SHA256(ikm = token, salt = client_nonce || server_nonce, info =
/// "qdt-aead-v1")` expanded to 72 bytes, consumed as client key, server
/// key, client nonce prefix, server nonce prefix.
pub fn derive_key_material(
    token: &str,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<KeyMaterial> {
    if token.is_empty() {
        return Err(CryptoError::EmptyToken);
    }
    for nonce in [client_nonce, server_nonce] {
        if nonce.len() != HANDSHAKE_NONCE_LEN {
            return Err(CryptoError::BadNonceLength {
                expected: HANDSHAKE_NONCE_LEN,
                got: nonce.len(),
            });
        }
    }

    let mut salt = [0u8; HANDSHAKE_NONCE_LEN * 2];
    salt[..HANDSHAKE_NONCE_LEN].copy_from_slice(client_nonce);
    salt[HANDSHAKE_NONCE_LEN..].copy_from_slice(server_nonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), token.as_bytes());
    let mut okm = [0u8; KEY_LEN * 2 + NONCE_PREFIX_LEN * 2];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::Derive)?;

    let mut km = KeyMaterial {
        client_key: [0u8; KEY_LEN],
        server_key: [0u8; KEY_LEN],
        client_nonce_prefix: [0u8; NONCE_PREFIX_LEN],
        server_nonce_prefix: [0u8; NONCE_PREFIX_LEN],
    };
    let mut off = 0;
    km.client_key.copy_from_slice(&okm[off..off + KEY_LEN]);
    off += KEY_LEN;
    km.server_key.copy_from_slice(&okm[off..off + KEY_LEN]);
    off += KEY_LEN;
    km.client_nonce_prefix
        .copy_from_slice(&okm[off..off + NONCE_PREFIX_LEN]);
    off += NONCE_PREFIX_LEN;
    km.server_nonce_prefix
        .copy_from_slice(&okm[off..off + NONCE_PREFIX_LEN]);
    okm.zeroize();
    Ok(km)
}
