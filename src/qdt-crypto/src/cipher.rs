//! Per-direction AEAD cipher state.
//!
//! Each session holds two [`CipherState`]s: one sealing with its own key
//! and nonce prefix, one opening with the peer's. The 12-byte AEAD nonce
//! is `nonce_prefix || counter_be`, so the atomically increasing send
//! counter guarantees nonce uniqueness per key. The receive side carries
//! the replay window; the counter is checked before decryption so
//! duplicates are shed without paying for tag verification, and marked
//! only after the tag verifies.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::KeyInit;
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305};

use crate::error::{CryptoError, Result};
use crate::keys::{KeyMaterial, KEY_LEN, NONCE_PREFIX_LEN};
use crate::replay::ReplayWindow;

/// ChaCha20-Poly1305 nonce length.
pub const AEAD_NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// One direction of a session's cipher: key, nonce prefix, send counter,
/// and (receive side only) the replay window.
pub struct CipherState {
    aead: ChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    send_counter: AtomicU64,
    replay: Option<ReplayWindow>,
}

impl CipherState {
    /// Build a cipher state for one direction. Pass a replay window only
    /// for the receive direction.
    pub fn new(
        key: &[u8; KEY_LEN],
        nonce_prefix: [u8; NONCE_PREFIX_LEN],
        replay: Option<ReplayWindow>,
    ) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(GenericArray::from_slice(key)),
            nonce_prefix,
            send_counter: AtomicU64::new(0),
            replay,
        }
    }

    /// Client-role pair: seals with the client half, opens with the server
    /// half.
    pub fn client_pair(km: &KeyMaterial, replay: ReplayWindow) -> Result<(Self, Self)> {
        let send = Self::new(&km.client_key, km.client_nonce_prefix, None);
        let recv = Self::new(&km.server_key, km.server_nonce_prefix, Some(replay));
        Ok((send, recv))
    }

    /// Server-role pair, symmetric to [`CipherState::client_pair`].
    pub fn server_pair(km: &KeyMaterial, replay: ReplayWindow) -> Result<(Self, Self)> {
        let send = Self::new(&km.server_key, km.server_nonce_prefix, None);
        let recv = Self::new(&km.client_key, km.client_nonce_prefix, Some(replay));
        Ok((send, recv))
    }

    /// Return the next send counter. Post-increment, starting at 0.
    pub fn next_counter(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn nonce(&self, counter: u64) -> [u8; AEAD_NONCE_LEN] {
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seal `plaintext` under `counter` and append `ciphertext || tag` to
    /// `dst`.
    pub fn seal_into(
        &self,
        dst: &mut Vec<u8>,
        counter: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<()> {
        let start = dst.len();
        dst.extend_from_slice(plaintext);
        self.seal_in_place(dst, start, counter, aad)
    }

    /// Encrypt `dst[start..]` in place under `counter` and append the tag.
    ///
    /// Lets callers compose a plaintext from several pieces directly in the
    /// output buffer before sealing it.
    pub fn seal_in_place(
        &self,
        dst: &mut Vec<u8>,
        start: usize,
        counter: u64,
        aad: &[u8],
    ) -> Result<()> {
        let nonce = self.nonce(counter);
        let tag = self
            .aead
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut dst[start..])
            .map_err(|_| CryptoError::Encrypt)?;
        dst.extend_from_slice(&tag);
        Ok(())
    }

    /// Open `ciphertext` (which includes the trailing tag) under `counter`
    /// and append the plaintext to `dst`.
    ///
    /// The replay window, when present, rejects the counter before any
    /// decryption work and records it only after the tag verifies.
    pub fn open_into(
        &self,
        dst: &mut Vec<u8>,
        counter: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<()> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        if let Some(replay) = &self.replay {
            if !replay.check(counter) {
                return Err(CryptoError::Replay);
            }
        }
        let nonce = self.nonce(counter);
        let (body, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
        let start = dst.len();
        dst.extend_from_slice(body);
        if self.aead.decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            aad,
            &mut dst[start..],
            GenericArray::from_slice(tag),
        ).is_err() {
            dst.truncate(start);
            return Err(CryptoError::Decrypt);
        }
        if let Some(replay) = &self.replay {
            replay.mark(counter);
        }
        Ok(())
    }

    /// Open `ciphertext` into a fresh buffer.
    pub fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(ciphertext.len().saturating_sub(TAG_LEN));
        self.open_into(&mut out, counter, aad, ciphertext)?;
        Ok(out)
    }
}
