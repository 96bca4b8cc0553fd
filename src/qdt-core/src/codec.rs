//! Tunnel codec: IP packet to sealed datagrams and back.
//!
//! Outbound, a packet that fits the plaintext MTU becomes one `Data`
//! datagram; anything larger is cut into `Fragment` datagrams carrying a
//! `(id, offset, total)` subheader. Inbound, the codec parses the header,
//! opens the ciphertext, and routes by type. Both directions are safe to
//! call from multiple workers: counters and fragment ids are atomic, the
//! reassembler and replay window lock internally.

use std::time::Duration;

use qdt_crypto::{CipherState, TAG_LEN};

use crate::error::{Error, Result};
use crate::fragment::{
    write_fragment_header, Fragmenter, Reassembler, FRAG_HEADER_LEN,
};
use crate::wire::{append_header, parse_header, Header, MsgType, HEADER_LEN};

/// Default tunnel MTU when neither side configures one.
pub const DEFAULT_MTU: usize = 1350;

/// Hard ceiling on a single tunneled packet.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Result of decoding one inbound datagram.
#[derive(Debug)]
pub enum Decoded {
    /// Nothing to forward (ping, pong, or an incomplete fragment).
    None,
    /// The plaintext was written into the caller's buffer.
    InPlace,
    /// A reassembled packet in a freshly allocated buffer.
    Assembled(Vec<u8>),
    /// The peer requested an orderly shutdown.
    Close,
}

/// Per-session codec combining framing, AEAD, and fragmentation.
pub struct Tunnel {
    session_id: u64,
    mtu: usize,
    send: CipherState,
    recv: CipherState,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
}

impl Tunnel {
    /// Codec with default reassembly limits.
    pub fn new(session_id: u64, mtu: usize, send: CipherState, recv: CipherState) -> Self {
        Self::with_limits(session_id, mtu, send, recv, 0)
    }

    /// Codec with an explicit cap on reassembled packet size.
    pub fn with_limits(
        session_id: u64,
        mtu: usize,
        send: CipherState,
        recv: CipherState,
        max_reassembly: usize,
    ) -> Self {
        let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };
        Self {
            session_id,
            mtu,
            send,
            recv,
            fragmenter: Fragmenter::default(),
            reassembler: Reassembler::new(Duration::ZERO, 0, max_reassembly),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest plaintext that fits a single `Data` datagram.
    pub fn plaintext_mtu(&self) -> usize {
        self.mtu.saturating_sub(HEADER_LEN + TAG_LEN)
    }

    /// Largest packet slice that fits a single `Fragment` datagram.
    pub fn fragment_payload_mtu(&self) -> usize {
        self.plaintext_mtu().saturating_sub(FRAG_HEADER_LEN)
    }

    /// Encode one packet into one or more sealed datagrams.
    ///
    /// `alloc` supplies an output buffer of at least the requested size
    /// (returning `None` to refuse, e.g. a pool miss) and `emit` consumes
    /// each finished datagram. Fragmentation walks the payload in
    /// [`Tunnel::fragment_payload_mtu`] slices under a single fresh
    /// fragment id.
    pub fn encode_packet<A, E>(&self, payload: &[u8], mut alloc: A, mut emit: E) -> Result<()>
    where
        A: FnMut(usize) -> Option<Vec<u8>>,
        E: FnMut(Vec<u8>) -> Result<()>,
    {
        let plain_mtu = self.plaintext_mtu();
        if plain_mtu == 0 {
            return Err(Error::ConfigInvalid(format!(
                "mtu {} leaves no room for payload",
                self.mtu
            )));
        }
        if payload.len() <= plain_mtu {
            let buf = self.seal_datagram(MsgType::Data, payload, &mut alloc)?;
            return emit(buf);
        }

        let frag_mtu = self.fragment_payload_mtu();
        let max = frag_mtu * u16::MAX as usize;
        if frag_mtu == 0 || payload.len() > max.min(u32::MAX as usize) {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: max.min(u32::MAX as usize),
            });
        }

        let id = self.fragmenter.next_id();
        let total = payload.len() as u32;
        let mut scratch = [0u8; FRAG_HEADER_LEN];
        for offset in (0..payload.len()).step_by(frag_mtu) {
            let end = (offset + frag_mtu).min(payload.len());
            write_fragment_header(&mut scratch, id, offset as u32, total);
            let buf = self.seal_fragment(&scratch, &payload[offset..end], &mut alloc)?;
            emit(buf)?;
        }
        Ok(())
    }

    fn seal_datagram<A>(&self, msg_type: MsgType, plaintext: &[u8], alloc: &mut A) -> Result<Vec<u8>>
    where
        A: FnMut(usize) -> Option<Vec<u8>>,
    {
        let size = HEADER_LEN + plaintext.len() + TAG_LEN;
        let mut buf = alloc(size).ok_or(Error::Backpressure)?;
        buf.clear();
        let counter = self.send.next_counter();
        append_header(&mut buf, &Header::new(msg_type, self.session_id, counter));
        let mut aad = [0u8; HEADER_LEN];
        aad.copy_from_slice(&buf[..HEADER_LEN]);
        self.send.seal_into(&mut buf, counter, &aad, plaintext)?;
        Ok(buf)
    }

    fn seal_fragment<A>(&self, subheader: &[u8], slice: &[u8], alloc: &mut A) -> Result<Vec<u8>>
    where
        A: FnMut(usize) -> Option<Vec<u8>>,
    {
        let plain_len = subheader.len() + slice.len();
        let size = HEADER_LEN + plain_len + TAG_LEN;
        let mut buf = alloc(size).ok_or(Error::Backpressure)?;
        buf.clear();
        let counter = self.send.next_counter();
        append_header(
            &mut buf,
            &Header::new(MsgType::Fragment, self.session_id, counter),
        );
        let mut aad = [0u8; HEADER_LEN];
        aad.copy_from_slice(&buf[..HEADER_LEN]);
        // Compose subheader || slice directly in the output buffer and
        // seal it in place; no intermediate concatenation.
        let body_start = buf.len();
        buf.extend_from_slice(subheader);
        buf.extend_from_slice(slice);
        self.send.seal_in_place(&mut buf, body_start, counter, &aad)?;
        debug_assert_eq!(buf.len(), size);
        Ok(buf)
    }

    /// Send a `Ping` datagram (liveness probe).
    pub fn encode_ping<A>(&self, alloc: &mut A) -> Result<Vec<u8>>
    where
        A: FnMut(usize) -> Option<Vec<u8>>,
    {
        self.seal_datagram(MsgType::Ping, &[], alloc)
    }

    /// Send a `Close` datagram (orderly shutdown).
    pub fn encode_close<A>(&self, alloc: &mut A) -> Result<Vec<u8>>
    where
        A: FnMut(usize) -> Option<Vec<u8>>,
    {
        self.seal_datagram(MsgType::Close, &[], alloc)
    }

    /// Decode one inbound datagram, appending an in-place plaintext to
    /// `dst` (the caller's pooled buffer).
    pub fn decode_datagram_into(&self, dst: &mut Vec<u8>, raw: &[u8]) -> Result<Decoded> {
        let (header, ciphertext) = parse_header(raw)?;
        if header.session_id != self.session_id {
            return Err(Error::SessionMismatch {
                got: header.session_id,
                want: self.session_id,
            });
        }
        let aad = &raw[..HEADER_LEN];
        match header.msg_type {
            MsgType::Data => {
                self.recv.open_into(dst, header.counter, aad, ciphertext)?;
                Ok(Decoded::InPlace)
            }
            MsgType::Fragment => {
                let plain = self.recv.open(header.counter, aad, ciphertext)?;
                match self.reassembler.push(&plain)? {
                    Some(packet) => Ok(Decoded::Assembled(packet)),
                    None => Ok(Decoded::None),
                }
            }
            MsgType::Ping | MsgType::Pong => {
                self.recv.open_into(dst, header.counter, aad, ciphertext)?;
                dst.clear();
                Ok(Decoded::None)
            }
            MsgType::Close => {
                self.recv.open_into(dst, header.counter, aad, ciphertext)?;
                dst.clear();
                Ok(Decoded::Close)
            }
        }
    }
}
