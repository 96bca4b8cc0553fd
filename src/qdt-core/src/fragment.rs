//! Fragmentation and reassembly for packets larger than one datagram.
//!
//! A fragment's plaintext starts with a 12-byte big-endian subheader
//! `frag_id:u32 | offset:u32 | total:u32`, followed by the slice
//! `[offset, offset + len)` of the original packet. The reassembler keeps
//! one entry per fragment id with a sorted list of non-overlapping
//! segments; overlapping or malformed pushes drop the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Fragment subheader length.
pub const FRAG_HEADER_LEN: usize = 12;

/// Default cap on a reassembled packet.
pub const DEFAULT_MAX_REASSEMBLY: usize = 65535;

/// Default time-to-live for partial entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Default cap on concurrent partial entries.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Allocator of per-flight fragment ids.
#[derive(Default)]
pub struct Fragmenter {
    next_id: AtomicU32,
}

impl Fragmenter {
    /// Fresh fragment id, unique within this session.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Write a fragment subheader into the first [`FRAG_HEADER_LEN`] bytes of
/// `dst`.
///
/// # Panics
///
/// Panics when `dst` is shorter than [`FRAG_HEADER_LEN`].
pub fn write_fragment_header(dst: &mut [u8], id: u32, offset: u32, total: u32) {
    dst[0..4].copy_from_slice(&id.to_be_bytes());
    dst[4..8].copy_from_slice(&offset.to_be_bytes());
    dst[8..12].copy_from_slice(&total.to_be_bytes());
}

/// Split a fragment plaintext into `(id, offset, total, payload)`.
pub fn parse_fragment_header(b: &[u8]) -> Result<(u32, u32, u32, &[u8])> {
    if b.len() < FRAG_HEADER_LEN {
        return Err(Error::FragmentTooSmall);
    }
    let id = u32::from_be_bytes(b[0..4].try_into().expect("4-byte slice"));
    let offset = u32::from_be_bytes(b[4..8].try_into().expect("4-byte slice"));
    let total = u32::from_be_bytes(b[8..12].try_into().expect("4-byte slice"));
    Ok((id, offset, total, &b[FRAG_HEADER_LEN..]))
}

struct Entry {
    total: usize,
    received: usize,
    updated_at: Instant,
    buf: Vec<u8>,
    /// Sorted, non-overlapping `[start, end)` segments.
    segments: Vec<(usize, usize)>,
}

struct Table {
    entries: HashMap<u32, Entry>,
    last_sweep: Instant,
}

/// Order-insensitive reassembly keyed by fragment id.
pub struct Reassembler {
    ttl: Duration,
    max_entries: usize,
    max_total: usize,
    table: Mutex<Table>,
}

impl Reassembler {
    /// Build a reassembler; zero arguments fall back to the defaults.
    pub fn new(ttl: Duration, max_entries: usize, max_total: usize) -> Self {
        Self {
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
            max_entries: if max_entries == 0 {
                DEFAULT_MAX_ENTRIES
            } else {
                max_entries
            },
            max_total: if max_total == 0 {
                DEFAULT_MAX_REASSEMBLY
            } else {
                max_total
            },
            table: Mutex::new(Table {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Feed one fragment plaintext. Returns the reassembled packet on the
    /// final segment, `None` while incomplete.
    ///
    /// Overlapping segments fail with [`Error::FragmentOverlap`] and drop
    /// the entry; the peer has violated the framing and the partial buffer
    /// cannot be trusted.
    pub fn push(&self, b: &[u8]) -> Result<Option<Vec<u8>>> {
        let (id, offset, total, payload) = parse_fragment_header(b)?;
        if total == 0 {
            return Err(Error::Reassembly("zero total"));
        }
        let total = total as usize;
        if total > self.max_total {
            return Err(Error::Reassembly("total exceeds limit"));
        }
        let offset = offset as usize;
        let end = offset
            .checked_add(payload.len())
            .ok_or(Error::Reassembly("offset overflow"))?;
        if end > total {
            return Err(Error::Reassembly("segment exceeds total"));
        }

        let mut table = self.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if table.entries.len() >= self.max_entries {
            self.sweep_locked(&mut table);
        }

        enum Verdict {
            Mismatch,
            Overlap,
            Incomplete,
            Complete,
        }

        let now = Instant::now();
        let verdict = {
            let entry = table.entries.entry(id).or_insert_with(|| Entry {
                total,
                received: 0,
                updated_at: now,
                buf: vec![0u8; total],
                segments: Vec::with_capacity(8),
            });
            if entry.total != total {
                Verdict::Mismatch
            } else {
                // Binary search for the insertion point, then reject any
                // overlap with the neighbors.
                let idx = entry.segments.partition_point(|&(start, _)| start < offset);
                let overlaps_prev = idx > 0 && entry.segments[idx - 1].1 > offset;
                let overlaps_next =
                    idx < entry.segments.len() && entry.segments[idx].0 < end;
                if overlaps_prev || overlaps_next {
                    Verdict::Overlap
                } else {
                    entry.buf[offset..end].copy_from_slice(payload);
                    entry.segments.insert(idx, (offset, end));
                    entry.received += payload.len();
                    entry.updated_at = now;
                    if entry.received < entry.total {
                        Verdict::Incomplete
                    } else {
                        Verdict::Complete
                    }
                }
            }
        };

        match verdict {
            Verdict::Mismatch => {
                table.entries.remove(&id);
                Err(Error::Reassembly("total changed between fragments"))
            }
            Verdict::Overlap => {
                table.entries.remove(&id);
                Err(Error::FragmentOverlap)
            }
            Verdict::Incomplete => Ok(None),
            Verdict::Complete => {
                let entry = table.entries.remove(&id).expect("entry present");
                assemble(entry).map(Some)
            }
        }
    }

    fn sweep_locked(&self, table: &mut Table) {
        let now = Instant::now();
        if now.duration_since(table.last_sweep) < self.ttl {
            return;
        }
        let ttl = self.ttl;
        table
            .entries
            .retain(|_, entry| now.duration_since(entry.updated_at) <= ttl);
        table.last_sweep = now;
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.table.lock().unwrap().entries.len()
    }
}

/// Verify the sorted segments tile `[0, total)` exactly and hand back the
/// buffer.
fn assemble(entry: Entry) -> Result<Vec<u8>> {
    let mut pos = 0;
    for &(start, end) in &entry.segments {
        if start != pos {
            return Err(Error::Reassembly("gap between segments"));
        }
        pos = end;
    }
    if pos != entry.total {
        return Err(Error::Reassembly("size mismatch"));
    }
    Ok(entry.buf)
}
