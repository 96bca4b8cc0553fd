//! Sharded dispatch table from virtual IPv4 to session.
//!
//! `get_by_ip` sits on the hot inbound path of the interface read loop; a
//! shard holds its read lock only for a single map probe. Shard index is
//! `ip mod shards`, which spreads sequentially allocated pool addresses
//! evenly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::Session;

/// Sharded `ip4 -> session` map.
pub struct SessionTable {
    shards: Vec<Shard>,
}

struct Shard {
    by_ip: RwLock<HashMap<u32, Arc<Session>>>,
}

impl SessionTable {
    /// Table with `shards` shards; zero falls back to 64.
    pub fn new(shards: usize) -> Self {
        let shards = if shards == 0 { 64 } else { shards };
        Self {
            shards: (0..shards)
                .map(|_| Shard {
                    by_ip: RwLock::new(HashMap::new()),
                })
                .collect(),
        }
    }

    fn shard(&self, ip4: u32) -> &Shard {
        &self.shards[(ip4 as usize) % self.shards.len()]
    }

    /// Register a session under its virtual address.
    pub fn add(&self, session: Arc<Session>) {
        let ip4 = session.ip4();
        self.shard(ip4)
            .by_ip
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(ip4, session);
    }

    /// Remove a session. A different session registered under the same
    /// address is left untouched.
    pub fn remove(&self, session: &Session) {
        let ip4 = session.ip4();
        let mut shard = self.shard(ip4).by_ip.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(current) = shard.get(&ip4) {
            if current.id() == session.id() {
                shard.remove(&ip4);
            }
        }
    }

    /// Look up the session owning `ip4`.
    pub fn get_by_ip(&self, ip4: u32) -> Option<Arc<Session>> {
        self.shard(ip4)
            .by_ip
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&ip4)
            .cloned()
    }

    /// Point-in-time list of all sessions (consistent per shard).
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.by_ip.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            out.extend(guard.values().cloned());
        }
        out
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.by_ip.read().unwrap_or_else(std::sync::PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
