//! Virtual IPv4 address pool.
//!
//! Allocates client addresses from a CIDR, skipping the network and
//! broadcast addresses plus any caller reservations (the gateway address
//! at minimum). A rotating cursor spreads allocations across the range so
//! a released address is not immediately rehanded to the next client.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;

use crate::error::{Error, Result};

/// Thread-safe IPv4 address allocator backed by a CIDR.
pub struct Pool {
    cidr: Ipv4Network,
    base: u32,
    max: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    next: u32,
    used: HashSet<u32>,
    reserved: HashSet<u32>,
}

impl Pool {
    /// Build a pool over `cidr`, reserving the network and broadcast
    /// addresses and every address in `reserve`.
    pub fn new(cidr: Ipv4Network, reserve: &[Ipv4Addr]) -> Result<Self> {
        let network = u32::from(cidr.network());
        let broadcast = u32::from(cidr.broadcast());
        // Usable slots exclude the network and broadcast addresses.
        let usable = (broadcast - network).saturating_sub(1);
        if usable < 3 {
            return Err(Error::ConfigInvalid(format!(
                "pool cidr {cidr} too small: need at least 3 usable addresses"
            )));
        }
        let mut reserved: HashSet<u32> = reserve.iter().map(|ip| u32::from(*ip)).collect();
        reserved.insert(network);
        reserved.insert(broadcast);

        let base = network + 1;
        Ok(Self {
            cidr,
            base,
            max: broadcast - 1,
            inner: Mutex::new(Inner {
                next: base,
                used: HashSet::new(),
                reserved,
            }),
        })
    }

    /// The CIDR this pool allocates from.
    pub fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    /// Allocate the next free address.
    pub fn acquire(&self) -> Result<Ipv4Addr> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let span = self.max - self.base + 1;
        for i in 0..span {
            let candidate = self.base + (inner.next.wrapping_sub(self.base).wrapping_add(i)) % span;
            if inner.used.contains(&candidate) || inner.reserved.contains(&candidate) {
                continue;
            }
            inner.used.insert(candidate);
            inner.next = candidate + 1;
            return Ok(Ipv4Addr::from(candidate));
        }
        Err(Error::PoolExhausted)
    }

    /// Return an address to the pool. Idempotent; reserved addresses are
    /// never affected.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.used.remove(&u32::from(ip));
    }

    /// Number of currently allocated addresses.
    pub fn in_use(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str, reserve: &[Ipv4Addr]) -> Pool {
        Pool::new(cidr.parse().unwrap(), reserve).unwrap()
    }

    #[test]
    fn slash29_with_gateway_reserved_yields_five() {
        let p = pool("10.8.0.0/29", &[Ipv4Addr::new(10, 8, 0, 1)]);
        for last in 2..=6u8 {
            assert_eq!(p.acquire().unwrap(), Ipv4Addr::new(10, 8, 0, last));
        }
        assert!(matches!(p.acquire(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn release_restores_the_slot() {
        let p = pool("10.8.0.0/29", &[Ipv4Addr::new(10, 8, 0, 1)]);
        let mut held = Vec::new();
        while let Ok(ip) = p.acquire() {
            held.push(ip);
        }
        let freed = held[2];
        p.release(freed);
        assert_eq!(p.acquire().unwrap(), freed);
    }

    #[test]
    fn release_is_idempotent() {
        let p = pool("10.8.0.0/29", &[]);
        let ip = p.acquire().unwrap();
        p.release(ip);
        p.release(ip);
        assert_eq!(p.in_use(), 0);
    }

    #[test]
    fn reserved_addresses_never_returned() {
        let gateway = Ipv4Addr::new(10, 8, 0, 1);
        let p = pool("10.8.0.0/24", &[gateway]);
        for _ in 0..253 {
            let ip = p.acquire().unwrap();
            assert_ne!(ip, gateway);
            assert_ne!(ip, Ipv4Addr::new(10, 8, 0, 0));
            assert_ne!(ip, Ipv4Addr::new(10, 8, 0, 255));
        }
        assert!(p.acquire().is_err());
    }

    #[test]
    fn cursor_rotates_instead_of_reusing_immediately() {
        let p = pool("10.8.0.0/28", &[]);
        let first = p.acquire().unwrap();
        p.release(first);
        let second = p.acquire().unwrap();
        assert_ne!(first, second, "cursor should advance past a released slot");
    }

    #[test]
    fn tiny_cidr_rejected() {
        assert!(Pool::new("10.8.0.0/31".parse().unwrap(), &[]).is_err());
        assert!(Pool::new("10.8.0.0/30".parse().unwrap(), &[]).is_err());
    }

    #[test]
    fn concurrent_acquires_are_distinct() {
        use std::sync::Arc;
        let p = Arc::new(pool("10.8.0.0/24", &[Ipv4Addr::new(10, 8, 0, 1)]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                (0..30).map(|_| p.acquire().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len(), "no address handed out twice");
    }
}
