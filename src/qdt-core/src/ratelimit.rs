//! Token buckets for handshakes and per-session traffic.
//!
//! The handshake limiter combines a global bucket with a per-remote-host
//! map of buckets; the map is swept opportunistically, at most once per
//! TTL. The per-session limiter is a single bucket shared by both
//! directions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket refilled continuously at `rate` tokens per second up to
/// `burst`.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    inner: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Bucket starting full.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate: f64::from(rate),
            burst: f64::from(burst),
            inner: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Take one token; `false` means the caller must drop.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-remote-host bucket map with TTL-based eviction.
struct IpLimiter {
    rate: u32,
    burst: u32,
    ttl: Duration,
    inner: Mutex<IpLimiterState>,
}

struct IpLimiterState {
    entries: HashMap<String, IpEntry>,
    last_sweep: Instant,
}

struct IpEntry {
    bucket: TokenBucket,
    last_used: Instant,
}

impl IpLimiter {
    fn new(rate: u32, burst: u32, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() {
            Duration::from_secs(60)
        } else {
            ttl
        };
        Self {
            rate,
            burst,
            ttl,
            inner: Mutex::new(IpLimiterState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn allow(&self, host: &str) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(state.last_sweep) > self.ttl {
            let ttl = self.ttl;
            state
                .entries
                .retain(|_, entry| now.duration_since(entry.last_used) <= ttl);
            state.last_sweep = now;
        }
        let entry = state
            .entries
            .entry(host.to_string())
            .or_insert_with(|| IpEntry {
                bucket: TokenBucket::new(self.rate, self.burst),
                last_used: now,
            });
        entry.last_used = now;
        entry.bucket.allow()
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Combined global and per-host handshake limiter. Either bucket running
/// dry rejects the handshake.
pub struct HandshakeLimiter {
    global: Option<TokenBucket>,
    per_ip: Option<IpLimiter>,
}

impl HandshakeLimiter {
    /// Limiter from configured rates; a zero rate or burst disables that
    /// layer.
    pub fn new(
        global_rate: u32,
        global_burst: u32,
        ip_rate: u32,
        ip_burst: u32,
        ip_ttl: Duration,
    ) -> Self {
        let global = (global_rate > 0 && global_burst > 0)
            .then(|| TokenBucket::new(global_rate, global_burst));
        let per_ip =
            (ip_rate > 0 && ip_burst > 0).then(|| IpLimiter::new(ip_rate, ip_burst, ip_ttl));
        Self { global, per_ip }
    }

    /// Admit a handshake attempt from `host`.
    pub fn allow(&self, host: &str) -> bool {
        if let Some(global) = &self.global {
            if !global.allow() {
                return false;
            }
        }
        if let Some(per_ip) = &self.per_ip {
            if !host.is_empty() {
                return per_ip.allow(host);
            }
        }
        true
    }
}

/// Strip the port from a `host:port` remote address.
pub fn remote_host(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(idx) if addr[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => &addr[..idx],
        _ => addr.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_honors_burst() {
        let bucket = TokenBucket::new(1, 3);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow(), "burst exhausted");
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(10, 1);
        let start = Instant::now();
        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start));
        assert!(bucket.allow_at(start + Duration::from_millis(150)));
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let bucket = TokenBucket::new(1000, 2);
        let start = Instant::now();
        assert!(bucket.allow_at(start));
        // A long idle period still only accumulates `burst` tokens.
        let later = start + Duration::from_secs(60);
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn handshake_limiter_separates_hosts() {
        let limiter = HandshakeLimiter::new(0, 0, 1, 1, Duration::from_secs(60));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        assert!(limiter.allow("5.6.7.8"), "other hosts have their own bucket");
    }

    #[test]
    fn global_bucket_applies_across_hosts() {
        let limiter = HandshakeLimiter::new(1, 2, 0, 0, Duration::ZERO);
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("5.6.7.8"));
        assert!(!limiter.allow("9.9.9.9"));
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = HandshakeLimiter::new(0, 0, 0, 0, Duration::ZERO);
        for _ in 0..100 {
            assert!(limiter.allow("1.2.3.4"));
        }
    }

    #[test]
    fn idle_host_entries_are_swept() {
        let limiter = IpLimiter::new(100, 100, Duration::from_millis(20));
        assert!(limiter.allow("1.2.3.4"));
        assert_eq!(limiter.tracked(), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow("5.6.7.8"));
        assert_eq!(limiter.tracked(), 1, "stale entry evicted on access");
    }

    #[test]
    fn remote_host_strips_port() {
        assert_eq!(remote_host("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(remote_host("10.0.0.1"), "10.0.0.1");
        assert_eq!(remote_host(" 10.0.0.1 "), "10.0.0.1");
    }
}
