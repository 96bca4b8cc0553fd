//! CLI argument definitions for the QDT gateway.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// QDT gateway CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "qdt-server", version, about = "QDT VPN gateway over HTTP/3 datagrams")]
pub struct Args {
    /// QUIC/HTTP3 listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    pub addr: SocketAddr,

    /// TLS certificate file (PEM); generated self-signed when missing
    #[arg(long, default_value = "cert.pem")]
    pub tls_cert: PathBuf,

    /// TLS private key file (PEM); generated when missing
    #[arg(long, default_value = "key.pem")]
    pub tls_key: PathBuf,

    /// Pre-shared client token; generated and logged when empty
    #[arg(long, default_value = "")]
    pub token: String,

    /// Tunnel MTU advertised to clients
    #[arg(long, default_value_t = 1350)]
    pub mtu: usize,

    /// TUN device name
    #[arg(long, default_value = "qdt0")]
    pub tun_name: String,

    /// Client address pool in CIDR notation
    #[arg(long, default_value = "10.8.0.0/24")]
    pub pool_cidr: Ipv4Network,

    /// Gateway address inside the pool; defaults to the first host
    #[arg(long)]
    pub gateway_ip: Option<Ipv4Addr>,

    /// DNS servers pushed to clients (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Metrics + health listen address
    #[arg(long, default_value = "0.0.0.0:9100")]
    pub metrics_addr: SocketAddr,

    /// Separate health listen address (optional)
    #[arg(long)]
    pub health_addr: Option<SocketAddr>,

    /// Log level: debug|info|warn|error
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long, default_value_t = false)]
    pub log_json: bool,

    /// Close sessions idle longer than this (seconds)
    #[arg(long, default_value_t = 120)]
    pub session_timeout: u64,

    /// Cap on a reassembled packet (bytes)
    #[arg(long, default_value_t = 65535)]
    pub max_reassembly_bytes: usize,

    /// Refuse handshakes beyond this many live sessions (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_sessions: usize,

    /// Global handshake rate (per second)
    #[arg(long, default_value_t = 100)]
    pub handshake_rate_pps: u32,

    /// Global handshake burst
    #[arg(long, default_value_t = 200)]
    pub handshake_rate_burst: u32,

    /// Per-host handshake rate (per second)
    #[arg(long, default_value_t = 20)]
    pub handshake_ip_rate_pps: u32,

    /// Per-host handshake burst
    #[arg(long, default_value_t = 40)]
    pub handshake_ip_rate_burst: u32,

    /// Per-host limiter entry TTL (seconds)
    #[arg(long, default_value_t = 60)]
    pub handshake_ip_rate_ttl: u64,

    /// Per-session packet rate (per second, both directions; 0 disables)
    #[arg(long, default_value_t = 10000)]
    pub rate_limit_pps: u32,

    /// Per-session packet burst
    #[arg(long, default_value_t = 20000)]
    pub rate_limit_burst: u32,

    /// Encode workers per session (0 = CPU count)
    #[arg(long, default_value_t = 0)]
    pub send_workers: usize,

    /// Per-session send queue depth
    #[arg(long, default_value_t = 4096)]
    pub send_queue: usize,

    /// Channel drain batch size
    #[arg(long, default_value_t = 4)]
    pub send_batch: usize,

    /// Session table shards (0 = 4 x CPU count)
    #[arg(long, default_value_t = 0)]
    pub session_shards: usize,

    /// Masquerade pool traffic through the external interface
    #[arg(long, default_value_t = false)]
    pub nat: bool,

    /// External interface for NAT (e.g. eth0)
    #[arg(long, default_value = "")]
    pub nat_external_iface: String,
}

impl Args {
    /// Gateway address, defaulting to the first host in the pool.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(self.pool_cidr.network()) + 1))
    }

    /// Encode workers per session, resolved.
    pub fn send_workers(&self) -> usize {
        if self.send_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.send_workers
        }
    }

    /// Session table shard count, resolved.
    pub fn session_shards(&self) -> usize {
        if self.session_shards == 0 {
            4 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(16)
        } else {
            self.session_shards
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.mtu < 64 {
            return Err(format!("mtu {} is too small", self.mtu));
        }
        if self.nat && self.nat_external_iface.is_empty() {
            return Err("nat requires --nat-external-iface".into());
        }
        if !self.pool_cidr.contains(self.gateway_ip()) {
            return Err(format!(
                "gateway ip {} is outside pool {}",
                self.gateway_ip(),
                self.pool_cidr
            ));
        }
        Ok(())
    }
}
