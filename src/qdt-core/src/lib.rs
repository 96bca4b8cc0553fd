//! # QDT Core
//!
//! Layer-3 VPN over an HTTP/3 request stream with QUIC datagrams carrying
//! the bulk payload.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Client                            │
//! │  ┌─────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ TUN │───│ Tunnel codec │───│ POST /connect stream │  │
//! │  └─────┘   │ AEAD + frag  │   │    (h3 over quinn)   │  │
//! │            └──────────────┘   └──────────┬───────────┘  │
//! └──────────────────────────────────────────┼──────────────┘
//!                     QUIC datagrams (lossy) │
//! ┌──────────────────────────────────────────┼──────────────┐
//! │                        Gateway           │               │
//! │  ┌─────┐  ┌─────────────────┐  ┌─────────┴────────────┐ │
//! │  │ TUN │──│ sharded session │──│ per-session pipeline │ │
//! │  │     │  │      table      │  │ recv / encode / send │ │
//! │  └─────┘  └─────────────────┘  └──────────────────────┘ │
//! │      ┌──────┐  ┌──────────────┐  ┌────────────────────┐ │
//! │      │ IPAM │  │ rate limiter │  │ Prometheus metrics │ │
//! │      └──────┘  └──────────────┘  └────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```

/// Pooled byte buffers reused across the datapath
pub mod bufpool;
/// VPN client runtime (dial, handshake, pump loops)
pub mod client;
/// Tunnel codec: packet -> sealed datagrams, datagram -> packet
pub mod codec;
/// Error taxonomy for the datapath and control plane
pub mod error;
/// Fragmentation and reassembly of oversized packets
pub mod fragment;
/// Handshake wire types for `POST /connect`
pub mod handshake;
/// Virtual IPv4 address pool
pub mod ipam;
/// IP header inspection helpers
pub mod iputil;
/// Tracing subscriber setup for the binaries
pub mod logging;
/// Counters and Prometheus text exposition
pub mod metrics;
/// Interface addressing, routes, NAT, and DNS collaborators
pub mod netcfg;
/// Token buckets for handshakes and per-session traffic
pub mod ratelimit;
/// Gateway server components
pub mod server;
/// Per-client session state and worker loops
pub mod session;
/// Sharded virtual-IP to session dispatch table
pub mod session_table;
/// Datagram transport abstraction over the QUIC connection
pub mod transport;
/// TUN device wrapper
pub mod tun;
/// Fixed datagram header framing
pub mod wire;

pub use error::{Error, Result};
