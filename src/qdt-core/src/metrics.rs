//! Gateway counters and Prometheus text exposition.
//!
//! Counters are plain atomics bumped on the datapath; the exposition
//! endpoint renders them on demand. Served together with `/healthz` by
//! [`serve_metrics`].

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

/// Reasons a packet or datagram is dropped on the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RateIn,
    RateOut,
    QueueFull,
    TunBackpressure,
    Replay,
    Decode,
    SrcMismatch,
    BadPacket,
    NoSession,
    DatagramOversize,
    DecodeOversize,
}

impl DropReason {
    const ALL: [DropReason; 11] = [
        DropReason::RateIn,
        DropReason::RateOut,
        DropReason::QueueFull,
        DropReason::TunBackpressure,
        DropReason::Replay,
        DropReason::Decode,
        DropReason::SrcMismatch,
        DropReason::BadPacket,
        DropReason::NoSession,
        DropReason::DatagramOversize,
        DropReason::DecodeOversize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::RateIn => "rate_in",
            DropReason::RateOut => "rate_out",
            DropReason::QueueFull => "queue_full",
            DropReason::TunBackpressure => "tun_backpressure",
            DropReason::Replay => "replay",
            DropReason::Decode => "decode",
            DropReason::SrcMismatch => "src_mismatch",
            DropReason::BadPacket => "bad_packet",
            DropReason::NoSession => "no_session",
            DropReason::DatagramOversize => "datagram_oversize",
            DropReason::DecodeOversize => "decode_oversize",
        }
    }
}

/// Handshake outcomes for `qdt_handshakes_total{result=...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    Ok,
    Unauthorized,
    RateLimited,
    BadRequest,
    PoolExhausted,
    ServerFull,
    Internal,
}

impl HandshakeResult {
    const ALL: [HandshakeResult; 7] = [
        HandshakeResult::Ok,
        HandshakeResult::Unauthorized,
        HandshakeResult::RateLimited,
        HandshakeResult::BadRequest,
        HandshakeResult::PoolExhausted,
        HandshakeResult::ServerFull,
        HandshakeResult::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeResult::Ok => "ok",
            HandshakeResult::Unauthorized => "unauthorized",
            HandshakeResult::RateLimited => "rate_limited",
            HandshakeResult::BadRequest => "bad_request",
            HandshakeResult::PoolExhausted => "pool_exhausted",
            HandshakeResult::ServerFull => "server_full",
            HandshakeResult::Internal => "internal",
        }
    }
}

/// All gateway counters. Constructed once at boot and shared by reference.
#[derive(Default)]
pub struct Metrics {
    sessions_active: AtomicI64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    drops: [AtomicU64; DropReason::ALL.len()],
    handshakes: [AtomicU64; HandshakeResult::ALL.len()],
    ready: AtomicBool,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn packet_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn drop_packet(&self, reason: DropReason) {
        let idx = DropReason::ALL
            .iter()
            .position(|r| *r == reason)
            .expect("known reason");
        self.drops[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake(&self, result: HandshakeResult) {
        let idx = HandshakeResult::ALL
            .iter()
            .position(|r| *r == result)
            .expect("known result");
        self.handshakes[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn drop_count(&self, reason: DropReason) -> u64 {
        let idx = DropReason::ALL.iter().position(|r| *r == reason).unwrap();
        self.drops[idx].load(Ordering::Relaxed)
    }

    /// Render every counter in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        let _ = writeln!(out, "# TYPE qdt_sessions_active gauge");
        let _ = writeln!(
            out,
            "qdt_sessions_active {}",
            self.sessions_active.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# TYPE qdt_packets_total counter");
        let _ = writeln!(
            out,
            "qdt_packets_total{{direction=\"in\"}} {}",
            self.packets_in.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "qdt_packets_total{{direction=\"out\"}} {}",
            self.packets_out.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# TYPE qdt_bytes_total counter");
        let _ = writeln!(
            out,
            "qdt_bytes_total{{direction=\"in\"}} {}",
            self.bytes_in.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "qdt_bytes_total{{direction=\"out\"}} {}",
            self.bytes_out.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# TYPE qdt_drops_total counter");
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            let _ = writeln!(
                out,
                "qdt_drops_total{{reason=\"{}\"}} {}",
                reason.as_str(),
                self.drops[i].load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE qdt_handshakes_total counter");
        for (i, result) in HandshakeResult::ALL.iter().enumerate() {
            let _ = writeln!(
                out,
                "qdt_handshakes_total{{result=\"{}\"}} {}",
                result.as_str(),
                self.handshakes[i].load(Ordering::Relaxed)
            );
        }
        out
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.to_prometheus()
}

async fn health_handler(State(metrics): State<Arc<Metrics>>) -> (StatusCode, &'static str) {
    if metrics.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve `/metrics` and `/healthz` on `addr` until the process exits.
pub async fn serve_metrics(addr: SocketAddr, metrics: Arc<Metrics>) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(metrics);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, err = %e, "metrics listener bind failed");
            return;
        }
    };
    info!(%addr, "metrics server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(err = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition_format() {
        let m = Metrics::new();
        m.session_opened();
        m.packet_in(100);
        m.packet_out(200);
        m.packet_out(50);
        m.drop_packet(DropReason::Replay);
        m.drop_packet(DropReason::Replay);
        m.handshake(HandshakeResult::Ok);

        let text = m.to_prometheus();
        assert!(text.contains("qdt_sessions_active 1"));
        assert!(text.contains("qdt_packets_total{direction=\"in\"} 1"));
        assert!(text.contains("qdt_packets_total{direction=\"out\"} 2"));
        assert!(text.contains("qdt_bytes_total{direction=\"out\"} 250"));
        assert!(text.contains("qdt_drops_total{reason=\"replay\"} 2"));
        assert!(text.contains("qdt_handshakes_total{result=\"ok\"} 1"));
        assert!(text.contains("# TYPE qdt_drops_total counter"));
    }

    #[test]
    fn every_drop_reason_is_exported() {
        let m = Metrics::new();
        let text = m.to_prometheus();
        for reason in DropReason::ALL {
            assert!(
                text.contains(&format!("reason=\"{}\"", reason.as_str())),
                "missing {}",
                reason.as_str()
            );
        }
    }

    #[test]
    fn session_gauge_goes_up_and_down() {
        let m = Metrics::new();
        m.session_opened();
        m.session_opened();
        m.session_closed();
        assert_eq!(m.sessions_active(), 1);
    }

    #[test]
    fn readiness_defaults_to_false() {
        let m = Metrics::new();
        assert!(!m.is_ready());
        m.set_ready(true);
        assert!(m.is_ready());
    }
}
