//! QDT gateway: HTTP/3 handshake endpoint, interface loops, and session
//! lifecycle.
//!
//! One `POST /connect` request stream per client. The response is written
//! and flushed, then the handler parks on the session's close notification
//! so the stream stays open for the session's lifetime. Bulk traffic never
//! touches the stream; it rides QUIC datagrams on the same connection.

pub mod args;
pub mod tls;

pub use args::Args;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use h3::server::{Connection as H3Connection, RequestStream};
use http::StatusCode;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bufpool::BufferPool;
use crate::codec::{Tunnel, MAX_PACKET_SIZE};
use crate::error::Error;
use crate::handshake::{
    parse_connect_request, ConnectRequest, ConnectResponse, CONNECT_PATH, MAX_BODY_BYTES,
    TOKEN_HEADER,
};
use crate::ipam::Pool;
use crate::iputil::packet_dest_v4;
use crate::metrics::{DropReason, HandshakeResult, Metrics};
use crate::netcfg;
use crate::ratelimit::{HandshakeLimiter, TokenBucket};
use crate::session::{Session, SessionParams};
use crate::session_table::SessionTable;
use crate::transport::QuicDatagramConn;
use crate::tun::{TunConfig, TunDevice, TunReader, TunWriter};
use crate::wire::PROTOCOL_VERSION;

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Capabilities the gateway advertises back to clients.
const SERVER_CAPS: [&str; 2] = ["fragment", "aead"];

/// Gateway state shared across connections.
pub struct Server {
    cfg: Args,
    token: String,
    gateway_ip: Ipv4Addr,
    metrics: Arc<Metrics>,
    pool: Arc<Pool>,
    packet_pool: Arc<BufferPool>,
    datagram_pool: Arc<BufferPool>,
    sessions: Arc<SessionTable>,
    hs_limiter: HandshakeLimiter,
    tun_write_tx: mpsc::Sender<Vec<u8>>,
}

impl Server {
    /// Build the gateway. `token` comes from [`tls::ensure_server_assets`].
    pub fn new(
        cfg: Args,
        token: String,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>)> {
        cfg.validate().map_err(Error::ConfigInvalid)?;
        let gateway_ip = cfg.gateway_ip();
        let pool = Arc::new(Pool::new(cfg.pool_cidr, &[gateway_ip])?);
        let (tun_write_tx, tun_write_rx) = mpsc::channel(4096);
        let hs_limiter = HandshakeLimiter::new(
            cfg.handshake_rate_pps,
            cfg.handshake_rate_burst,
            cfg.handshake_ip_rate_pps,
            cfg.handshake_ip_rate_burst,
            Duration::from_secs(cfg.handshake_ip_rate_ttl),
        );
        let server = Arc::new(Self {
            sessions: Arc::new(SessionTable::new(cfg.session_shards())),
            packet_pool: Arc::new(BufferPool::new(MAX_PACKET_SIZE, 1024)),
            datagram_pool: Arc::new(BufferPool::new(cfg.mtu.max(1280), 4096)),
            hs_limiter,
            tun_write_tx,
            gateway_ip,
            token,
            metrics,
            pool,
            cfg,
        });
        Ok((server, tun_write_rx))
    }

    /// Run the gateway until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        tun_write_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let tun = TunDevice::create(&TunConfig {
            name: self.cfg.tun_name.clone(),
            address: Some(self.gateway_ip),
            netmask: self.cfg.pool_cidr.mask(),
            mtu: self.cfg.mtu as u16,
        })?;
        let tun_name = tun.name().to_string();
        let (tun_reader, tun_writer) = tun.split();

        if let Err(e) = netcfg::enable_ip_forwarding() {
            warn!(err = %e, "IPv4 forwarding not enabled");
        }
        if self.cfg.nat {
            netcfg::setup_nat(self.cfg.pool_cidr, &self.cfg.nat_external_iface)?;
        }

        let certs = tls::load_certs(&self.cfg.tls_cert)?;
        let key = tls::load_key(&self.cfg.tls_key)?;
        let server_config = tls::build_server_config(certs, key)?;
        let endpoint = quinn::Endpoint::server(server_config, self.cfg.addr)
            .context("binding QUIC endpoint")?;

        tokio::spawn(crate::metrics::serve_metrics(
            self.cfg.metrics_addr,
            Arc::clone(&self.metrics),
        ));
        if let Some(health_addr) = self.cfg.health_addr {
            tokio::spawn(crate::metrics::serve_metrics(
                health_addr,
                Arc::clone(&self.metrics),
            ));
        }

        {
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.tun_read_loop(tun_reader, shutdown).await });
        }
        {
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                server
                    .tun_write_loop(tun_writer, tun_write_rx, shutdown)
                    .await
            });
        }
        {
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.session_sweep_loop(shutdown).await });
        }

        self.metrics.set_ready(true);
        info!(addr = %self.cfg.addr, tun = %tun_name, pool = %self.cfg.pool_cidr, "gateway ready");

        loop {
            let incoming = tokio::select! {
                _ = shutdown.changed() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => server.handle_connection(conn).await,
                    Err(e) => debug!(err = %e, "connection attempt failed"),
                }
            });
        }

        self.metrics.set_ready(false);
        endpoint.close(0u32.into(), b"shutdown");
        for session in self.sessions.snapshot() {
            session.close(Some(&Error::Cancelled));
        }
        if self.cfg.nat {
            netcfg::cleanup_nat(self.cfg.pool_cidr, &self.cfg.nat_external_iface);
        }
        info!("gateway stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, conn: quinn::Connection) {
        let remote = conn.remote_address();
        debug!(%remote, "connection established");
        let mut h3: H3Connection<h3_quinn::Connection, Bytes> =
            match H3Connection::new(h3_quinn::Connection::new(conn.clone())).await {
                Ok(h3) => h3,
                Err(e) => {
                    debug!(%remote, err = %e, "h3 connection setup failed");
                    return;
                }
            };
        loop {
            match h3.accept().await {
                Ok(Some(resolver)) => {
                    let server = Arc::clone(&self);
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        match resolver.resolve_request().await {
                            Ok((request, stream)) => {
                                server.handle_request(request, stream, conn).await;
                            }
                            Err(e) => debug!(err = %e, "request resolve failed"),
                        }
                    });
                }
                Ok(None) => {
                    debug!(%remote, "h3 connection closed");
                    break;
                }
                Err(e) => {
                    debug!(%remote, err = %e, "h3 accept error");
                    break;
                }
            }
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        request: http::Request<()>,
        mut stream: H3Stream,
        conn: quinn::Connection,
    ) {
        if request.uri().path() != CONNECT_PATH {
            self.reject(&mut stream, StatusCode::NOT_FOUND, None, "not found")
                .await;
            return;
        }
        if request.method() != http::Method::POST {
            self.reject(
                &mut stream,
                StatusCode::METHOD_NOT_ALLOWED,
                Some(HandshakeResult::BadRequest),
                "method not allowed",
            )
            .await;
            return;
        }
        if !self.metrics.is_ready() {
            self.reject(
                &mut stream,
                StatusCode::SERVICE_UNAVAILABLE,
                Some(HandshakeResult::Internal),
                "not ready",
            )
            .await;
            return;
        }
        let presented = request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !qdt_crypto::ct_eq(presented.as_bytes(), self.token.as_bytes()) {
            self.reject(
                &mut stream,
                StatusCode::UNAUTHORIZED,
                Some(HandshakeResult::Unauthorized),
                "unauthorized",
            )
            .await;
            return;
        }
        let remote_host = conn.remote_address().ip().to_string();
        if !self.hs_limiter.allow(&remote_host) {
            self.reject(
                &mut stream,
                StatusCode::TOO_MANY_REQUESTS,
                Some(HandshakeResult::RateLimited),
                "rate limited",
            )
            .await;
            return;
        }
        if self.cfg.max_sessions > 0 && self.sessions.len() >= self.cfg.max_sessions {
            self.reject(
                &mut stream,
                StatusCode::SERVICE_UNAVAILABLE,
                Some(HandshakeResult::ServerFull),
                "server busy",
            )
            .await;
            return;
        }

        let req = match read_connect_request(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) | Err(_) => {
                self.reject(
                    &mut stream,
                    StatusCode::BAD_REQUEST,
                    Some(HandshakeResult::BadRequest),
                    "bad request",
                )
                .await;
                return;
            }
        };
        let client_nonce = match crate::handshake::decode_nonce(&req.client_nonce) {
            Ok(nonce) => nonce,
            Err(_) => {
                self.reject(
                    &mut stream,
                    StatusCode::BAD_REQUEST,
                    Some(HandshakeResult::BadRequest),
                    "bad nonce",
                )
                .await;
                return;
            }
        };

        let client_ip = match self.pool.acquire() {
            Ok(ip) => ip,
            Err(_) => {
                self.reject(
                    &mut stream,
                    StatusCode::SERVICE_UNAVAILABLE,
                    Some(HandshakeResult::PoolExhausted),
                    "address pool exhausted",
                )
                .await;
                return;
            }
        };
        // Release the address on every exit path until the session's close
        // callback takes ownership of it.
        let mut ip_guard = IpGuard {
            pool: &self.pool,
            ip: client_ip,
            armed: true,
        };

        let server_nonce = qdt_crypto::new_handshake_nonce();
        let session_id = crate::handshake::new_session_id();
        let mtu = if req.mtu > 0 {
            req.mtu.min(self.cfg.mtu)
        } else {
            self.cfg.mtu
        };

        let tunnel = match self.build_tunnel(session_id, mtu, &client_nonce, &server_nonce) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(err = %e, "key derivation failed");
                self.reject(
                    &mut stream,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(HandshakeResult::Internal),
                    "internal error",
                )
                .await;
                return;
            }
        };

        let limiter = (self.cfg.rate_limit_pps > 0 && self.cfg.rate_limit_burst > 0).then(|| {
            Arc::new(TokenBucket::new(
                self.cfg.rate_limit_pps,
                self.cfg.rate_limit_burst,
            ))
        });
        let on_close = {
            let sessions = Arc::clone(&self.sessions);
            let pool = Arc::clone(&self.pool);
            let metrics = Arc::clone(&self.metrics);
            Box::new(move |sess: &Session, _err: Option<&Error>| {
                sessions.remove(sess);
                pool.release(sess.client_ip());
                metrics.session_closed();
            })
        };
        let session = Session::new(SessionParams {
            id: session_id,
            client_ip,
            conn: Arc::new(QuicDatagramConn::new(conn)),
            tunnel: Arc::new(tunnel),
            packet_pool: Arc::clone(&self.packet_pool),
            datagram_pool: Arc::clone(&self.datagram_pool),
            tun_write_tx: self.tun_write_tx.clone(),
            limiter,
            metrics: Arc::clone(&self.metrics),
            send_workers: self.cfg.send_workers(),
            send_queue: self.cfg.send_queue,
            send_batch: self.cfg.send_batch,
            on_close,
        });

        let resp = ConnectResponse {
            version: PROTOCOL_VERSION,
            session_id,
            server_nonce: crate::handshake::encode_nonce(&server_nonce),
            mtu,
            client_ip: client_ip.to_string(),
            gateway_ip: self.gateway_ip.to_string(),
            cidr: self.cfg.pool_cidr.to_string(),
            dns: self.cfg.dns.clone(),
            caps: SERVER_CAPS.iter().map(|s| s.to_string()).collect(),
        };
        let body = match serde_json::to_vec(&resp) {
            Ok(body) => body,
            Err(e) => {
                error!(err = %e, "response encoding failed");
                self.reject(
                    &mut stream,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(HandshakeResult::Internal),
                    "internal error",
                )
                .await;
                return;
            }
        };
        let response = http::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(())
            .expect("static response");
        if stream.send_response(response).await.is_err()
            || stream.send_data(Bytes::from(body)).await.is_err()
        {
            self.metrics.handshake(HandshakeResult::Internal);
            return;
        }

        // Registration hands address ownership to the close callback.
        self.sessions.add(Arc::clone(&session));
        self.metrics.session_opened();
        ip_guard.armed = false;
        self.metrics.handshake(HandshakeResult::Ok);
        info!(
            session = session_id,
            ip = %client_ip,
            mtu,
            client_id = %req.client_id,
            platform = %req.platform,
            "session established"
        );

        session.start();
        // The request stream stays open for the session's lifetime.
        session.closed().await;
        let _ = stream.finish().await;
    }

    fn build_tunnel(
        &self,
        session_id: u64,
        mtu: usize,
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Result<Tunnel> {
        let km = qdt_crypto::derive_key_material(&self.token, client_nonce, server_nonce)?;
        let replay = qdt_crypto::ReplayWindow::new(2048);
        let (send, recv) = qdt_crypto::CipherState::server_pair(&km, replay)?;
        Ok(Tunnel::with_limits(
            session_id,
            mtu,
            send,
            recv,
            self.cfg.max_reassembly_bytes,
        ))
    }

    async fn reject(
        &self,
        stream: &mut H3Stream,
        status: StatusCode,
        result: Option<HandshakeResult>,
        message: &'static str,
    ) {
        if let Some(result) = result {
            self.metrics.handshake(result);
        }
        let response = http::Response::builder()
            .status(status)
            .body(())
            .expect("static response");
        if stream.send_response(response).await.is_ok() {
            let _ = stream.send_data(Bytes::from_static(message.as_bytes())).await;
        }
        let _ = stream.finish().await;
    }

    /// Read packets off the interface and dispatch them to sessions by
    /// destination address.
    async fn tun_read_loop(
        self: Arc<Self>,
        mut reader: TunReader,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let mut buf = self.packet_pool.get();
            buf.resize(self.packet_pool.capacity(), 0);
            let n = tokio::select! {
                _ = shutdown.changed() => return,
                r = reader.read_packet(&mut buf) => match r {
                    Ok(n) => n,
                    Err(e) => {
                        error!(err = %e, "TUN read error");
                        return;
                    }
                },
            };
            if n == 0 {
                self.packet_pool.put(buf);
                continue;
            }
            buf.truncate(n);
            let Some(dst) = packet_dest_v4(&buf) else {
                self.packet_pool.put(buf);
                self.metrics.drop_packet(DropReason::BadPacket);
                continue;
            };
            let Some(session) = self.sessions.get_by_ip(dst) else {
                self.packet_pool.put(buf);
                self.metrics.drop_packet(DropReason::NoSession);
                continue;
            };
            if let Err(buf) = session.enqueue(buf) {
                self.packet_pool.put(buf);
                self.metrics.drop_packet(DropReason::QueueFull);
            }
        }
    }

    /// Drain the shared write channel into the interface.
    async fn tun_write_loop(
        self: Arc<Self>,
        mut writer: TunWriter,
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let pkt = tokio::select! {
                _ = shutdown.changed() => return,
                pkt = rx.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => return,
                },
            };
            if let Err(e) = writer.write_packet(&pkt).await {
                error!(err = %e, "TUN write error");
            }
            self.packet_pool.put(pkt);
        }
    }

    /// Close sessions idle past the configured timeout.
    async fn session_sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let timeout_nanos = Duration::from_secs(self.cfg.session_timeout).as_nanos() as i64;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            let now = crate::session::now_unix_nanos();
            for session in self.sessions.snapshot() {
                if now - session.last_seen() > timeout_nanos {
                    info!(session = session.id(), ip = %session.client_ip(), "closing idle session");
                    session.close(None);
                }
            }
        }
    }
}

/// Releases a pool address unless disarmed by successful registration.
struct IpGuard<'a> {
    pool: &'a Pool,
    ip: Ipv4Addr,
    armed: bool,
}

impl Drop for IpGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.ip);
        }
    }
}

/// Accumulate body chunks until a complete `ConnectRequest` parses. The
/// client keeps the stream open after the body, so this must not wait for
/// end-of-stream.
async fn read_connect_request(stream: &mut H3Stream) -> Result<Option<ConnectRequest>> {
    let mut body: Vec<u8> = Vec::new();
    loop {
        if !body.is_empty() {
            if let Ok(req) = parse_connect_request(&body) {
                return Ok(Some(req));
            }
            if body.len() > MAX_BODY_BYTES {
                return Ok(None);
            }
        }
        match stream.recv_data().await {
            Ok(Some(mut chunk)) => {
                while chunk.has_remaining() {
                    let piece = chunk.chunk();
                    body.extend_from_slice(piece);
                    let advanced = piece.len();
                    chunk.advance(advanced);
                }
            }
            Ok(None) => {
                return Ok(parse_connect_request(&body).ok());
            }
            Err(e) => return Err(e.into()),
        }
    }
}
