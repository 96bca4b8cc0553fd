//! QDT client runtime: dial, handshake, interface setup, pump loops.
//!
//! The client mirrors the gateway with exactly one session and no
//! dispatch table: one loop reads the interface and seals datagrams, the
//! other opens inbound datagrams and writes packets back. Key derivation
//! swaps roles relative to the gateway.

pub mod args;
pub mod tls;

pub use args::{Args, RouteMode};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, Bytes};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use qdt_crypto::{derive_key_material, new_handshake_nonce, CipherState, ReplayWindow};

use crate::codec::{Decoded, Tunnel};
use crate::error::Error;
use crate::handshake::{
    parse_connect_response, ConnectRequest, ConnectResponse, CONNECT_PATH, MAX_BODY_BYTES,
    TOKEN_HEADER,
};
use crate::netcfg::{self, Route};
use crate::transport::{DatagramConn, QuicDatagramConn};
use crate::tun::{TunConfig, TunDevice, TunReader, TunWriter};

/// Capabilities the client advertises.
const CLIENT_CAPS: [&str; 2] = ["fragment", "aead"];

/// Dial the gateway and run the tunnel until `shutdown` flips or the
/// transport fails.
pub async fn run(args: Args, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let tun = TunDevice::create(&TunConfig {
        name: args.tun_name.clone(),
        address: None,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        mtu: args.mtu as u16,
    })?;
    let tun_name = tun.name().to_string();

    let server_addr = resolve(&args.server).await?;
    let endpoint = {
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("wildcard addr"))
            .context("binding client endpoint")?;
        endpoint.set_default_client_config(tls::build_client_config(args.insecure)?);
        endpoint
    };

    let connecting = endpoint
        .connect(server_addr, args.server_host())
        .context("starting QUIC dial")?;
    let conn = tokio::time::timeout(Duration::from_secs(args.timeout), connecting)
        .await
        .map_err(|_| anyhow!("dial timed out after {}s", args.timeout))?
        .context("QUIC handshake")?;
    info!(remote = %conn.remote_address(), "connected to gateway");

    let (resp, client_nonce, connect_stream) = connect_handshake(&args, conn.clone()).await?;
    // The gateway binds the session to this request stream; keep it open
    // until the tunnel winds down.
    let _connect_stream = connect_stream;
    let client_ip: Ipv4Addr = resp.client_ip.parse().context("gateway sent bad client ip")?;
    info!(
        session = resp.session_id,
        ip = %client_ip,
        mtu = resp.mtu,
        "session established"
    );

    let tunnel = build_tunnel(&args, &resp, &client_nonce)?;
    let routes = configure_interface(&tun_name, &args, &resp)?;

    let transport = Arc::new(QuicDatagramConn::new(conn.clone()));
    let (tun_reader, tun_writer) = tun.split();

    let outbound = {
        let tunnel = Arc::clone(&tunnel);
        let transport = Arc::clone(&transport);
        tokio::spawn(pump_tun_to_conn(tunnel, transport, tun_reader))
    };
    let inbound = {
        let tunnel = Arc::clone(&tunnel);
        let transport = Arc::clone(&transport);
        tokio::spawn(pump_conn_to_tun(tunnel, transport, tun_writer))
    };

    let result: Result<()> = tokio::select! {
        _ = shutdown.changed() => Ok(()),
        r = outbound => match r {
            Ok(inner) => inner.context("outbound pump"),
            Err(e) => Err(anyhow!("outbound pump panicked: {e}")),
        },
        r = inbound => match r {
            Ok(inner) => inner.context("inbound pump"),
            Err(e) => Err(anyhow!("inbound pump panicked: {e}")),
        },
    };

    netcfg::delete_routes(&tun_name, &routes);
    conn.close(0u32.into(), b"bye");
    endpoint.wait_idle().await;
    result
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("resolving {server}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {server}"))
}

type ConnectStream = h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// `POST /connect` over a fresh HTTP/3 request stream. The stream is kept
/// open after the response: the gateway binds the session's lifetime to
/// it. Returns the response, the client nonce key derivation needs, and
/// the still-open request stream.
async fn connect_handshake(
    args: &Args,
    conn: quinn::Connection,
) -> Result<(ConnectResponse, [u8; 16], ConnectStream)> {
    let (mut driver, mut send_request) =
        h3::client::new(h3_quinn::Connection::new(conn))
            .await
            .context("h3 client setup")?;
    tokio::spawn(async move {
        let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let client_nonce = new_handshake_nonce();
    let request_body = serde_json::to_vec(&ConnectRequest::new(
        &client_nonce,
        args.mtu,
        CLIENT_CAPS.iter().map(|s| s.to_string()).collect(),
        args.client_id.clone(),
        std::env::consts::OS.to_string(),
    ))
    .context("encoding connect request")?;

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("https://{}{}", args.server_host(), CONNECT_PATH))
        .header(TOKEN_HEADER, &args.token)
        .header("content-type", "application/json")
        .body(())
        .context("building connect request")?;

    let mut stream = send_request
        .send_request(request)
        .await
        .context("sending connect request")?;
    stream
        .send_data(Bytes::from(request_body))
        .await
        .context("sending connect body")?;

    let response = stream.recv_response().await.context("reading response")?;
    if response.status() != http::StatusCode::OK {
        let mut detail = Vec::new();
        while let Ok(Some(mut chunk)) = stream.recv_data().await {
            while chunk.has_remaining() {
                let piece = chunk.chunk();
                detail.extend_from_slice(piece);
                let advanced = piece.len();
                chunk.advance(advanced);
            }
            if detail.len() > MAX_BODY_BYTES {
                break;
            }
        }
        bail!(
            "connect failed: {} ({})",
            response.status(),
            String::from_utf8_lossy(&detail)
        );
    }

    let mut body: Vec<u8> = Vec::new();
    let resp = loop {
        if !body.is_empty() {
            if let Ok(resp) = parse_connect_response(&body) {
                break resp;
            }
            if body.len() > MAX_BODY_BYTES {
                bail!("connect response too large");
            }
        }
        match stream.recv_data().await.context("reading response body")? {
            Some(mut chunk) => {
                while chunk.has_remaining() {
                    let piece = chunk.chunk();
                    body.extend_from_slice(piece);
                    let advanced = piece.len();
                    chunk.advance(advanced);
                }
            }
            None => break parse_connect_response(&body).context("parsing connect response")?,
        }
    };

    // Validate the server nonce up front so a bad handshake fails here,
    // not in key derivation.
    crate::handshake::decode_nonce(&resp.server_nonce).context("decoding server nonce")?;
    Ok((resp, client_nonce, stream))
}

fn build_tunnel(args: &Args, resp: &ConnectResponse, client_nonce: &[u8]) -> Result<Arc<Tunnel>> {
    let server_nonce = crate::handshake::decode_nonce(&resp.server_nonce)?;
    let km = derive_key_material(&args.token, client_nonce, &server_nonce)?;
    let (send, recv) = CipherState::client_pair(&km, ReplayWindow::new(2048))?;
    let mtu = if resp.mtu > 0 { resp.mtu } else { args.mtu };
    Ok(Arc::new(Tunnel::with_limits(
        resp.session_id,
        mtu,
        send,
        recv,
        args.max_reassembly_bytes,
    )))
}

/// Configure address, routes, and DNS from the handshake response.
fn configure_interface(tun_name: &str, args: &Args, resp: &ConnectResponse) -> Result<Vec<Route>> {
    let prefix = resp
        .cidr
        .rsplit('/')
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or_else(|| anyhow!("gateway sent bad cidr {}", resp.cidr))?;
    let addr = format!("{}/{}", resp.client_ip, prefix);
    netcfg::configure_interface(tun_name, &addr, resp.mtu as u16)?;

    let routes = build_routes(args.route_mode, resp);
    netcfg::add_routes(tun_name, &routes).context("installing routes")?;

    let dns = if args.dns.is_empty() { &resp.dns } else { &args.dns };
    netcfg::set_dns(tun_name, dns);
    Ok(routes)
}

fn build_routes(mode: RouteMode, resp: &ConnectResponse) -> Vec<Route> {
    match mode {
        RouteMode::None => Vec::new(),
        RouteMode::Cidr => vec![Route {
            dest: resp.cidr.clone(),
            gateway: resp.gateway_ip.clone(),
        }],
        RouteMode::Default => vec![Route {
            dest: "0.0.0.0/0".into(),
            gateway: resp.gateway_ip.clone(),
        }],
    }
}

/// Interface -> transport: read packets, seal, send.
async fn pump_tun_to_conn(
    tunnel: Arc<Tunnel>,
    transport: Arc<QuicDatagramConn>,
    mut reader: TunReader,
) -> Result<()> {
    let mut buf = vec![0u8; crate::codec::MAX_PACKET_SIZE];
    loop {
        let n = reader.read_packet(&mut buf).await?;
        let result = tunnel.encode_packet(
            &buf[..n],
            |size| Some(Vec::with_capacity(size)),
            |datagram| transport.send_datagram(&datagram),
        );
        match result {
            Ok(()) => {}
            Err(Error::TransportClosed(reason)) => bail!("transport closed: {reason}"),
            Err(e) => {
                // Oversize or codec trouble on one packet; shed it.
                trace!(err = %e, "packet encode failed");
            }
        }
    }
}

/// Transport -> interface: receive datagrams, open, write packets.
async fn pump_conn_to_tun(
    tunnel: Arc<Tunnel>,
    transport: Arc<QuicDatagramConn>,
    mut writer: TunWriter,
) -> Result<()> {
    let mut dst = Vec::with_capacity(crate::codec::MAX_PACKET_SIZE);
    loop {
        let raw = transport.receive_datagram().await.map_err(|e| anyhow!("{e}"))?;
        dst.clear();
        match tunnel.decode_datagram_into(&mut dst, &raw) {
            Ok(Decoded::InPlace) => writer.write_packet(&dst).await?,
            Ok(Decoded::Assembled(pkt)) => writer.write_packet(&pkt).await?,
            Ok(Decoded::None) => {}
            Ok(Decoded::Close) => {
                info!("gateway closed the session");
                return Ok(());
            }
            Err(e) => {
                debug!(err = %e, "datagram decode failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_building_matches_mode() {
        let resp = ConnectResponse {
            version: 1,
            session_id: 1,
            server_nonce: String::new(),
            mtu: 1350,
            client_ip: "10.8.0.2".into(),
            gateway_ip: "10.8.0.1".into(),
            cidr: "10.8.0.0/24".into(),
            dns: vec![],
            caps: vec![],
        };
        assert!(build_routes(RouteMode::None, &resp).is_empty());
        let cidr = build_routes(RouteMode::Cidr, &resp);
        assert_eq!(cidr[0].dest, "10.8.0.0/24");
        assert_eq!(cidr[0].gateway, "10.8.0.1");
        assert_eq!(build_routes(RouteMode::Default, &resp)[0].dest, "0.0.0.0/0");
    }
}
