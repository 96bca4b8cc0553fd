//! End-to-end session pipeline over an in-memory transport: a client-role
//! codec on one side, a full gateway session (receive loop, encode
//! workers, datagram send loop) on the other.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use qdt_core::bufpool::BufferPool;
use qdt_core::codec::{Decoded, Tunnel};
use qdt_core::error::{Error, Result};
use qdt_core::metrics::Metrics;
use qdt_core::session::{Session, SessionParams};
use qdt_core::session_table::SessionTable;
use qdt_core::transport::DatagramConn;
use qdt_crypto::{derive_key_material, CipherState, ReplayWindow};

const SESSION_ID: u64 = 7;
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);

/// One endpoint of an in-memory bidirectional datagram channel.
struct LoopConn {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

fn conn_pair() -> (LoopConn, LoopConn) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        LoopConn { tx: a_tx, rx: Mutex::new(b_rx) },
        LoopConn { tx: b_tx, rx: Mutex::new(a_rx) },
    )
}

#[async_trait]
impl DatagramConn for LoopConn {
    fn send_datagram(&self, data: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| Error::TransportClosed("loop closed".into()))
    }

    async fn receive_datagram(&self) -> Result<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::TransportClosed("loop closed".into()))
    }
}

fn tunnel_pair(mtu: usize) -> (Tunnel, Tunnel) {
    let mut cn = [0u8; 16];
    let mut sn = [0u8; 16];
    for i in 0..16 {
        cn[i] = 7 * i as u8;
        sn[i] = 3 + i as u8;
    }
    let km = derive_key_material("pipeline-token", &cn, &sn).unwrap();
    let (cs, cr) = CipherState::client_pair(&km, ReplayWindow::new(2048)).unwrap();
    let (ss, sr) = CipherState::server_pair(&km, ReplayWindow::new(2048)).unwrap();
    (
        Tunnel::new(SESSION_ID, mtu, cs, cr),
        Tunnel::new(SESSION_ID, mtu, ss, sr),
    )
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, len: usize) -> Vec<u8> {
    let mut pkt = vec![0u8; len.max(20)];
    pkt[0] = 0x45;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt
}

struct Rig {
    session: Arc<Session>,
    table: Arc<SessionTable>,
    client_tunnel: Tunnel,
    client_conn: LoopConn,
    tun_write_rx: mpsc::Receiver<Vec<u8>>,
}

fn rig(mtu: usize) -> Rig {
    let (client_conn, server_conn) = conn_pair();
    let (client_tunnel, server_tunnel) = tunnel_pair(mtu);
    let metrics = Arc::new(Metrics::new());
    let table = Arc::new(SessionTable::new(8));
    let (tun_write_tx, tun_write_rx) = mpsc::channel(64);

    let on_close = {
        let table = Arc::clone(&table);
        let metrics = Arc::clone(&metrics);
        Box::new(move |sess: &Session, _: Option<&Error>| {
            table.remove(sess);
            metrics.session_closed();
        })
    };
    let session = Session::new(SessionParams {
        id: SESSION_ID,
        client_ip: CLIENT_IP,
        conn: Arc::new(server_conn),
        tunnel: Arc::new(server_tunnel),
        packet_pool: Arc::new(BufferPool::new(65535, 64)),
        datagram_pool: Arc::new(BufferPool::new(mtu.max(1280), 64)),
        tun_write_tx,
        limiter: None,
        metrics: Arc::clone(&metrics),
        send_workers: 2,
        send_queue: 64,
        send_batch: 4,
        on_close,
    });
    table.add(Arc::clone(&session));
    metrics.session_opened();
    session.start();
    Rig {
        session,
        table,
        client_tunnel,
        client_conn,
        tun_write_rx,
    }
}

#[tokio::test]
async fn fragmented_packet_crosses_the_session() {
    let mut rig = rig(400);
    let mut pkt = ipv4_packet(CLIENT_IP, Ipv4Addr::new(1, 1, 1, 1), 2000);
    for (i, b) in pkt.iter_mut().enumerate().skip(20) {
        *b = (i % 241) as u8;
    }

    let mut dgrams = Vec::new();
    rig.client_tunnel
        .encode_packet(
            &pkt,
            |size| Some(Vec::with_capacity(size)),
            |buf| {
                dgrams.push(buf);
                Ok(())
            },
        )
        .unwrap();
    assert!(dgrams.len() >= 6);
    for d in dgrams {
        rig.client_conn.send_datagram(&d).unwrap();
    }

    let forwarded = tokio::time::timeout(Duration::from_secs(2), rig.tun_write_rx.recv())
        .await
        .expect("reassembled in time")
        .expect("channel open");
    assert_eq!(forwarded, pkt);
    rig.session.close(None);
}

#[tokio::test]
async fn outbound_fragments_reassemble_at_the_client() {
    let rig = rig(400);
    let mut pkt = ipv4_packet(CLIENT_IP, Ipv4Addr::new(9, 9, 9, 9), 3000);
    for (i, b) in pkt.iter_mut().enumerate().skip(20) {
        *b = (i % 127) as u8;
    }
    rig.session.enqueue(pkt.clone()).expect("queue has room");

    let mut assembled = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while assembled.is_none() {
        let raw = tokio::time::timeout_at(deadline, rig.client_conn.receive_datagram())
            .await
            .expect("datagrams in time")
            .expect("transport open");
        let mut dst = Vec::new();
        match rig.client_tunnel.decode_datagram_into(&mut dst, &raw).unwrap() {
            Decoded::InPlace => assembled = Some(dst),
            Decoded::Assembled(p) => assembled = Some(p),
            Decoded::None => {}
            Decoded::Close => panic!("unexpected close"),
        }
    }
    assert_eq!(assembled.unwrap(), pkt);
    rig.session.close(None);
}

#[tokio::test]
async fn table_dispatch_and_close_cleanup() {
    let rig = rig(1350);
    let key = u32::from(CLIENT_IP);
    assert!(rig.table.get_by_ip(key).is_some());
    assert_eq!(rig.table.len(), 1);

    rig.session.close(None);
    rig.session.closed().await;
    assert!(rig.table.get_by_ip(key).is_none(), "close callback removes the session");
    assert!(rig.table.is_empty());
}

#[tokio::test]
async fn peer_close_datagram_tears_down_the_session() {
    let rig = rig(1350);
    let close = rig
        .client_tunnel
        .encode_close(&mut |size: usize| Some(Vec::with_capacity(size)))
        .unwrap();
    rig.client_conn.send_datagram(&close).unwrap();

    tokio::time::timeout(Duration::from_secs(2), rig.session.closed())
        .await
        .expect("session closes on peer Close");
    assert!(rig.table.is_empty());
}

#[tokio::test]
async fn many_small_packets_keep_order_independent_content() {
    let mut rig = rig(1350);
    let mut sent = Vec::new();
    for i in 0..50u8 {
        let mut pkt = ipv4_packet(CLIENT_IP, Ipv4Addr::new(1, 1, 1, 1), 64);
        pkt[30] = i;
        sent.push(pkt.clone());
        let mut dgrams = Vec::new();
        rig.client_tunnel
            .encode_packet(
                &pkt,
                |size| Some(Vec::with_capacity(size)),
                |buf| {
                    dgrams.push(buf);
                    Ok(())
                },
            )
            .unwrap();
        for d in dgrams {
            rig.client_conn.send_datagram(&d).unwrap();
        }
    }
    let mut received = Vec::new();
    for _ in 0..50 {
        let pkt = tokio::time::timeout(Duration::from_secs(2), rig.tun_write_rx.recv())
            .await
            .expect("all packets arrive")
            .expect("channel open");
        received.push(pkt);
    }
    // In-memory transport preserves order; every payload must survive
    // seal/open byte-exact.
    assert_eq!(received, sent);
    rig.session.close(None);
}
