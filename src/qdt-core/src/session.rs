//! Per-client session: cipher state, queues, and worker loops.
//!
//! Each session owns three kinds of workers on the gateway:
//!
//! 1. one receive loop draining datagrams from the transport into the
//!    shared interface write channel,
//! 2. `send_workers` encode workers sealing outbound packets from the
//!    bounded send queue,
//! 3. one datagram send loop serializing calls into the transport.
//!
//! Every queue drops instead of blocking when its downstream is slower;
//! drops are counted by reason. The only conditions that terminate a
//! session are transport failures, a peer `Close`, and the idle sweep.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::bufpool::BufferPool;
use crate::codec::{Decoded, Tunnel};
use crate::error::Error;
use crate::iputil::packet_source_v4;
use crate::metrics::{DropReason, Metrics};
use crate::ratelimit::TokenBucket;
use crate::transport::DatagramConn;

/// Callback invoked exactly once when the session closes.
pub type CloseFn = Box<dyn FnOnce(&Session, Option<&Error>) + Send>;

/// Tunables and collaborators handed to [`Session::new`].
pub struct SessionParams {
    pub id: u64,
    pub client_ip: Ipv4Addr,
    pub conn: Arc<dyn DatagramConn>,
    pub tunnel: Arc<Tunnel>,
    /// Pool for decoded packets and outbound plaintext.
    pub packet_pool: Arc<BufferPool>,
    /// Pool for sealed datagrams.
    pub datagram_pool: Arc<BufferPool>,
    /// Shared channel into the interface write loop.
    pub tun_write_tx: mpsc::Sender<Vec<u8>>,
    /// Single bucket covering both directions; `None` disables limiting.
    pub limiter: Option<Arc<TokenBucket>>,
    pub metrics: Arc<Metrics>,
    pub send_workers: usize,
    pub send_queue: usize,
    pub send_batch: usize,
    pub on_close: CloseFn,
}

/// One client's live tunnel on the gateway.
pub struct Session {
    id: u64,
    client_ip: Ipv4Addr,
    ip4: u32,
    conn: Arc<dyn DatagramConn>,
    tunnel: Arc<Tunnel>,
    packet_pool: Arc<BufferPool>,
    datagram_pool: Arc<BufferPool>,
    tun_write_tx: mpsc::Sender<Vec<u8>>,
    limiter: Option<Arc<TokenBucket>>,
    metrics: Arc<Metrics>,

    send_workers: usize,
    send_batch: usize,
    send_tx: mpsc::Sender<Vec<u8>>,
    send_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    dg_tx: mpsc::Sender<Vec<u8>>,
    dg_rx: AsyncMutex<Option<mpsc::Receiver<Vec<u8>>>>,

    last_seen: AtomicI64,
    closed_tx: watch::Sender<bool>,
    close_started: AtomicBool,
    on_close: Mutex<Option<CloseFn>>,
}

/// Current time as unix nanoseconds, the clock `last_seen` runs on.
pub fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Session {
    pub fn new(params: SessionParams) -> Arc<Self> {
        let send_workers = params.send_workers.max(1);
        let send_queue = if params.send_queue == 0 {
            4096
        } else {
            params.send_queue
        };
        let send_batch = params.send_batch.max(1);
        let (send_tx, send_rx) = mpsc::channel(send_queue);
        let (dg_tx, dg_rx) = mpsc::channel(send_queue);
        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: params.id,
            client_ip: params.client_ip,
            ip4: u32::from(params.client_ip),
            conn: params.conn,
            tunnel: params.tunnel,
            packet_pool: params.packet_pool,
            datagram_pool: params.datagram_pool,
            tun_write_tx: params.tun_write_tx,
            limiter: params.limiter,
            metrics: params.metrics,
            send_workers,
            send_batch,
            send_tx,
            send_rx: AsyncMutex::new(send_rx),
            dg_tx,
            dg_rx: AsyncMutex::new(Some(dg_rx)),
            last_seen: AtomicI64::new(now_unix_nanos()),
            closed_tx,
            close_started: AtomicBool::new(false),
            on_close: Mutex::new(Some(params.on_close)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_ip(&self) -> Ipv4Addr {
        self.client_ip
    }

    /// Virtual address as a host-order u32, the dispatch key.
    pub fn ip4(&self) -> u32 {
        self.ip4
    }

    /// Unix nanoseconds of the last datagram in either direction.
    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_seen.store(now_unix_nanos(), Ordering::Relaxed);
    }

    /// Spawn the receive loop, the encode workers, and the datagram send
    /// loop.
    pub fn start(self: &Arc<Self>) {
        let recv = Arc::clone(self);
        tokio::spawn(async move { recv.recv_loop().await });

        let send = Arc::clone(self);
        tokio::spawn(async move { send.send_loop().await });

        for _ in 0..self.send_workers {
            let worker = Arc::clone(self);
            tokio::spawn(async move { worker.encode_loop().await });
        }
    }

    /// Hand an outbound packet to the encode pipeline without blocking.
    /// The buffer comes back on overflow so the caller can repool it.
    pub fn enqueue(&self, pkt: Vec<u8>) -> std::result::Result<(), Vec<u8>> {
        match self.send_tx.try_send(pkt) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(pkt))
            | Err(mpsc::error::TrySendError::Closed(pkt)) => Err(pkt),
        }
    }

    /// Close the session. Idempotent: the first caller wins, fires the
    /// close notification, and runs the close callback.
    pub fn close(&self, err: Option<&Error>) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(err) = err {
            debug!(session = self.id, ip = %self.client_ip, %err, "session closed");
        } else {
            debug!(session = self.id, ip = %self.client_ip, "session closed");
        }
        let _ = self.closed_tx.send(true);
        let callback = self.on_close.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(callback) = callback {
            callback(self, err);
        }
    }

    /// Resolve once [`Session::close`] has run.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            if self.is_closed() {
                return;
            }
            let raw = tokio::select! {
                _ = closed.changed() => return,
                r = self.conn.receive_datagram() => match r {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.close(Some(&e));
                        return;
                    }
                },
            };
            if let Some(limiter) = &self.limiter {
                if !limiter.allow() {
                    self.metrics.drop_packet(DropReason::RateIn);
                    continue;
                }
            }
            let mut dst = self.packet_pool.get();
            match self.tunnel.decode_datagram_into(&mut dst, &raw) {
                Ok(Decoded::InPlace) => {}
                Ok(Decoded::Assembled(pkt)) => {
                    // Keep the pool contract: forward pooled buffers only.
                    if pkt.len() <= dst.capacity() {
                        dst.clear();
                        dst.extend_from_slice(&pkt);
                    } else {
                        self.packet_pool.put(dst);
                        self.metrics.drop_packet(DropReason::DecodeOversize);
                        continue;
                    }
                }
                Ok(Decoded::None) => {
                    self.packet_pool.put(dst);
                    continue;
                }
                Ok(Decoded::Close) => {
                    self.packet_pool.put(dst);
                    self.close(None);
                    return;
                }
                Err(Error::Replay) => {
                    self.packet_pool.put(dst);
                    self.metrics.drop_packet(DropReason::Replay);
                    continue;
                }
                Err(e) => {
                    self.packet_pool.put(dst);
                    trace!(session = self.id, %e, "datagram decode failed");
                    self.metrics.drop_packet(DropReason::Decode);
                    continue;
                }
            }
            match packet_source_v4(&dst) {
                Some(src) if src == self.ip4 => {}
                Some(_) => {
                    self.packet_pool.put(dst);
                    self.metrics.drop_packet(DropReason::SrcMismatch);
                    continue;
                }
                None => {
                    self.packet_pool.put(dst);
                    self.metrics.drop_packet(DropReason::BadPacket);
                    continue;
                }
            }
            self.touch();
            let len = dst.len();
            match self.tun_write_tx.try_send(dst) {
                Ok(()) => self.metrics.packet_in(len),
                Err(mpsc::error::TrySendError::Full(buf)) => {
                    self.packet_pool.put(buf);
                    self.metrics.drop_packet(DropReason::TunBackpressure);
                }
                Err(mpsc::error::TrySendError::Closed(buf)) => {
                    self.packet_pool.put(buf);
                    return;
                }
            }
        }
    }

    async fn encode_loop(self: Arc<Self>) {
        let mut closed = self.closed_tx.subscribe();
        let mut datagrams: Vec<Vec<u8>> = Vec::new();
        loop {
            // Take the receiver lock only to pull a batch; encoding runs
            // unlocked so workers overlap.
            let batch = {
                let mut rx = self.send_rx.lock().await;
                let first = tokio::select! {
                    _ = closed.changed() => return,
                    pkt = rx.recv() => match pkt {
                        Some(pkt) => pkt,
                        None => return,
                    },
                };
                let mut batch = Vec::with_capacity(self.send_batch);
                batch.push(first);
                while batch.len() < self.send_batch {
                    match rx.try_recv() {
                        Ok(pkt) => batch.push(pkt),
                        Err(_) => break,
                    }
                }
                batch
            };
            for pkt in batch {
                if self.process_encode(pkt, &mut datagrams).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn process_encode(
        &self,
        pkt: Vec<u8>,
        datagrams: &mut Vec<Vec<u8>>,
    ) -> std::result::Result<(), ()> {
        if let Some(limiter) = &self.limiter {
            if !limiter.allow() {
                self.metrics.drop_packet(DropReason::RateOut);
                self.packet_pool.put(pkt);
                return Ok(());
            }
        }
        datagrams.clear();
        let encoded = self.tunnel.encode_packet(
            &pkt,
            |size| {
                let buf = self.datagram_pool.get();
                if buf.capacity() < size {
                    self.datagram_pool.put(buf);
                    self.metrics.drop_packet(DropReason::DatagramOversize);
                    None
                } else {
                    Some(buf)
                }
            },
            |buf| {
                datagrams.push(buf);
                Ok(())
            },
        );
        match encoded {
            Ok(()) => {}
            Err(e) => {
                // Per-packet failure: shed the packet, keep the session.
                trace!(session = self.id, %e, "packet encode failed");
                for buf in datagrams.drain(..) {
                    self.datagram_pool.put(buf);
                }
                self.packet_pool.put(pkt);
                return Ok(());
            }
        }
        self.metrics.packet_out(pkt.len());
        self.touch();
        self.packet_pool.put(pkt);

        let mut closed = self.closed_tx.subscribe();
        for buf in datagrams.drain(..) {
            tokio::select! {
                _ = closed.changed() => return Err(()),
                res = self.dg_tx.send(buf) => {
                    if res.is_err() {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_loop(self: Arc<Self>) {
        let mut rx = self
            .dg_rx
            .lock()
            .await
            .take()
            .expect("send loop started once");
        let mut closed = self.closed_tx.subscribe();
        loop {
            let first = tokio::select! {
                _ = closed.changed() => return,
                dg = rx.recv() => match dg {
                    Some(dg) => dg,
                    None => return,
                },
            };
            if self.send_datagram(first).is_err() {
                return;
            }
            for _ in 1..self.send_batch {
                match rx.try_recv() {
                    Ok(dg) => {
                        if self.send_datagram(dg).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    fn send_datagram(&self, dg: Vec<u8>) -> std::result::Result<(), ()> {
        let result = self.conn.send_datagram(&dg);
        self.datagram_pool.put(dg);
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close(Some(&e));
                Err(())
            }
        }
    }
}
