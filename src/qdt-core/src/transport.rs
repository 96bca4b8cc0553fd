//! Datagram transport abstraction.
//!
//! The codec and session pipelines depend on this trait, not on the QUIC
//! stack, so tests can drive them with an in-memory loop.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Unreliable datagram channel attached to one client's connection.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    /// Send one datagram. Must not block on peer consumption; transport
    /// failure means the connection is gone.
    fn send_datagram(&self, data: &[u8]) -> Result<()>;

    /// Receive one datagram. Resolves with [`Error::TransportClosed`] when
    /// the connection ends. Cancel-safe: dropping the future loses no data.
    async fn receive_datagram(&self) -> Result<Bytes>;
}

/// Production transport: the QUIC connection underneath the HTTP/3
/// request stream.
pub struct QuicDatagramConn {
    conn: quinn::Connection,
}

impl QuicDatagramConn {
    pub fn new(conn: quinn::Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatagramConn for QuicDatagramConn {
    fn send_datagram(&self, data: &[u8]) -> Result<()> {
        self.conn
            .send_datagram(Bytes::copy_from_slice(data))
            .map_err(|e| Error::TransportClosed(e.to_string()))
    }

    async fn receive_datagram(&self) -> Result<Bytes> {
        self.conn
            .read_datagram()
            .await
            .map_err(|e| Error::TransportClosed(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory datagram loop used by pipeline tests.

    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// One endpoint of a bidirectional in-memory datagram channel.
    pub struct LoopConn {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    }

    /// Connected pair of [`LoopConn`]s.
    pub fn pair() -> (LoopConn, LoopConn) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            LoopConn {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            LoopConn {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
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
}
