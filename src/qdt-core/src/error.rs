//! Error taxonomy for the tunnel datapath and control plane.
//!
//! Datapath errors are recovered locally (drop plus a counter); only
//! transport failures and explicit timeouts terminate a session. Boot-time
//! errors are surfaced through `anyhow` in the binaries.

use thiserror::Error;

/// Errors produced by framing, the codec, the pools, and the session
/// pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Datagram does not start with the `QDT` magic
    #[error("invalid datagram magic")]
    BadMagic,

    /// Datagram carries an unsupported protocol version
    #[error("unsupported datagram version {0}")]
    BadVersion(u8),

    /// Datagram too short or structurally invalid
    #[error("invalid datagram")]
    InvalidDatagram,

    /// Receive counter already admitted by the replay window
    #[error("replay detected")]
    Replay,

    /// Datagram addressed to a different session
    #[error("session id mismatch: got {got:#x}, want {want:#x}")]
    SessionMismatch { got: u64, want: u64 },

    /// Packet exceeds what fragmentation can carry
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Fragment plaintext shorter than the fragment subheader
    #[error("fragment payload too small")]
    FragmentTooSmall,

    /// Fragment overlaps an already received segment
    #[error("fragment overlap")]
    FragmentOverlap,

    /// Reassembly failed: bad total, gap, or size mismatch
    #[error("reassembly failed: {0}")]
    Reassembly(&'static str),

    /// No free address in the IPAM pool
    #[error("address pool exhausted")]
    PoolExhausted,

    /// Downstream queue is full
    #[error("backpressure: downstream queue full")]
    Backpressure,

    /// The QUIC connection or request stream is gone
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Configuration rejected at boot
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Shutdown or cancellation interrupted the operation
    #[error("cancelled")]
    Cancelled,

    /// Cryptographic failure from the cipher layer
    #[error(transparent)]
    Crypto(qdt_crypto::CryptoError),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<qdt_crypto::CryptoError> for Error {
    fn from(e: qdt_crypto::CryptoError) -> Self {
        match e {
            qdt_crypto::CryptoError::Replay => Error::Replay,
            other => Error::Crypto(other),
        }
    }
}

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;
