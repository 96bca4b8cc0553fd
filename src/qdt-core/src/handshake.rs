//! Handshake wire protocol for `POST /connect`.
//!
//! The request carries the client's handshake nonce, MTU, capabilities,
//! and identity hints; the response assigns the session id, the server
//! nonce, the negotiated MTU, and the client's network configuration.
//! Bodies are JSON, capped at [`MAX_BODY_BYTES`].

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use qdt_crypto::HANDSHAKE_NONCE_LEN;

use crate::error::{Error, Result};
use crate::wire::PROTOCOL_VERSION;

/// Handshake endpoint path.
pub const CONNECT_PATH: &str = "/connect";

/// Header carrying the pre-shared token.
pub const TOKEN_HEADER: &str = "x-qdt-token";

/// Cap on handshake body size, both directions.
pub const MAX_BODY_BYTES: usize = 4096;

/// Client hello sent as the `/connect` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub version: u8,
    /// Base64 (standard, unpadded) 16-byte nonce.
    pub client_nonce: String,
    #[serde(default)]
    pub mtu: usize,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub platform: String,
}

impl ConnectRequest {
    pub fn new(
        client_nonce: &[u8],
        mtu: usize,
        caps: Vec<String>,
        client_id: String,
        platform: String,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_nonce: encode_nonce(client_nonce),
            mtu,
            caps,
            client_id,
            platform,
        }
    }
}

/// Server reply carrying the session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub version: u8,
    pub session_id: u64,
    /// Base64 (standard, unpadded) 16-byte nonce.
    pub server_nonce: String,
    pub mtu: usize,
    /// Assigned virtual address, dotted quad.
    pub client_ip: String,
    pub gateway_ip: String,
    /// Pool CIDR, `a.b.c.d/N`.
    pub cidr: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
}

/// Encode a handshake nonce for JSON transport.
pub fn encode_nonce(nonce: &[u8]) -> String {
    STANDARD_NO_PAD.encode(nonce)
}

/// Decode and length-check a handshake nonce.
pub fn decode_nonce(s: &str) -> Result<[u8; HANDSHAKE_NONCE_LEN]> {
    let bytes = STANDARD_NO_PAD
        .decode(s)
        .map_err(|_| Error::ConfigInvalid("nonce is not valid base64".into()))?;
    let arr: [u8; HANDSHAKE_NONCE_LEN] = bytes
        .try_into()
        .map_err(|_| Error::ConfigInvalid("nonce must be 16 bytes".into()))?;
    Ok(arr)
}

/// Parse and validate a `ConnectRequest` body.
pub fn parse_connect_request(body: &[u8]) -> Result<ConnectRequest> {
    if body.len() > MAX_BODY_BYTES {
        return Err(Error::ConfigInvalid("request body too large".into()));
    }
    let req: ConnectRequest = serde_json::from_slice(body)
        .map_err(|e| Error::ConfigInvalid(format!("invalid connect request: {e}")))?;
    if req.version != PROTOCOL_VERSION {
        return Err(Error::ConfigInvalid(format!(
            "unsupported protocol version {}",
            req.version
        )));
    }
    Ok(req)
}

/// Parse and validate a `ConnectResponse` body.
pub fn parse_connect_response(body: &[u8]) -> Result<ConnectResponse> {
    if body.len() > MAX_BODY_BYTES {
        return Err(Error::ConfigInvalid("response body too large".into()));
    }
    let resp: ConnectResponse = serde_json::from_slice(body)
        .map_err(|e| Error::ConfigInvalid(format!("invalid connect response: {e}")))?;
    if resp.version != PROTOCOL_VERSION {
        return Err(Error::ConfigInvalid(format!(
            "unsupported protocol version {}",
            resp.version
        )));
    }
    Ok(resp)
}

/// Random session identifier.
pub fn new_session_id() -> u64 {
    qdt_crypto::rng::random_u64()
}
