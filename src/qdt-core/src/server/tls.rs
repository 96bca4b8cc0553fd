//! TLS and QUIC configuration for the gateway, plus first-run bootstrap
//! of a self-signed certificate and token.

use anyhow::{anyhow, Context, Result};
use quinn::{ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

/// Load TLS certificates from a PEM file.
pub fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert file {path:?}"))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parsing certificates")
}

/// Load a private key from a PEM file.
pub fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {path:?}"))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .context("parsing private key")?
        .ok_or_else(|| anyhow!("no private key found in {path:?}"))
}

/// Build the QUIC server configuration: TLS 1.3, ALPN `h3`, datagrams
/// enabled, 10 s keep-alive, 30 s idle timeout.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    transport_config.keep_alive_interval(Some(Duration::from_secs(10)));
    transport_config.datagram_receive_buffer_size(Some(65536));
    transport_config.datagram_send_buffer_size(65536);

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building rustls server config")?;
    rustls_config.alpn_protocols = vec![b"h3".to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(rustls_config))
        .context("building QUIC server crypto")?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config));
    Ok(server_config)
}

/// First-run bootstrap: generate a self-signed certificate when the
/// configured cert or key file is absent, and a random token when none is
/// configured. Returns the token to use.
pub fn ensure_server_assets(cert_path: &Path, key_path: &Path, token: &str) -> Result<String> {
    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(cert_path, key_path)?;
    }
    if token.is_empty() {
        let token = random_token();
        warn!(token = %token, "no token configured, generated one; clients must use it");
        return Ok(token);
    }
    Ok(token.to_string())
}

fn random_token() -> String {
    let mut secret = [0u8; 32];
    qdt_crypto::rng::fill(&mut secret);
    STANDARD_NO_PAD.encode(secret)
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("generating self-signed certificate")?;

    if let Some(dir) = cert_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).context("creating cert directory")?;
        }
    }
    std::fs::write(cert_path, certified.cert.pem()).context("writing certificate")?;
    std::fs::write(key_path, certified.key_pair.serialize_pem()).context("writing key")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .context("restricting key permissions")?;
    }
    info!(cert = %cert_path.display(), key = %key_path.display(), "self-signed certificate generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_generates_cert_and_token() {
        let dir = std::env::temp_dir().join(format!("qdt-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");

        let token = ensure_server_assets(&cert, &key, "").unwrap();
        assert!(!token.is_empty());
        assert!(cert.exists());
        assert!(key.exists());

        // Generated PEMs load back.
        let certs = load_certs(&cert).unwrap();
        assert!(!certs.is_empty());
        load_key(&key).unwrap();

        // A configured token is passed through untouched.
        let kept = ensure_server_assets(&cert, &key, "configured").unwrap();
        assert_eq!(kept, "configured");

        std::fs::remove_dir_all(&dir).ok();
    }
}
