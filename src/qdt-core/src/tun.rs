//! TUN device wrapper with async split halves.

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tun::{Tun, TunBuilder};
use tracing::info;

/// Parameters for creating a TUN device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (empty for kernel-assigned).
    pub name: String,
    /// Interface address; `None` when the address arrives later (client
    /// side, after the handshake).
    pub address: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

/// A created TUN device, not yet split.
pub struct TunDevice {
    name: String,
    tun: Tun,
}

impl TunDevice {
    /// Create (and bring up) a TUN device.
    pub fn create(config: &TunConfig) -> Result<Self> {
        let mut builder = TunBuilder::new();
        if !config.name.is_empty() {
            builder = builder.name(&config.name);
        }
        if let Some(address) = config.address {
            builder = builder.address(address).netmask(config.netmask);
        }
        let tun = builder
            .mtu(config.mtu as i32)
            .up()
            .try_build()
            .context("creating TUN device")?;
        let name = tun.name().to_string();
        info!(name = %name, mtu = config.mtu, "TUN device created");
        Ok(Self { name, tun })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into independent read and write halves.
    pub fn split(self) -> (TunReader, TunWriter) {
        let (read, write) = tokio::io::split(self.tun);
        (TunReader { inner: read }, TunWriter { inner: write })
    }
}

/// Read half of a TUN device.
pub struct TunReader {
    inner: ReadHalf<Tun>,
}

impl TunReader {
    /// Read one IP packet into `buf`, returning its length.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf).await.context("reading TUN")?;
        if n == 0 {
            bail!("TUN device closed");
        }
        Ok(n)
    }
}

/// Write half of a TUN device.
pub struct TunWriter {
    inner: WriteHalf<Tun>,
}

impl TunWriter {
    /// Write one IP packet.
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.inner.write_all(packet).await.context("writing TUN")?;
        Ok(())
    }
}
