//! CLI argument definitions for the QDT client.

use clap::Parser;

/// Route installation policy after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RouteMode {
    /// Send all traffic through the tunnel.
    Default,
    /// Route only the tunnel CIDR.
    Cidr,
    /// Install no routes.
    None,
}

/// QDT client CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "qdt-client", version, about = "QDT VPN client over HTTP/3 datagrams")]
pub struct Args {
    /// Gateway address, host:port
    #[arg(long)]
    pub server: String,

    /// Pre-shared token
    #[arg(long)]
    pub token: String,

    /// Requested tunnel MTU (the gateway may lower it)
    #[arg(long, default_value_t = 1350)]
    pub mtu: usize,

    /// TUN device name
    #[arg(long, default_value = "qdt0")]
    pub tun_name: String,

    /// Route mode
    #[arg(long, value_enum, default_value_t = RouteMode::Default)]
    pub route_mode: RouteMode,

    /// DNS servers to install (defaults to the gateway's advertisement)
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Log level: debug|info|warn|error
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long, default_value_t = false)]
    pub log_json: bool,

    /// Skip TLS certificate verification (lab use)
    #[arg(long, default_value_t = false)]
    pub insecure: bool,

    /// Dial timeout (seconds)
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Client identifier reported in the handshake
    #[arg(long, default_value = "")]
    pub client_id: String,

    /// Cap on a reassembled packet (bytes)
    #[arg(long, default_value_t = 65535)]
    pub max_reassembly_bytes: usize,
}

impl Args {
    /// Host part of the server address, used for SNI.
    pub fn server_host(&self) -> &str {
        match self.server.rfind(':') {
            Some(idx) => &self.server[..idx],
            None => &self.server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_host_strips_port() {
        let args = Args::parse_from(["qdt-client", "--server", "vpn.example.com:443", "--token", "t"]);
        assert_eq!(args.server_host(), "vpn.example.com");
        assert_eq!(args.route_mode, RouteMode::Default);
    }

    #[test]
    fn route_mode_parses() {
        let args = Args::parse_from([
            "qdt-client",
            "--server",
            "gw:443",
            "--token",
            "t",
            "--route-mode",
            "cidr",
        ]);
        assert_eq!(args.route_mode, RouteMode::Cidr);
    }
}
