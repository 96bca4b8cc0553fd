//! Host network configuration collaborators.
//!
//! Thin wrappers around `ip`, `iptables`, `resolvectl`, and
//! `/proc/sys`. Boot-time interface and NAT setup failures are fatal for
//! the caller; cleanup paths only warn.

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use std::process::Command;
use tracing::{debug, info, warn};

/// A route pushed onto the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination in CIDR notation.
    pub dest: String,
    /// Gateway address, dotted quad.
    pub gateway: String,
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("running {program}"))?;
    if !status.success() {
        bail!("{program} {} failed with {status}", args.join(" "));
    }
    Ok(())
}

/// Assign `addr` (CIDR) to `iface` and set its MTU. The device is already
/// up from the TUN builder; this covers the client path where the address
/// arrives after the handshake.
pub fn configure_interface(iface: &str, addr: &str, mtu: u16) -> Result<()> {
    run("ip", &["addr", "replace", addr, "dev", iface])?;
    run("ip", &["link", "set", iface, "mtu", &mtu.to_string()])?;
    run("ip", &["link", "set", iface, "up"])?;
    info!(iface, addr, mtu, "interface configured");
    Ok(())
}

/// Enable IPv4 forwarding.
pub fn enable_ip_forwarding() -> Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .context("enabling IPv4 forwarding")?;
    info!("IPv4 forwarding enabled");
    Ok(())
}

/// Masquerade pool traffic out of `external_iface`.
pub fn setup_nat(pool: Ipv4Network, external_iface: &str) -> Result<()> {
    run(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &pool.to_string(),
            "-o",
            external_iface,
            "-j",
            "MASQUERADE",
        ],
    )?;
    info!(pool = %pool, iface = external_iface, "NAT masquerade installed");
    Ok(())
}

/// Remove the masquerade rule installed by [`setup_nat`]. Warn-only.
pub fn cleanup_nat(pool: Ipv4Network, external_iface: &str) {
    let result = run(
        "iptables",
        &[
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            &pool.to_string(),
            "-o",
            external_iface,
            "-j",
            "MASQUERADE",
        ],
    );
    if let Err(e) = result {
        warn!(err = %e, "NAT cleanup failed");
    }
}

/// Install routes over `iface`.
pub fn add_routes(iface: &str, routes: &[Route]) -> Result<()> {
    for route in routes {
        run(
            "ip",
            &[
                "route", "replace", &route.dest, "via", &route.gateway, "dev", iface,
            ],
        )?;
        debug!(dest = %route.dest, gateway = %route.gateway, "route installed");
    }
    Ok(())
}

/// Remove routes installed by [`add_routes`]. Warn-only.
pub fn delete_routes(iface: &str, routes: &[Route]) {
    for route in routes {
        if let Err(e) = run("ip", &["route", "del", &route.dest, "dev", iface]) {
            warn!(dest = %route.dest, err = %e, "route cleanup failed");
        }
    }
}

/// Point the interface's DNS at `servers` via resolvectl. Warn-only: DNS
/// is best-effort and the tunnel works without it.
pub fn set_dns(iface: &str, servers: &[String]) {
    if servers.is_empty() {
        return;
    }
    let mut args = vec!["dns", iface];
    for server in servers {
        args.push(server.as_str());
    }
    match run("resolvectl", &args) {
        Ok(()) => debug!(iface, ?servers, "DNS configured"),
        Err(e) => warn!(iface, err = %e, "resolvectl failed, DNS not configured"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_equality() {
        let a = Route {
            dest: "0.0.0.0/0".into(),
            gateway: "10.8.0.1".into(),
        };
        assert_eq!(a, a.clone());
    }
}
