//! Daemon options.

use std::net::IpAddr;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use wormhole_common::PskConfig;

use crate::kernel::KernelNet;

pub const DEFAULT_CIDR: &str = "100.65.0.0/14";
pub const DEFAULT_PORT_RANGE: &str = "4500-4599";
pub const DEFAULT_KEYFILE: &str = "/etc/wormhole/key.secret";

/// Resolved daemon configuration, shared by every subsystem.
#[derive(Debug, Clone)]
pub struct Options {
    /// Validated bind addresses (`tcp://host:port` or `unix://path`).
    pub hosts: Vec<String>,
    /// External IP used as the tunnel source and advertised to peers.
    pub external: IpAddr,
    /// Overlay CIDR; must match on every cooperating host.
    pub cidr: Ipv4Net,
    /// Inclusive UDP encap port range.
    pub udp_start_port: u16,
    pub udp_end_port: u16,
    pub psk: PskConfig,
}

/// Parse an inclusive `P1-P2` port range; a single port means `P1-P1`.
pub fn parse_port_range(ports: &str) -> Result<(u16, u16)> {
    let mut parts = ports.splitn(2, '-');
    let start: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("port range {} is not valid", ports))?;
    let end: u16 = match parts.next() {
        Some(p) => p
            .parse()
            .with_context(|| format!("port range {} is not valid", ports))?,
        None => start,
    };
    Ok((start, end))
}

/// Resolve the external IP: an explicit `-I` wins, otherwise the source of
/// the default route.
pub fn resolve_external(kernel: &dyn KernelNet, explicit: Option<IpAddr>) -> Result<IpAddr> {
    if let Some(ip) = explicit {
        return Ok(ip);
    }
    crate::tunnel::route_source(kernel, None)
        .context("failed to find default route ip, please specify -I")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("4500-4599").unwrap(), (4500, 4599));
        assert_eq!(parse_port_range("4500").unwrap(), (4500, 4500));
        assert!(parse_port_range("ports").is_err());
        assert!(parse_port_range("4500-x").is_err());
    }
}
