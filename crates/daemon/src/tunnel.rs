//! Overlay tunnel manager.
//!
//! Owns the overlay-IP and encap-port pools, the registry of installed
//! tunnels keyed by peer external IP, and the two-party construction
//! handshake. Tunnel halves are installed idempotently: an `AlreadyExists`
//! from the kernel is swallowed, and a `BuildTunnel` for a peer we already
//! have simply returns the existing record, so racing initiators converge on
//! the same tunnel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use ipnet::IpNet;
use log::{error, info, warn};
use rand::rngs::OsRng;
use rand::Rng;
use rand::RngCore;
use wormhole_common::{ErrorKind, PeerClient, Tunnel};

use crate::config::Options;
use crate::kernel::{
    Encap, EncapSocket, KernelError, KernelNet, Route, XfrmDir, XfrmPolicy, XfrmState, LOOPBACK,
};

struct TunnelEntry {
    tunnel: Tunnel,
    listener: Option<EncapSocket>,
}

pub struct TunnelManager {
    opts: Arc<Options>,
    kernel: Arc<dyn KernelNet>,
    tunnels: Mutex<HashMap<IpAddr, TunnelEntry>>,
    used_ips: Mutex<HashSet<IpAddr>>,
    unused_ports: Mutex<VecDeque<u16>>,
}

impl TunnelManager {
    pub fn new(opts: Arc<Options>, kernel: Arc<dyn KernelNet>) -> TunnelManager {
        let ports = (opts.udp_start_port..=opts.udp_end_port).collect();
        TunnelManager {
            opts,
            kernel,
            tunnels: Mutex::new(HashMap::new()),
            used_ips: Mutex::new(HashSet::new()),
            unused_ports: Mutex::new(ports),
        }
    }

    fn add_tunnel(&self, key: IpAddr, tunnel: Tunnel, listener: Option<EncapSocket>) {
        self.tunnels
            .lock()
            .unwrap()
            .insert(key, TunnelEntry { tunnel, listener });
    }

    pub fn get_tunnel(&self, key: &IpAddr) -> Option<Tunnel> {
        self.tunnels
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.tunnel.clone())
    }

    fn take_tunnel(&self, key: &IpAddr) -> Option<TunnelEntry> {
        self.tunnels.lock().unwrap().remove(key)
    }

    /// Registered tunnels, keyed by peer external IP.
    pub fn tunnels(&self) -> HashMap<IpAddr, Tunnel> {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (*k, e.tunnel.clone()))
            .collect()
    }

    fn reserve_ip(&self, ip: IpAddr) -> Result<(), ErrorKind> {
        let mut used = self.used_ips.lock().unwrap();
        if !used.insert(ip) {
            return Err(ErrorKind::IpInUse(ip.to_string()));
        }
        Ok(())
    }

    fn unreserve_ip(&self, ip: IpAddr) {
        self.used_ips.lock().unwrap().remove(&ip);
    }

    fn allocate_port(&self) -> Result<u16, ErrorKind> {
        self.unused_ports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ErrorKind::NoPortsAvailable)
    }

    fn release_port(&self, port: u16) {
        self.unused_ports.lock().unwrap().push_back(port);
    }

    /// Draw a consecutive odd/even address pair from the overlay CIDR.
    fn random_ip_pair(&self) -> (IpAddr, IpAddr) {
        let cidr = self.opts.cidr;
        let max = 1u64 << (32 - cidr.prefix_len() - 1);
        let value = OsRng.gen_range(0..max);
        let base = u32::from(cidr.network());
        let first = base + (value as u32) * 2 + 1;
        (
            IpAddr::V4(Ipv4Addr::from(first)),
            IpAddr::V4(Ipv4Addr::from(first + 1)),
        )
    }

    /// The source IP a peer should dial us at: our external IP when no
    /// destination is given, the overlay source paired with a known peer,
    /// or the routing-derived source otherwise.
    pub fn get_src_ip(&self, dst: Option<IpAddr>) -> IpAddr {
        let Some(dst) = dst else {
            return self.opts.external;
        };
        if let Some(tunnel) = self.get_tunnel(&dst) {
            if let Some(src) = tunnel.src {
                return src;
            }
        }
        route_source(self.kernel.as_ref(), Some(dst)).unwrap_or(self.opts.external)
    }

    /// Initiator side of the two-party tunnel handshake.
    pub async fn create_tunnel(
        &self,
        host: &str,
        udp: bool,
    ) -> Result<(IpAddr, IpAddr), ErrorKind> {
        let mut client = PeerClient::connect(host, &self.opts.psk).await?;
        let mut dst = client.get_src_ip(None).await?;

        let mut exists = self.get_tunnel(&dst);
        let mut tunnel = match &exists {
            Some(existing) => {
                info!(
                    "Tunnel already exists: {:?}, {:?}",
                    existing.src, existing.dst
                );
                // The record we negotiate with is the peer's view of the
                // existing tunnel: src and dst reversed, ports reversed.
                existing.mirrored()
            }
            None => {
                let mut tunnel = Tunnel::default();
                if udp {
                    tunnel.dst_port = self.allocate_port()?;
                    info!("Using {} for encap port", tunnel.dst_port);
                }
                tunnel.auth_key = random_key();
                tunnel.enc_key = random_key();
                tunnel.reqid = OsRng.gen_range(1..=u32::MAX);
                tunnel
            }
        };

        loop {
            if tunnel.src.is_none() {
                loop {
                    let (first, second) = self.random_ip_pair();
                    if let Err(e) = self.reserve_ip(first) {
                        info!("{}", e);
                        continue;
                    }
                    if let Err(e) = self.reserve_ip(second) {
                        self.unreserve_ip(first);
                        info!("{}", e);
                        continue;
                    }
                    tunnel.dst = Some(first);
                    tunnel.src = Some(second);
                    break;
                }
            }
            match client.build_tunnel(self.opts.external, &tunnel).await {
                Err(e) if e.is_ip_in_use() => {
                    if let Some(ip) = tunnel.dst.take() {
                        self.unreserve_ip(ip);
                    }
                    if let Some(ip) = tunnel.src.take() {
                        self.unreserve_ip(ip);
                    }
                    if exists.is_some() {
                        warn!("Destroying local tunnel due to remote ip conflict");
                        if let Err(e) = self.destroy_tunnel(dst) {
                            warn!("Failed to destroy conflicting tunnel: {}", e);
                        }
                        exists = None;
                    }
                    continue;
                }
                Err(e) => {
                    error!("Remote BuildTunnel failed: {}", e);
                    // cleanup partial tunnel
                    let _ = client.destroy_tunnel(self.opts.external).await;
                    return Err(e);
                }
                Ok((peer_src, out)) => {
                    dst = peer_src;
                    if exists.is_some() && out != tunnel {
                        warn!("Destroying remote mismatched tunnel");
                        let _ = client.destroy_tunnel(self.opts.external).await;
                        continue;
                    }
                    tunnel = out;
                    break;
                }
            }
        }

        // The negotiated record is the peer's view; flip it into ours.
        let tunnel = tunnel.mirrored();
        if exists.is_none() {
            if let Err(e) = self.build_tunnel_local(dst, tunnel.clone()) {
                error!("Local buildTunnel failed: {}", e);
                let _ = client.destroy_tunnel(self.opts.external).await;
                let _ = self.destroy_tunnel(dst);
                return Err(e);
            }
        }
        let (dst_overlay, src_overlay) = overlay_pair(&tunnel)?;
        Ok((src_overlay, dst_overlay))
    }

    /// Tear down the tunnel to `host`, both halves.
    pub async fn delete_tunnel(&self, host: &str) -> Result<(), ErrorKind> {
        let mut client = PeerClient::connect(host, &self.opts.psk).await?;
        match client.destroy_tunnel(self.opts.external).await {
            Ok(dst) => {
                if let Err(e) = self.destroy_tunnel(dst) {
                    warn!("Failed to destroy local tunnel half: {}", e);
                }
            }
            Err(e) => warn!("Remote DestroyTunnel failed: {}", e),
        }
        Ok(())
    }

    /// Responder side of the handshake: install our half of a tunnel
    /// proposed by `dst`. Idempotent; an existing tunnel is returned
    /// unchanged so racing initiators converge.
    pub fn build_tunnel(
        &self,
        dst: IpAddr,
        mut tunnel: Tunnel,
    ) -> Result<(IpAddr, Tunnel), ErrorKind> {
        if let Some(exists) = self.get_tunnel(&dst) {
            info!("Tunnel already exists: {:?}, {:?}", exists.src, exists.dst);
            return Ok((self.opts.external, exists));
        }
        if tunnel.dst_port != 0 {
            tunnel.src_port = self.allocate_port()?;
        }
        let (dst_ip, src_ip) = overlay_pair(&tunnel)?;
        self.reserve_ip(dst_ip)?;
        if let Err(e) = self.reserve_ip(src_ip) {
            self.unreserve_ip(dst_ip);
            return Err(e);
        }
        let tunnel = self.build_tunnel_local(dst, tunnel)?;
        Ok((self.opts.external, tunnel))
    }

    /// Install the local tunnel half: encap listener, registry entry,
    /// loopback address, scope-link route, XFRM policies and states.
    pub fn build_tunnel_local(&self, dst: IpAddr, tunnel: Tunnel) -> Result<Tunnel, ErrorKind> {
        let (dst_overlay, src_overlay) = overlay_pair(&tunnel)?;
        let listener = if tunnel.src_port != 0 {
            match self.kernel.encap_listener(src_overlay, tunnel.src_port) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("Failed to create udp listener: {}", e);
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        self.add_tunnel(dst, tunnel.clone(), listener);

        let src = self.opts.external;
        info!("Building tunnel: {}, {}", src_overlay, dst_overlay);

        if let Err(e) = self.kernel.addr_add(LOOPBACK, src_overlay) {
            error!("Failed to add {} to loopback: {}", src_overlay, e);
            return Err(e.into());
        }

        let Some(link) = get_link(self.kernel.as_ref(), src) else {
            error!("Failed to get link for address {}", src);
            return Err(ErrorKind::KernelOpFailed(format!(
                "no link owns address {}",
                src
            )));
        };
        let route = Route {
            dst: Some(host_net(dst_overlay)),
            src: Some(src_overlay),
            link,
            scope_link: true,
        };
        if let Err(e) = self.kernel.route_add(&route) {
            error!("Failed to add route {:?}: {}", route, e);
            return Err(e.into());
        }

        for policy in get_policies(tunnel.reqid, src, dst, src_overlay, dst_overlay) {
            match self.kernel.policy_add(&policy) {
                Ok(()) => {}
                Err(KernelError::AlreadyExists) => {
                    info!("Skipped adding policy {:?} because it already exists", policy);
                }
                Err(e) => {
                    error!("Failed to add policy {:?}: {}", policy, e);
                    return Err(e.into());
                }
            }
        }
        for state in get_states(
            tunnel.reqid,
            src,
            dst,
            tunnel.src_port,
            tunnel.dst_port,
            &tunnel.auth_key,
            &tunnel.enc_key,
        ) {
            match self.kernel.state_add(&state) {
                Ok(()) => {}
                Err(KernelError::AlreadyExists) => {
                    info!("Skipped adding state because it already exists");
                }
                Err(e) => {
                    error!("Failed to add state: {}", e);
                    return Err(e.into());
                }
            }
        }
        info!("Finished building tunnel: {}, {}", src_overlay, dst_overlay);
        Ok(tunnel)
    }

    /// Remove the local tunnel half, inverse order of the install. Kernel
    /// errors are logged, not raised; only an unknown tunnel is an error.
    pub fn destroy_tunnel(&self, dst: IpAddr) -> Result<IpAddr, ErrorKind> {
        let tunnel = self
            .get_tunnel(&dst)
            .ok_or_else(|| ErrorKind::TunnelNotFound(dst.to_string()))?;
        let (dst_overlay, src_overlay) = overlay_pair(&tunnel)?;
        let src = self.opts.external;
        info!("Destroying tunnel: {}, {}", src_overlay, dst_overlay);

        for state in get_states(tunnel.reqid, src, dst, 0, 0, &[], &[]) {
            if let Err(e) = self.kernel.state_del(&state) {
                error!("Failed to delete state: {}", e);
            }
        }
        for policy in get_policies(tunnel.reqid, src, dst, src_overlay, dst_overlay) {
            if let Err(e) = self.kernel.policy_del(&policy) {
                error!("Failed to delete policy {:?}: {}", policy, e);
            }
        }
        match get_link(self.kernel.as_ref(), src) {
            Some(link) => {
                let route = Route {
                    dst: Some(host_net(dst_overlay)),
                    src: Some(src_overlay),
                    link,
                    scope_link: true,
                };
                if let Err(e) = self.kernel.route_del(&route) {
                    error!("Failed to delete route {:?}: {}", route, e);
                }
            }
            None => error!("Failed to get link for address {}", src),
        }
        if let Err(e) = self.kernel.addr_del(LOOPBACK, src_overlay) {
            error!("Failed to delete {} from loopback: {}", src_overlay, e);
        }

        // Dropping the entry closes the encap socket.
        self.take_tunnel(&dst);
        if tunnel.src_port != 0 {
            self.release_port(tunnel.src_port);
        }
        self.unreserve_ip(src_overlay);
        self.unreserve_ip(dst_overlay);
        info!("Finished destroying tunnel: {}, {}", src_overlay, dst_overlay);
        Ok(src)
    }

    /// Reconstruct the registry and pools from kernel tables at startup by
    /// joining loopback addresses in the CIDR with scope-link routes, XFRM
    /// policies, and XFRM states. Incomplete chains are logged and skipped.
    pub fn discover(&self) {
        info!("Discovering existing tunnels");
        let (addrs, routes, policies, states) = match (
            self.kernel.addr_list(),
            self.kernel.route_list(),
            self.kernel.policy_list(),
            self.kernel.state_list(),
        ) {
            (Ok(a), Ok(r), Ok(p), Ok(s)) => (a, r, p, s),
            _ => {
                error!("Failed to read kernel tables for tunnel discovery");
                return;
            }
        };
        for addr in addrs {
            if addr.link != LOOPBACK {
                continue;
            }
            let IpAddr::V4(v4) = addr.ip else { continue };
            if !self.opts.cidr.contains(&v4) {
                continue;
            }
            let src_overlay = addr.ip;
            if self.reserve_ip(src_overlay).is_err() {
                warn!("Duplicate tunnel ip detected: {}", src_overlay);
            }
            info!("Potential tunnel found from {}", src_overlay);
            let Some(dst_overlay) = routes
                .iter()
                .filter(|r| r.src == Some(src_overlay))
                .find_map(|r| r.dst.map(|d| d.addr()))
            else {
                warn!("could not find dst for tunnel src {}", src_overlay);
                continue;
            };
            if self.reserve_ip(dst_overlay).is_err() {
                warn!("Duplicate tunnel ip detected: {}", dst_overlay);
            }
            let Some(dst) = policies
                .iter()
                .find(|p| p.dst.addr() == dst_overlay)
                .map(|p| p.tmpl_dst)
            else {
                warn!(
                    "could not find ip for tunnel between {} and {}",
                    src_overlay, dst_overlay
                );
                continue;
            };
            for state in states.iter().filter(|s| s.dst == dst) {
                if state.auth_key.is_empty() {
                    warn!("Tunnel state has no associated authentication entry");
                    continue;
                }
                if state.enc_key.is_empty() {
                    warn!("Tunnel state has no associated encryption entry");
                    continue;
                }
                let mut tunnel = Tunnel {
                    reqid: state.reqid,
                    auth_key: state.auth_key.clone(),
                    enc_key: state.enc_key.clone(),
                    src: Some(src_overlay),
                    dst: Some(dst_overlay),
                    src_port: 0,
                    dst_port: 0,
                };
                if let Some(encap) = state.encap {
                    tunnel.src_port = encap.src_port;
                    tunnel.dst_port = encap.dst_port;
                }
                info!(
                    "Discovered tunnel between {} and {} over {}",
                    src_overlay, dst_overlay, dst
                );
                let listener = if tunnel.src_port != 0 {
                    match self.kernel.encap_listener(src_overlay, tunnel.src_port) {
                        Ok(listener) => Some(listener),
                        Err(e) => {
                            warn!("Failed to create udp listener: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                self.add_tunnel(dst, tunnel, listener);
                break;
            }
        }
        info!("Finished discovering existing tunnels");
    }
}

fn random_key() -> Vec<u8> {
    let mut key = vec![0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

fn overlay_pair(tunnel: &Tunnel) -> Result<(IpAddr, IpAddr), ErrorKind> {
    match (tunnel.dst, tunnel.src) {
        (Some(dst), Some(src)) => Ok((dst, src)),
        _ => Err(ErrorKind::InvalidAddress(
            "tunnel record is missing its overlay pair".to_string(),
        )),
    }
}

fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32).unwrap(),
        IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128).unwrap(),
    }
}

/// Find the link that owns `ip`.
pub fn get_link(kernel: &dyn KernelNet, ip: IpAddr) -> Option<String> {
    kernel
        .addr_list()
        .ok()?
        .into_iter()
        .find(|a| a.ip == ip)
        .map(|a| a.link)
}

/// Walk the routing table for the source address toward `dest`; with no
/// destination, the source of the default route.
pub fn route_source(kernel: &dyn KernelNet, dest: Option<IpAddr>) -> Option<IpAddr> {
    let routes = kernel.route_list().ok()?;
    let mut link = None;
    let mut source = None;
    for route in &routes {
        match (&route.dst, dest) {
            (None, _) => {
                link = Some(route.link.clone());
                source = route.src;
            }
            (Some(dst), Some(dest)) if dst.contains(&dest) => {
                link = Some(route.link.clone());
                source = route.src;
                break;
            }
            _ => {}
        }
    }
    let link = link?;
    if let Some(source) = source {
        return Some(source);
    }
    // No source on the route; fall back to the link's first address.
    kernel
        .addr_list()
        .ok()?
        .into_iter()
        .find(|a| a.link == link)
        .map(|a| a.ip)
}

/// The OUT/IN policy pair for one tunnel.
pub fn get_policies(
    reqid: u32,
    src: IpAddr,
    dst: IpAddr,
    src_overlay: IpAddr,
    dst_overlay: IpAddr,
) -> Vec<XfrmPolicy> {
    let src_net = host_net(src_overlay);
    let dst_net = host_net(dst_overlay);
    vec![
        XfrmPolicy {
            src: src_net,
            dst: dst_net,
            dir: XfrmDir::Out,
            tmpl_src: src,
            tmpl_dst: dst,
            reqid,
        },
        XfrmPolicy {
            src: dst_net,
            dst: src_net,
            dir: XfrmDir::In,
            tmpl_src: dst,
            tmpl_dst: src,
            reqid,
        },
    ]
}

/// The outbound/inbound state pair for one tunnel.
pub fn get_states(
    reqid: u32,
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    auth_key: &[u8],
    enc_key: &[u8],
) -> Vec<XfrmState> {
    let encap_out = (src_port != 0 && dst_port != 0).then_some(Encap {
        src_port,
        dst_port,
    });
    let encap_in = (src_port != 0 && dst_port != 0).then_some(Encap {
        src_port: dst_port,
        dst_port: src_port,
    });
    vec![
        XfrmState {
            src,
            dst,
            spi: reqid,
            reqid,
            replay_window: 32,
            auth_key: auth_key.to_vec(),
            enc_key: enc_key.to_vec(),
            encap: encap_out,
        },
        XfrmState {
            src: dst,
            dst: src,
            spi: reqid,
            reqid,
            replay_window: 32,
            auth_key: auth_key.to_vec(),
            enc_key: enc_key.to_vec(),
            encap: encap_in,
        },
    ]
}
