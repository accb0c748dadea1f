//! Kernel networking collaborator.
//!
//! The tunnel manager drives addresses, routes, and XFRM policies/states
//! through the [`KernelNet`] trait. Two implementations live here:
//! [`IpCommandKernel`] executes the `ip` tool (JSON listings via `ip -j`),
//! and [`MemoryKernel`] keeps the tables in memory for tests and dry runs.

use std::fmt;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::process::Command;
use std::sync::Mutex;

use ipnet::IpNet;
use log::debug;
use serde_json::Value;
use thiserror::Error;
use wormhole_common::ErrorKind;

pub const LOOPBACK: &str = "lo";

// Linux socket option constants for ESP-in-UDP encapsulation.
pub const UDP_ENCAP: libc::c_int = 100;
pub const UDP_ENCAP_ESPINUDP: libc::c_int = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Non-fatal on add operations; the tunnel install is idempotent.
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

impl From<KernelError> for ErrorKind {
    fn from(err: KernelError) -> ErrorKind {
        ErrorKind::KernelOpFailed(err.to_string())
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// An address assigned to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddr {
    pub link: String,
    pub ip: IpAddr,
    pub prefix: u8,
}

/// A routing table entry; `dst = None` is the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: Option<IpNet>,
    pub src: Option<IpAddr>,
    pub link: String,
    pub scope_link: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfrmDir {
    In,
    Out,
}

impl fmt::Display for XfrmDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XfrmDir::In => f.write_str("in"),
            XfrmDir::Out => f.write_str("out"),
        }
    }
}

/// An XFRM policy with its single ESP tunnel-mode template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmPolicy {
    pub src: IpNet,
    pub dst: IpNet,
    pub dir: XfrmDir,
    pub tmpl_src: IpAddr,
    pub tmpl_dst: IpAddr,
    pub reqid: u32,
}

/// ESP-in-UDP encapsulation ports on a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encap {
    pub src_port: u16,
    pub dst_port: u16,
}

/// An ESP tunnel-mode XFRM state. `spi` always equals `reqid` here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmState {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub spi: u32,
    pub reqid: u32,
    pub replay_window: u32,
    /// hmac(sha256) key
    pub auth_key: Vec<u8>,
    /// cbc(aes) key
    pub enc_key: Vec<u8>,
    pub encap: Option<Encap>,
}

/// A UDP socket marked for ESP-in-UDP decapsulation, owned by its tunnel.
pub struct EncapSocket {
    pub ip: IpAddr,
    pub port: u16,
    _socket: Option<socket2::Socket>,
}

impl EncapSocket {
    /// Placeholder socket used by [`MemoryKernel`].
    pub fn stub(ip: IpAddr, port: u16) -> EncapSocket {
        EncapSocket {
            ip,
            port,
            _socket: None,
        }
    }
}

impl fmt::Debug for EncapSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncapSocket({}:{})", self.ip, self.port)
    }
}

/// Abstract kernel operations required by the tunnel manager.
pub trait KernelNet: Send + Sync {
    fn addr_list(&self) -> KResult<Vec<IfaceAddr>>;
    fn addr_add(&self, link: &str, ip: IpAddr) -> KResult<()>;
    fn addr_del(&self, link: &str, ip: IpAddr) -> KResult<()>;

    fn route_list(&self) -> KResult<Vec<Route>>;
    fn route_add(&self, route: &Route) -> KResult<()>;
    fn route_del(&self, route: &Route) -> KResult<()>;

    fn policy_list(&self) -> KResult<Vec<XfrmPolicy>>;
    fn policy_add(&self, policy: &XfrmPolicy) -> KResult<()>;
    fn policy_del(&self, policy: &XfrmPolicy) -> KResult<()>;

    fn state_list(&self) -> KResult<Vec<XfrmState>>;
    fn state_add(&self, state: &XfrmState) -> KResult<()>;
    fn state_del(&self, state: &XfrmState) -> KResult<()>;

    /// Open a UDP socket with `UDP_ENCAP=ESPINUDP` bound to `(ip, port)`.
    fn encap_listener(&self, ip: IpAddr, port: u16) -> KResult<EncapSocket>;
}

fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32).unwrap(),
        IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128).unwrap(),
    }
}

/// Drives the `ip` tool, the same way the daemon drives every other external
/// control surface.
#[derive(Debug, Default)]
pub struct IpCommandKernel;

impl IpCommandKernel {
    fn run(&self, args: &[String]) -> KResult<String> {
        debug!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| KernelError::Failed(format!("failed to execute ip: {}", e)))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.contains("File exists") || stderr.contains("already assigned") {
            Err(KernelError::AlreadyExists)
        } else if stderr.contains("No such") || stderr.contains("not found") {
            Err(KernelError::NotFound)
        } else {
            Err(KernelError::Failed(stderr.trim().to_string()))
        }
    }

    fn run_json(&self, args: &[String]) -> KResult<Vec<Value>> {
        let mut full = vec!["-j".to_string()];
        full.extend_from_slice(args);
        let out = self.run(&full)?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&out)
            .map_err(|e| KernelError::Failed(format!("unparsable ip -j output: {}", e)))
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn json_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn json_ip(v: &Value, key: &str) -> Option<IpAddr> {
    json_str(v, key).and_then(|s| s.parse().ok())
}

fn json_u32(v: &Value, key: &str) -> Option<u32> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        // iproute2 prints SPIs as 0x-prefixed strings
        Some(Value::String(s)) => u32::from_str_radix(s.trim_start_matches("0x"), 16).ok(),
        _ => None,
    }
}

fn json_net(v: &Value, key: &str) -> Option<IpNet> {
    let s = json_str(v, key)?;
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().ok().map(host_net)
}

fn json_key(v: &Value) -> Option<Vec<u8>> {
    let s = json_str(v, "key")?;
    hex::decode(s.trim_start_matches("0x")).ok()
}

impl KernelNet for IpCommandKernel {
    fn addr_list(&self) -> KResult<Vec<IfaceAddr>> {
        let mut addrs = Vec::new();
        for link in self.run_json(&argv(&["addr", "show"]))? {
            let Some(ifname) = json_str(&link, "ifname") else {
                continue;
            };
            let Some(infos) = link.get("addr_info").and_then(Value::as_array) else {
                continue;
            };
            for info in infos {
                if let (Some(ip), Some(prefix)) = (json_ip(info, "local"), json_u32(info, "prefixlen")) {
                    addrs.push(IfaceAddr {
                        link: ifname.clone(),
                        ip,
                        prefix: prefix as u8,
                    });
                }
            }
        }
        Ok(addrs)
    }

    fn addr_add(&self, link: &str, ip: IpAddr) -> KResult<()> {
        self.run(&argv(&["addr", "add", &host_net(ip).to_string(), "dev", link]))?;
        Ok(())
    }

    fn addr_del(&self, link: &str, ip: IpAddr) -> KResult<()> {
        self.run(&argv(&["addr", "del", &host_net(ip).to_string(), "dev", link]))?;
        Ok(())
    }

    fn route_list(&self) -> KResult<Vec<Route>> {
        let mut routes = Vec::new();
        for family in ["-4", "-6"] {
            for route in self.run_json(&argv(&[family, "route", "show"]))? {
                let Some(link) = json_str(&route, "dev") else {
                    continue;
                };
                let dst = match json_str(&route, "dst").as_deref() {
                    Some("default") | None => None,
                    Some(_) => json_net(&route, "dst"),
                };
                routes.push(Route {
                    dst,
                    src: json_ip(&route, "prefsrc"),
                    link,
                    scope_link: json_str(&route, "scope").as_deref() == Some("link"),
                });
            }
        }
        Ok(routes)
    }

    fn route_add(&self, route: &Route) -> KResult<()> {
        self.run(&route_args("add", route))?;
        Ok(())
    }

    fn route_del(&self, route: &Route) -> KResult<()> {
        self.run(&route_args("del", route))?;
        Ok(())
    }

    fn policy_list(&self) -> KResult<Vec<XfrmPolicy>> {
        let mut policies = Vec::new();
        for policy in self.run_json(&argv(&["xfrm", "policy"]))? {
            let dir = match json_str(&policy, "dir").as_deref() {
                Some("in") => XfrmDir::In,
                Some("out") => XfrmDir::Out,
                _ => continue,
            };
            let Some(tmpl) = policy
                .get("tmpl")
                .and_then(Value::as_array)
                .and_then(|t| t.first())
            else {
                continue;
            };
            let (Some(src), Some(dst), Some(tmpl_src), Some(tmpl_dst)) = (
                json_net(&policy, "src"),
                json_net(&policy, "dst"),
                json_ip(tmpl, "src"),
                json_ip(tmpl, "dst"),
            ) else {
                continue;
            };
            policies.push(XfrmPolicy {
                src,
                dst,
                dir,
                tmpl_src,
                tmpl_dst,
                reqid: json_u32(tmpl, "reqid").unwrap_or(0),
            });
        }
        Ok(policies)
    }

    fn policy_add(&self, p: &XfrmPolicy) -> KResult<()> {
        self.run(&argv(&[
            "xfrm", "policy", "add",
            "src", &p.src.to_string(),
            "dst", &p.dst.to_string(),
            "dir", &p.dir.to_string(),
            "tmpl",
            "src", &p.tmpl_src.to_string(),
            "dst", &p.tmpl_dst.to_string(),
            "proto", "esp",
            "reqid", &p.reqid.to_string(),
            "mode", "tunnel",
        ]))?;
        Ok(())
    }

    fn policy_del(&self, p: &XfrmPolicy) -> KResult<()> {
        self.run(&argv(&[
            "xfrm", "policy", "delete",
            "src", &p.src.to_string(),
            "dst", &p.dst.to_string(),
            "dir", &p.dir.to_string(),
        ]))?;
        Ok(())
    }

    fn state_list(&self) -> KResult<Vec<XfrmState>> {
        let mut states = Vec::new();
        for state in self.run_json(&argv(&["xfrm", "state"]))? {
            let (Some(src), Some(dst)) = (json_ip(&state, "src"), json_ip(&state, "dst")) else {
                continue;
            };
            let id = state.get("id").unwrap_or(&state);
            let Some(spi) = json_u32(id, "spi").or_else(|| json_u32(&state, "spi")) else {
                continue;
            };
            let auth = state.get("auth-trunc").or_else(|| state.get("auth"));
            let enc = state.get("enc");
            let encap = state.get("encap").and_then(|e| {
                let sport = json_u32(e, "sport")?;
                let dport = json_u32(e, "dport")?;
                Some(Encap {
                    src_port: sport as u16,
                    dst_port: dport as u16,
                })
            });
            states.push(XfrmState {
                src,
                dst,
                spi,
                reqid: json_u32(&state, "reqid").unwrap_or(spi),
                replay_window: json_u32(&state, "replay-window").unwrap_or(0),
                auth_key: auth.and_then(json_key).unwrap_or_default(),
                enc_key: enc.and_then(json_key).unwrap_or_default(),
                encap,
            });
        }
        Ok(states)
    }

    fn state_add(&self, s: &XfrmState) -> KResult<()> {
        let spi = format!("{:#x}", s.spi);
        let auth = format!("0x{}", hex::encode(&s.auth_key));
        let enc = format!("0x{}", hex::encode(&s.enc_key));
        let mut args = argv(&[
            "xfrm", "state", "add",
            "src", &s.src.to_string(),
            "dst", &s.dst.to_string(),
            "proto", "esp",
            "spi", &spi,
            "reqid", &s.reqid.to_string(),
            "mode", "tunnel",
            "replay-window", &s.replay_window.to_string(),
            "auth", "hmac(sha256)", &auth,
            "enc", "cbc(aes)", &enc,
        ]);
        if let Some(encap) = &s.encap {
            args.extend(argv(&[
                "encap",
                "espinudp",
                &encap.src_port.to_string(),
                &encap.dst_port.to_string(),
                "0.0.0.0",
            ]));
        }
        self.run(&args)?;
        Ok(())
    }

    fn state_del(&self, s: &XfrmState) -> KResult<()> {
        let spi = format!("{:#x}", s.spi);
        self.run(&argv(&[
            "xfrm", "state", "delete",
            "src", &s.src.to_string(),
            "dst", &s.dst.to_string(),
            "proto", "esp",
            "spi", &spi,
        ]))?;
        Ok(())
    }

    fn encap_listener(&self, ip: IpAddr, port: u16) -> KResult<EncapSocket> {
        use socket2::{Domain, SockAddr, Socket, Type};
        let domain = match ip {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)
            .map_err(|e| KernelError::Failed(format!("encap socket: {}", e)))?;
        let value = UDP_ENCAP_ESPINUDP;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_UDP,
                UDP_ENCAP,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(KernelError::Failed(format!(
                "setsockopt UDP_ENCAP: {}",
                std::io::Error::last_os_error()
            )));
        }
        socket
            .bind(&SockAddr::from(std::net::SocketAddr::new(ip, port)))
            .map_err(|e| KernelError::Failed(format!("bind {}:{}: {}", ip, port, e)))?;
        Ok(EncapSocket {
            ip,
            port,
            _socket: Some(socket),
        })
    }
}

fn route_args(op: &str, route: &Route) -> Vec<String> {
    let dst = match &route.dst {
        Some(net) => net.to_string(),
        None => "default".to_string(),
    };
    let mut args = argv(&["route", op, &dst, "dev", &route.link]);
    if let Some(src) = route.src {
        args.extend(argv(&["src", &src.to_string()]));
    }
    if route.scope_link {
        args.extend(argv(&["scope", "link"]));
    }
    args
}

#[derive(Debug, Default)]
struct MemoryTables {
    addrs: Vec<IfaceAddr>,
    routes: Vec<Route>,
    policies: Vec<XfrmPolicy>,
    states: Vec<XfrmState>,
}

/// In-memory kernel tables. Duplicate adds fail with `AlreadyExists` and
/// deletes of absent entries with `NotFound`, matching the real kernel's
/// behavior closely enough for the tunnel manager's idempotence logic.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    tables: Mutex<MemoryTables>,
}

impl MemoryKernel {
    pub fn new() -> MemoryKernel {
        MemoryKernel::default()
    }

    /// Seed an interface address, e.g. the host's external IP.
    pub fn seed_addr(&self, link: &str, ip: IpAddr, prefix: u8) {
        self.tables.lock().unwrap().addrs.push(IfaceAddr {
            link: link.to_string(),
            ip,
            prefix,
        });
    }

    /// Seed a route, e.g. a default route for source resolution.
    pub fn seed_route(&self, route: Route) {
        self.tables.lock().unwrap().routes.push(route);
    }

    pub fn policies(&self) -> Vec<XfrmPolicy> {
        self.tables.lock().unwrap().policies.clone()
    }

    pub fn states(&self) -> Vec<XfrmState> {
        self.tables.lock().unwrap().states.clone()
    }

    pub fn addrs(&self) -> Vec<IfaceAddr> {
        self.tables.lock().unwrap().addrs.clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.tables.lock().unwrap().routes.clone()
    }
}

impl KernelNet for MemoryKernel {
    fn addr_list(&self) -> KResult<Vec<IfaceAddr>> {
        Ok(self.tables.lock().unwrap().addrs.clone())
    }

    fn addr_add(&self, link: &str, ip: IpAddr) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.addrs.iter().any(|a| a.link == link && a.ip == ip) {
            return Err(KernelError::AlreadyExists);
        }
        tables.addrs.push(IfaceAddr {
            link: link.to_string(),
            ip,
            prefix: 32,
        });
        Ok(())
    }

    fn addr_del(&self, link: &str, ip: IpAddr) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.addrs.len();
        tables.addrs.retain(|a| !(a.link == link && a.ip == ip));
        if tables.addrs.len() == before {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    fn route_list(&self) -> KResult<Vec<Route>> {
        Ok(self.tables.lock().unwrap().routes.clone())
    }

    fn route_add(&self, route: &Route) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables
            .routes
            .iter()
            .any(|r| r.dst == route.dst && r.src == route.src)
        {
            return Err(KernelError::AlreadyExists);
        }
        tables.routes.push(route.clone());
        Ok(())
    }

    fn route_del(&self, route: &Route) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.routes.len();
        tables
            .routes
            .retain(|r| !(r.dst == route.dst && r.src == route.src));
        if tables.routes.len() == before {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    fn policy_list(&self) -> KResult<Vec<XfrmPolicy>> {
        Ok(self.tables.lock().unwrap().policies.clone())
    }

    fn policy_add(&self, policy: &XfrmPolicy) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables
            .policies
            .iter()
            .any(|p| p.src == policy.src && p.dst == policy.dst && p.dir == policy.dir)
        {
            return Err(KernelError::AlreadyExists);
        }
        tables.policies.push(policy.clone());
        Ok(())
    }

    fn policy_del(&self, policy: &XfrmPolicy) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.policies.len();
        tables
            .policies
            .retain(|p| !(p.src == policy.src && p.dst == policy.dst && p.dir == policy.dir));
        if tables.policies.len() == before {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    fn state_list(&self) -> KResult<Vec<XfrmState>> {
        Ok(self.tables.lock().unwrap().states.clone())
    }

    fn state_add(&self, state: &XfrmState) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables
            .states
            .iter()
            .any(|s| s.src == state.src && s.dst == state.dst && s.spi == state.spi)
        {
            return Err(KernelError::AlreadyExists);
        }
        tables.states.push(state.clone());
        Ok(())
    }

    fn state_del(&self, state: &XfrmState) -> KResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.states.len();
        tables
            .states
            .retain(|s| !(s.src == state.src && s.dst == state.dst && s.spi == state.spi));
        if tables.states.len() == before {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    fn encap_listener(&self, ip: IpAddr, port: u16) -> KResult<EncapSocket> {
        Ok(EncapSocket::stub(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> XfrmPolicy {
        XfrmPolicy {
            src: "100.65.0.2/32".parse().unwrap(),
            dst: "100.65.0.1/32".parse().unwrap(),
            dir: XfrmDir::Out,
            tmpl_src: "127.0.0.1".parse().unwrap(),
            tmpl_dst: "127.0.0.2".parse().unwrap(),
            reqid: 42,
        }
    }

    #[test]
    fn test_memory_kernel_duplicate_add() {
        let kernel = MemoryKernel::new();
        kernel.policy_add(&policy()).unwrap();
        assert_eq!(kernel.policy_add(&policy()), Err(KernelError::AlreadyExists));
        assert_eq!(kernel.policies().len(), 1);
    }

    #[test]
    fn test_memory_kernel_delete_missing() {
        let kernel = MemoryKernel::new();
        assert_eq!(kernel.policy_del(&policy()), Err(KernelError::NotFound));
        kernel.policy_add(&policy()).unwrap();
        kernel.policy_del(&policy()).unwrap();
        assert!(kernel.policies().is_empty());
    }

    #[test]
    fn test_memory_kernel_addr_roundtrip() {
        let kernel = MemoryKernel::new();
        let ip: IpAddr = "100.65.0.2".parse().unwrap();
        kernel.addr_add(LOOPBACK, ip).unwrap();
        assert_eq!(kernel.addr_add(LOOPBACK, ip), Err(KernelError::AlreadyExists));
        kernel.addr_del(LOOPBACK, ip).unwrap();
        assert_eq!(kernel.addr_del(LOOPBACK, ip), Err(KernelError::NotFound));
    }

    #[test]
    fn test_route_args_include_src_and_scope() {
        let route = Route {
            dst: Some("100.65.0.1/32".parse().unwrap()),
            src: Some("100.65.0.2".parse().unwrap()),
            link: "eth0".to_string(),
            scope_link: true,
        };
        let args = route_args("add", &route);
        assert_eq!(
            args,
            argv(&[
                "route", "add", "100.65.0.1/32", "dev", "eth0", "src", "100.65.0.2", "scope",
                "link"
            ])
        );
    }
}
