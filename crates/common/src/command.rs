//! Segment program commands and the tunnel record exchanged between peers.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Discriminant for a [`SegmentCommand`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    #[default]
    None,
    Url,
    DockerNs,
    DockerRun,
    Child,
    Chain,
    Remote,
    Tunnel,
    UdpTunnel,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::None => "none",
            CommandKind::Url => "url",
            CommandKind::DockerNs => "docker-ns",
            CommandKind::DockerRun => "docker-run",
            CommandKind::Child => "child",
            CommandKind::Chain => "chain",
            CommandKind::Remote => "remote",
            CommandKind::Tunnel => "tunnel",
            CommandKind::UdpTunnel => "udptunnel",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of a segment program.
///
/// `tail` selects whether the command mutates the tail instead of the head;
/// the child lists hold the program of a nested segment for the commands that
/// create one (child, chain, remote, tunnel, udptunnel). Ordering within a
/// list is significant.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCommand {
    pub kind: CommandKind,
    pub tail: bool,
    pub arg: String,
    pub child_init: Vec<SegmentCommand>,
    pub child_trig: Vec<SegmentCommand>,
}

impl SegmentCommand {
    pub fn new(kind: CommandKind, tail: bool, arg: impl Into<String>) -> Self {
        SegmentCommand {
            kind,
            tail,
            arg: arg.into(),
            ..Default::default()
        }
    }

    pub fn add_init(&mut self, c: SegmentCommand) {
        self.child_init.push(c);
    }

    pub fn add_trig(&mut self, c: SegmentCommand) {
        self.child_trig.push(c);
    }
}

/// One half of an IPsec tunnel, as seen from whichever side holds it.
///
/// `src`/`dst` are the overlay pair; both stay `None` until the initiator has
/// drawn addresses from the CIDR. `src_port`/`dst_port` are zero for plain
/// ESP and a nonzero pair for ESP-in-UDP. `reqid` doubles as the XFRM SPI.
/// Full-field equality is what the construction handshake uses to detect a
/// peer-side mismatch.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub reqid: u32,
    pub auth_key: Vec<u8>,
    pub enc_key: Vec<u8>,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Tunnel {
    /// The same tunnel as seen from the other side: src and dst swapped,
    /// ports swapped.
    pub fn mirrored(&self) -> Tunnel {
        Tunnel {
            reqid: self.reqid,
            auth_key: self.auth_key.clone(),
            enc_key: self.enc_key.clone(),
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

// Keys are deliberately left out of the display form.
impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (reqid {:#x}, ports {}/{})",
            opt_ip(&self.src),
            opt_ip(&self.dst),
            self.reqid,
            self.src_port,
            self.dst_port
        )
    }
}

fn opt_ip(ip: &Option<IpAddr>) -> String {
    match ip {
        Some(ip) => ip.to_string(),
        None => "<unset>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirrored_swaps_addrs_and_ports() {
        let t = Tunnel {
            reqid: 7,
            auth_key: vec![1; 32],
            enc_key: vec![2; 32],
            src: Some("100.65.0.2".parse().unwrap()),
            dst: Some("100.65.0.1".parse().unwrap()),
            src_port: 4500,
            dst_port: 4501,
        };
        let m = t.mirrored();
        assert_eq!(m.src, t.dst);
        assert_eq!(m.dst, t.src);
        assert_eq!(m.src_port, t.dst_port);
        assert_eq!(m.dst_port, t.src_port);
        assert_eq!(m.mirrored(), t);
    }

    #[test]
    fn test_tunnel_equality_is_full_field() {
        let t = Tunnel {
            reqid: 7,
            auth_key: vec![1; 32],
            enc_key: vec![2; 32],
            src: Some("100.65.0.2".parse().unwrap()),
            dst: Some("100.65.0.1".parse().unwrap()),
            src_port: 0,
            dst_port: 0,
        };
        let mut o = t.clone();
        assert_eq!(t, o);
        o.auth_key[0] = 9;
        assert_ne!(t, o);
    }

    #[test]
    fn test_command_child_accumulation() {
        let mut c = SegmentCommand::new(CommandKind::Remote, false, "peer");
        c.add_init(SegmentCommand::new(CommandKind::Url, false, ":40"));
        c.add_trig(SegmentCommand::new(CommandKind::DockerRun, true, "img"));
        assert_eq!(c.child_init.len(), 1);
        assert_eq!(c.child_trig.len(), 1);
        assert_eq!(c.child_init[0].kind, CommandKind::Url);
    }
}
