//! Bind-address and segment-URL parsing.
//!
//! Two grammars live here: `validate_addr` normalizes the bind addresses the
//! daemon listens on and clients dial (`unix://path`, `tcp://host:port`, or a
//! bare `host[:port]`), and `parse_url` handles the richer segment endpoint
//! form `[scheme://][ns@]host[:port]` with optional IPv6 bracketing.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::ErrorKind;

pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_UNIX: &str = "/var/run/wormhole";

/// Generate an RFC-4122 v4 UUID as lowercase `8-4-4-4-12` hex.
pub fn uuid() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let hex: Vec<String> = b.iter().map(|x| format!("{:02x}", x)).collect();
    let hex = hex.concat();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Normalize a bind address into `unix://path` or `tcp://host:port`.
///
/// A bare address defaults to tcp; an empty unix path defaults to
/// [`DEFAULT_UNIX`]; a missing or zero port defaults to [`DEFAULT_PORT`].
pub fn validate_addr(addr: &str) -> Result<String, ErrorKind> {
    let (proto, rest) = if let Some(rest) = addr.strip_prefix("unix://") {
        let rest = if rest.is_empty() { DEFAULT_UNIX } else { rest };
        return Ok(format!("unix://{}", rest));
    } else if let Some(rest) = addr.strip_prefix("tcp://") {
        ("tcp", rest)
    } else if addr.contains("://") {
        return Err(ErrorKind::InvalidAddress(format!(
            "invalid bind address protocol: {}",
            addr
        )));
    } else {
        ("tcp", addr)
    };

    let (host, port) = if rest.contains(':') {
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 2 {
            return Err(ErrorKind::InvalidAddress(format!(
                "invalid bind address format: {}",
                addr
            )));
        }
        let port = match parts[1].parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => DEFAULT_PORT,
        };
        (parts[0], port)
    } else {
        (rest, DEFAULT_PORT)
    };
    Ok(format!("{}://{}:{}", proto, host, port))
}

/// Split a validated bind address into `(proto, address)`.
///
/// Addresses without a scheme are treated as tcp.
pub fn split_addr(addr: &str) -> (&str, &str) {
    match addr.split_once("://") {
        Some((proto, rest)) => (proto, rest),
        None => ("tcp", addr),
    }
}

/// Parse a segment URL of the form `[scheme://][ns@]host[:port]`.
///
/// Empty input parses to all-empty fields. The unix scheme forbids both a
/// namespace and a port; IPv6 hosts may be bracketed; a zero or unparsable
/// port is an error while an absent one stays 0.
pub fn parse_url(url: &str) -> Result<(String, String, String, u16), ErrorKind> {
    let mut url = url.trim();
    if url.is_empty() {
        return Ok((String::new(), String::new(), String::new(), 0));
    }

    let mut proto = "";
    if let Some(rest) = url.strip_prefix("unix://") {
        proto = "unix";
        url = rest;
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        proto = "tcp";
        url = rest;
    } else if let Some(rest) = url.strip_prefix("udp://") {
        proto = "udp";
        url = rest;
    } else if url.contains("://") {
        return Err(ErrorKind::InvalidUrl(format!(
            "invalid segment protocol: {}",
            url
        )));
    }

    let mut ns = "";
    if url.contains('@') {
        if proto == "unix" {
            return Err(ErrorKind::InvalidUrl(
                "namespace not supported in unix protocol".into(),
            ));
        }
        let parts: Vec<&str> = url.split('@').collect();
        if parts.len() != 2 {
            return Err(ErrorKind::InvalidUrl("only one namespace is allowed".into()));
        }
        ns = parts[0];
        url = parts[1];
    }

    let mut port = 0u16;
    if url.len() > 1 && url.starts_with('[') && url.ends_with(']') {
        url = &url[1..url.len() - 1];
    } else if let Some(i) = url.rfind(':') {
        if proto == "unix" {
            return Err(ErrorKind::InvalidUrl(
                "port not supported in unix protocol".into(),
            ));
        }
        let port_str = &url[i + 1..];
        url = &url[..i];
        if !port_str.is_empty() {
            port = match port_str.parse::<u16>() {
                Ok(p) if p != 0 => p,
                _ => {
                    return Err(ErrorKind::InvalidUrl(format!(
                        "invalid value for port: {}",
                        port_str
                    )))
                }
            };
        }
        if url.len() > 1 && url.starts_with('[') && url.ends_with(']') {
            url = &url[1..url.len() - 1];
        } else if url.contains(':') {
            return Err(ErrorKind::InvalidUrl("only one port is allowed".into()));
        }
    }

    if proto != "unix" && (url.contains('[') || url.contains(']')) {
        return Err(ErrorKind::InvalidUrl(
            "invalid characters in hostname".into(),
        ));
    }
    Ok((proto.to_string(), ns.to_string(), url.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(url: &str, proto: &str, ns: &str, hostname: &str, port: u16) {
        let (pr, n, h, po) = parse_url(url).unwrap_or_else(|e| panic!("{}: {}", url, e));
        assert_eq!(pr, proto, "protocol mismatch for {:?}", url);
        assert_eq!(n, ns, "namespace mismatch for {:?}", url);
        assert_eq!(h, hostname, "hostname mismatch for {:?}", url);
        assert_eq!(po, port, "port mismatch for {:?}", url);
    }

    fn check_err(url: &str) {
        assert!(parse_url(url).is_err(), "no error for {:?}", url);
    }

    #[test]
    fn test_parse_url() {
        check("", "", "", "", 0);
        check(":40", "", "", "", 40);
        check("foo", "", "", "foo", 0);
        check("foo:", "", "", "foo", 0);
        check("foo:40", "", "", "foo", 40);
        check("ns@", "", "ns", "", 0);
        check("ns@foo", "", "ns", "foo", 0);
        check("ns@:40", "", "ns", "", 40);
        check("ns@foo:40", "", "ns", "foo", 40);
        check("tcp://", "tcp", "", "", 0);
        check("udp://", "udp", "", "", 0);
        check("unix://", "unix", "", "", 0);
        check("tcp://foo", "tcp", "", "foo", 0);
        check("tcp://:40", "tcp", "", "", 40);
        check("tcp://foo:40", "tcp", "", "foo", 40);
        check("tcp://ns@", "tcp", "ns", "", 0);
        check("tcp://ns@foo", "tcp", "ns", "foo", 0);
        check("tcp://ns@:40", "tcp", "ns", "", 40);
        check("tcp://ns@foo:40", "tcp", "ns", "foo", 40);
        check("[::1]:40", "", "", "::1", 40);
    }

    #[test]
    fn test_parse_url_errors() {
        check_err("multiple@namespace@foo");
        check_err("invalid://host");
        check_err("multiple:ports:foo");
        check_err("unix://with@namespace");
        check_err("unix://with:port");
        check_err("::1:40");
        check_err("[bad]bracketing");
        check_err(":0");
    }

    #[test]
    fn test_validate_addr() {
        assert_eq!(validate_addr("").unwrap(), "tcp://:9999");
        assert_eq!(validate_addr("127.0.0.1").unwrap(), "tcp://127.0.0.1:9999");
        assert_eq!(validate_addr(":6666").unwrap(), "tcp://:6666");
        assert_eq!(validate_addr("foo:40").unwrap(), "tcp://foo:40");
        assert_eq!(validate_addr("tcp://foo:40").unwrap(), "tcp://foo:40");
        assert_eq!(validate_addr("foo:0").unwrap(), "tcp://foo:9999");
        assert_eq!(validate_addr("unix://").unwrap(), "unix:///var/run/wormhole");
        assert_eq!(validate_addr("unix://./socket").unwrap(), "unix://./socket");
        assert!(validate_addr("http://foo").is_err());
        assert!(validate_addr("a:b:c").is_err());
    }

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("tcp://foo:40"), ("tcp", "foo:40"));
        assert_eq!(split_addr("unix:///tmp/sock"), ("unix", "/tmp/sock"));
        assert_eq!(split_addr("foo:40"), ("tcp", "foo:40"));
    }

    #[test]
    fn test_uuid_format() {
        let id = uuid();
        assert_eq!(id.len(), 36);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert_eq!(&parts[2][0..1], "4");
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
        assert_ne!(uuid(), id);
    }
}
