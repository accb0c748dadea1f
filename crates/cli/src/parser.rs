//! Segment program parser.
//!
//! Turns the flat `create` word list into nested command trees. The chaining
//! commands (child, chain, remote, tunnel, udptunnel) open a nested segment:
//! everything after them applies to that child, and `trigger` additionally
//! defers the following commands to connection time.

use anyhow::{bail, Result};
use wormhole_common::addr::{parse_url, uuid, validate_addr};
use wormhole_common::{CommandKind, SegmentCommand};

pub fn parse_segment(
    args: &[String],
) -> Result<(String, Vec<SegmentCommand>, Vec<SegmentCommand>)> {
    let mut id = uuid();
    let mut root = SegmentCommand::default();
    // Path from the root to the segment currently being described.
    let mut path: Vec<(bool, usize)> = Vec::new();
    let (mut chain, mut tail, mut trigger) = (false, false, false);

    let mut words = args.iter();
    while let Some(command) = words.next() {
        let action = match command.as_str() {
            "id" => {
                id = next_arg(&mut words, "ID", "id")?;
                continue;
            }
            "url" => {
                let url = next_arg(&mut words, "URL", "url")?;
                let Ok((proto, _, _, _)) = parse_url(&url) else {
                    bail!("Unable to parse URL: {}", url);
                };
                if !proto.is_empty() && proto != "tcp" && proto != "udp" {
                    bail!("Only tcp and udp protocols are currently supported.");
                }
                SegmentCommand::new(CommandKind::Url, tail, url)
            }
            "docker-ns" => {
                SegmentCommand::new(CommandKind::DockerNs, tail, next_arg(&mut words, "ID", "docker-ns")?)
            }
            "docker-run" => SegmentCommand::new(
                CommandKind::DockerRun,
                tail,
                next_arg(&mut words, "ARGS", "docker-run")?,
            ),
            "child" => {
                chain = true;
                SegmentCommand::new(CommandKind::Child, false, "")
            }
            "chain" => {
                chain = true;
                SegmentCommand::new(CommandKind::Chain, false, "")
            }
            "remote" => {
                chain = true;
                SegmentCommand::new(
                    CommandKind::Remote,
                    false,
                    parse_host(&mut words, "remote")?,
                )
            }
            "tunnel" => {
                chain = true;
                SegmentCommand::new(
                    CommandKind::Tunnel,
                    false,
                    parse_host(&mut words, "tunnel")?,
                )
            }
            "udptunnel" => {
                chain = true;
                SegmentCommand::new(
                    CommandKind::UdpTunnel,
                    false,
                    parse_host(&mut words, "udptunnel")?,
                )
            }
            "tail" => {
                tail = true;
                continue;
            }
            "trigger" => {
                trigger = true;
                tail = true;
                continue;
            }
            other => bail!("Action {} not recognized", other),
        };

        let cur = follow_path(&mut root, &path);
        if trigger {
            cur.add_trig(action);
            if chain {
                path.push((true, cur.child_trig.len() - 1));
                chain = false;
                trigger = false;
                tail = false;
            }
        } else {
            cur.add_init(action);
            if chain {
                path.push((false, cur.child_init.len() - 1));
                chain = false;
                trigger = false;
                tail = false;
            }
        }
    }
    Ok((id, root.child_init, root.child_trig))
}

fn next_arg<'a>(
    words: &mut impl Iterator<Item = &'a String>,
    name: &str,
    command: &str,
) -> Result<String> {
    match words.next() {
        Some(arg) => Ok(arg.clone()),
        None => bail!("Argument {} is required for {}", name, command),
    }
}

fn parse_host<'a>(
    words: &mut impl Iterator<Item = &'a String>,
    command: &str,
) -> Result<String> {
    let host = next_arg(words, "HOST", command)?;
    match validate_addr(&host) {
        Ok(host) => Ok(host),
        Err(_) => bail!("Unable to parse HOST: {}", host),
    }
}

fn follow_path<'a>(
    root: &'a mut SegmentCommand,
    path: &[(bool, usize)],
) -> &'a mut SegmentCommand {
    let mut cur = root;
    for &(trig, index) in path {
        let node = cur;
        cur = if trig {
            &mut node.child_trig[index]
        } else {
            &mut node.child_init[index]
        };
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn check_basic(args: &[&str], kind: CommandKind) {
        let (_, init, _) = parse_segment(&words(args)).unwrap();
        assert_eq!(init.len(), 1, "parse failed to create action: {:?}", args);
        assert_eq!(init[0].kind, kind, "kind mismatch for {:?}", args);
    }

    #[test]
    fn test_parse_basic() {
        check_basic(&["url", ":40"], CommandKind::Url);
        check_basic(&["docker-ns", "foo"], CommandKind::DockerNs);
        check_basic(&["docker-run", "foo"], CommandKind::DockerRun);
        check_basic(&["child"], CommandKind::Child);
        check_basic(&["chain"], CommandKind::Chain);
        check_basic(&["remote", "foo"], CommandKind::Remote);
        check_basic(&["tunnel", "foo"], CommandKind::Tunnel);
        check_basic(&["udptunnel", "foo"], CommandKind::UdpTunnel);
    }

    #[test]
    fn test_parse_id() {
        let (id, _, _) = parse_segment(&words(&["id", "foo"])).unwrap();
        assert_eq!(id, "foo");
    }

    #[test]
    fn test_generated_id_when_absent() {
        let (id, _, _) = parse_segment(&words(&["url", ":40"])).unwrap();
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_parse_complex() {
        let (id, init, _) =
            parse_segment(&words(&["id", "foo", "url", ":40", "docker-run", "bar"])).unwrap();
        assert_eq!(id, "foo");
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].kind, CommandKind::Url);
        assert_eq!(init[1].kind, CommandKind::DockerRun);
    }

    #[test]
    fn test_parse_remote_nests_following_commands() {
        let (id, init, _) = parse_segment(&words(&[
            "id",
            "foo",
            "url",
            ":40",
            "remote",
            "bar",
            "docker-run",
            "baz",
        ]))
        .unwrap();
        assert_eq!(id, "foo");
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].kind, CommandKind::Url);
        assert_eq!(init[1].kind, CommandKind::Remote);
        assert_eq!(init[1].arg, "tcp://bar:9999");
        assert_eq!(init[1].child_init.len(), 1);
        assert_eq!(init[1].child_init[0].kind, CommandKind::DockerRun);
    }

    #[test]
    fn test_parse_trigger_routes_to_trig() {
        let (id, init, trig) = parse_segment(&words(&[
            "id",
            "foo",
            "url",
            ":40",
            "trigger",
            "docker-run",
            "baz",
        ]))
        .unwrap();
        assert_eq!(id, "foo");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].kind, CommandKind::Url);
        assert_eq!(trig.len(), 1);
        assert_eq!(trig[0].kind, CommandKind::DockerRun);
        assert!(trig[0].tail);
    }

    #[test]
    fn test_tail_directs_following_commands() {
        let (_, init, _) =
            parse_segment(&words(&["url", ":40", "tail", "url", ":41"])).unwrap();
        assert!(!init[0].tail);
        assert!(init[1].tail);
    }

    #[test]
    fn test_nested_trigger_inside_remote() {
        let (_, init, _) = parse_segment(&words(&[
            "url",
            ":9000",
            "tunnel",
            "peer",
            "url",
            ":9001",
            "trigger",
            "docker-run",
            "img",
        ]))
        .unwrap();
        assert_eq!(init.len(), 2);
        let tunnel = &init[1];
        assert_eq!(tunnel.kind, CommandKind::Tunnel);
        assert_eq!(tunnel.child_init.len(), 1);
        assert_eq!(tunnel.child_trig.len(), 1);
        assert_eq!(tunnel.child_trig[0].kind, CommandKind::DockerRun);
    }

    #[test]
    fn test_errors() {
        assert!(parse_segment(&words(&["bogus"])).is_err());
        assert!(parse_segment(&words(&["url"])).is_err());
        assert!(parse_segment(&words(&["url", "unix://sock"])).is_err());
        assert!(parse_segment(&words(&["remote"])).is_err());
        assert!(parse_segment(&words(&["remote", "a:b:c"])).is_err());
    }
}
