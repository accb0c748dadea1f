//! End-to-end tests over the RPC plane.
//!
//! Two in-process daemons share one in-memory kernel, like two daemons
//! running inside a single network namespace: each installs its own tunnel
//! half into the same tables, so a completed tunnel shows four policies and
//! two de-duplicated states.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wormhole_common::addr::uuid;
use wormhole_common::{
    CommandKind, ErrorKind, PeerClient, PskConfig, SegmentCommand,
};
use wormholed::kernel::MemoryKernel;
use wormholed::netns::{ContainerRuntime, NsHandle};
use wormholed::proxy::{EndpointResolver, Proxier, ProxierFactory};
use wormholed::{ApiServer, Daemon, Options, StreamProxierFactory};

struct NullRuntime;

impl ContainerRuntime for NullRuntime {
    fn namespace_by_name(&self, name: &str) -> Result<NsHandle, ErrorKind> {
        Ok(NsHandle::labeled(name))
    }

    fn namespace_by_container(&self, id: &str) -> Result<NsHandle, ErrorKind> {
        Ok(NsHandle::labeled(id))
    }

    fn run_container(&self, args: &str) -> Result<String, ErrorKind> {
        Err(ErrorKind::ContainerFailed(format!(
            "no container runtime in tests: {}",
            args
        )))
    }

    fn remove_containers(&self, _ids: &[String]) {}
}

/// Proxier that only records bindings; used where tests exercise the control
/// plane rather than byte flow.
struct RecordingProxier {
    next_port: Arc<AtomicU16>,
}

#[async_trait]
impl Proxier for RecordingProxier {
    fn set_ns(&mut self, _ns: NsHandle) {}

    async fn add_service(
        &mut self,
        _name: &str,
        _proto: &str,
        port: u16,
    ) -> Result<u16, ErrorKind> {
        if port != 0 {
            return Ok(port);
        }
        Ok(self.next_port.fetch_add(1, Ordering::SeqCst))
    }

    async fn stop_proxy(&mut self, _name: &str) {}
}

struct RecordingProxierFactory {
    next_port: Arc<AtomicU16>,
}

impl RecordingProxierFactory {
    fn new() -> RecordingProxierFactory {
        RecordingProxierFactory {
            next_port: Arc::new(AtomicU16::new(42000)),
        }
    }
}

impl ProxierFactory for RecordingProxierFactory {
    fn new_proxier(
        &self,
        _resolver: Arc<dyn EndpointResolver>,
        _host: &str,
    ) -> Box<dyn Proxier> {
        Box::new(RecordingProxier {
            next_port: self.next_port.clone(),
        })
    }
}

struct TestDaemon {
    daemon: Arc<Daemon>,
    server: ApiServer,
    addr: String,
}

fn test_psk() -> PskConfig {
    PskConfig {
        key: "wormhole".to_string(),
        identity: "testhost".to_string(),
    }
}

async fn start_daemon(
    kernel: Arc<MemoryKernel>,
    external: &str,
    factory: Arc<dyn ProxierFactory>,
) -> TestDaemon {
    let opts = Arc::new(Options {
        hosts: vec!["tcp://127.0.0.1:0".to_string()],
        external: external.parse().unwrap(),
        cidr: "100.65.0.0/14".parse().unwrap(),
        udp_start_port: 4500,
        udp_end_port: 4599,
        psk: test_psk(),
    });
    let daemon = Daemon::new(opts, kernel, Arc::new(NullRuntime), factory);
    daemon.init();
    let server = ApiServer::bind(daemon.clone()).await.unwrap();
    let addr = server.bound[0].clone();
    TestDaemon {
        daemon,
        server,
        addr,
    }
}

/// A kernel seeded like the functional namespace: both externals on
/// loopback, a default route sourced from the first.
fn shared_kernel() -> Arc<MemoryKernel> {
    let kernel = Arc::new(MemoryKernel::new());
    kernel.seed_addr("lo", "127.0.0.1".parse().unwrap(), 32);
    kernel.seed_addr("lo", "127.0.0.2".parse().unwrap(), 32);
    kernel.seed_route(wormholed::kernel::Route {
        dst: None,
        src: Some("127.0.0.1".parse().unwrap()),
        link: "lo".to_string(),
        scope_link: false,
    });
    kernel
}

async fn connect(addr: &str) -> PeerClient {
    PeerClient::connect(addr, &test_psk()).await.unwrap()
}

fn url_command(arg: &str, tail: bool) -> SegmentCommand {
    SegmentCommand::new(CommandKind::Url, tail, arg)
}

/// Spawn a one-shot echo listener and return its port.
async fn start_pong() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        conn.write_all(&buf[..n]).await.unwrap();
    });
    port
}

async fn send_roundtrip(port: u16, msg: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}

fn listen_port(url: &str) -> u16 {
    url.rsplit(':').next().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_ping_echo() {
    let a = start_daemon(shared_kernel(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let mut client = connect(&a.addr).await;
    let value = vec![7u8; 16];
    assert_eq!(client.echo(value.clone(), "").await.unwrap(), value);
}

#[tokio::test]
async fn test_ping_forwarded() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let b = start_daemon(kernel, "127.0.0.2", Arc::new(StreamProxierFactory)).await;
    let mut client = connect(&a.addr).await;
    let value = vec![9u8; 16];
    assert_eq!(client.echo(value.clone(), &b.addr).await.unwrap(), value);
}

#[tokio::test]
async fn test_wrong_psk_rejected() {
    let a = start_daemon(shared_kernel(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let bad = PskConfig {
        key: "not-the-key".to_string(),
        identity: "mallory".to_string(),
    };
    let mut client = PeerClient::connect(&a.addr, &bad).await.unwrap();
    let err = client.echo(vec![1, 2, 3], "").await.unwrap_err();
    assert!(matches!(err, ErrorKind::PeerRejected(_)));
}

#[tokio::test]
async fn test_get_src_ip() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel, "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let mut client = connect(&a.addr).await;
    assert_eq!(
        client.get_src_ip(None).await.unwrap(),
        "127.0.0.1".parse::<IpAddr>().unwrap()
    );
}

#[tokio::test]
async fn test_tunnel_create_and_delete() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let b = start_daemon(kernel.clone(), "127.0.0.2", Arc::new(StreamProxierFactory)).await;

    let mut client = connect(&a.addr).await;
    let (src, dst) = client.create_tunnel(&b.addr, false).await.unwrap();
    assert_ne!(src, dst);
    let cidr: ipnet::Ipv4Net = "100.65.0.0/14".parse().unwrap();
    let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (src, dst) else {
        panic!("overlay pair must be v4");
    };
    assert!(cidr.contains(&src4));
    assert!(cidr.contains(&dst4));

    // Both halves in one set of tables: 4 policies, 2 de-duplicated states.
    assert_eq!(kernel.policies().len(), 4);
    let states = kernel.states().len();
    assert_eq!(states, 2);
    for state in kernel.states() {
        assert!(state.encap.is_none());
        assert_eq!(state.replay_window, 32);
        assert_eq!(state.spi, state.reqid);
    }

    client.delete_tunnel(&b.addr).await.unwrap();
    assert!(kernel.policies().is_empty());
    assert!(kernel.states().is_empty());
}

#[tokio::test]
async fn test_tunnel_double_create_is_idempotent() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let b = start_daemon(kernel.clone(), "127.0.0.2", Arc::new(StreamProxierFactory)).await;

    let mut client = connect(&a.addr).await;
    let first = client.create_tunnel(&b.addr, false).await.unwrap();
    let second = client.create_tunnel(&b.addr, false).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(kernel.policies().len(), 4);
    assert_eq!(kernel.states().len(), 2);

    client.delete_tunnel(&b.addr).await.unwrap();
    assert!(kernel.policies().is_empty());
    assert!(kernel.states().is_empty());
}

#[tokio::test]
async fn test_udp_tunnel_has_encap() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let b = start_daemon(kernel.clone(), "127.0.0.2", Arc::new(StreamProxierFactory)).await;

    let mut client = connect(&a.addr).await;
    client.create_tunnel(&b.addr, true).await.unwrap();
    let states = kernel.states();
    assert_eq!(states.len(), 2);
    for state in &states {
        let encap = state.encap.expect("udp tunnel states carry encap");
        assert_ne!(encap.src_port, 0);
        assert_ne!(encap.dst_port, 0);
    }
    // The two states are mirror images of each other.
    let (a_encap, b_encap) = (states[0].encap.unwrap(), states[1].encap.unwrap());
    assert_eq!(a_encap.src_port, b_encap.dst_port);
    assert_eq!(a_encap.dst_port, b_encap.src_port);
}

#[tokio::test]
async fn test_tunnel_discovery_survives_restart() {
    let kernel = shared_kernel();
    let b_external: IpAddr = "127.0.0.2".parse().unwrap();
    let record = {
        let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
        let b = start_daemon(kernel.clone(), "127.0.0.2", Arc::new(StreamProxierFactory)).await;
        let mut client = connect(&a.addr).await;
        client.create_tunnel(&b.addr, true).await.unwrap();
        let record = a.daemon.tunnels.get_tunnel(&b_external).unwrap();
        a.server.shutdown();
        b.server.shutdown();
        record
    };

    // A fresh daemon over the same kernel tables reconstructs the record.
    let restarted =
        start_daemon(kernel, "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    assert_eq!(
        restarted.daemon.tunnels.get_tunnel(&b_external),
        Some(record)
    );
}

#[tokio::test]
async fn test_segment_create_listens_delete_stops() {
    let a = start_daemon(shared_kernel(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let mut client = connect(&a.addr).await;
    let id = uuid();
    let url = client
        .create_segment(&id, vec![], vec![url_command(":19001", true)])
        .await
        .unwrap();
    let port = listen_port(&url);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

    client.delete_segment(&id).await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_duplicate_segment_id_rejected() {
    let a = start_daemon(shared_kernel(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let mut client = connect(&a.addr).await;
    client.create_segment("seg", vec![], vec![]).await.unwrap();
    let err = client
        .create_segment("seg", vec![], vec![])
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::IdAlreadyExists("seg".to_string()));
}

#[tokio::test]
async fn test_chain_roundtrip() {
    let a = start_daemon(shared_kernel(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let pong_port = start_pong().await;

    let mut chain = SegmentCommand::new(CommandKind::Chain, false, "");
    chain.add_init(url_command(&format!(":{}", pong_port), true));
    let mut client = connect(&a.addr).await;
    let id = uuid();
    let url = client.create_segment(&id, vec![chain], vec![]).await.unwrap();

    let reply = send_roundtrip(listen_port(&url), b"ping").await;
    assert_eq!(&reply, b"ping");
}

#[tokio::test]
async fn test_remote_roundtrip() {
    let kernel = shared_kernel();
    let a = start_daemon(kernel.clone(), "127.0.0.1", Arc::new(StreamProxierFactory)).await;
    let b = start_daemon(kernel, "127.0.0.2", Arc::new(StreamProxierFactory)).await;
    let pong_port = start_pong().await;

    let mut remote = SegmentCommand::new(CommandKind::Remote, false, b.addr.clone());
    remote.add_init(url_command(&format!(":{}", pong_port), true));
    let mut client = connect(&a.addr).await;
    let id = uuid();
    let url = client
        .create_segment(&id, vec![remote], vec![])
        .await
        .unwrap();

    let reply = send_roundtrip(listen_port(&url), b"ping").await;
    assert_eq!(&reply, b"ping");

    // Deleting the parent deletes the remote child too.
    assert_eq!(b.daemon.segments.segment_ids().len(), 1);
    client.delete_segment(&id).await.unwrap();
    assert!(b.daemon.segments.segment_ids().is_empty());
}

#[tokio::test]
async fn test_tunnel_segment_wiring() {
    // Overlay addresses never reach the host in these tests, so the segment
    // layer runs over recording proxiers and the assertions stay on the
    // control plane: child registration, tunnel tables, and teardown.
    let kernel = shared_kernel();
    let factory = Arc::new(RecordingProxierFactory::new());
    let a = start_daemon(kernel.clone(), "127.0.0.1", factory.clone()).await;
    let b = start_daemon(kernel.clone(), "127.0.0.2", factory).await;

    let mut tunnel = SegmentCommand::new(CommandKind::Tunnel, false, b.addr.clone());
    tunnel.add_init(url_command(":19002", true));
    let mut client = connect(&a.addr).await;
    let id = uuid();
    client.create_segment(&id, vec![tunnel], vec![]).await.unwrap();

    assert_eq!(kernel.policies().len(), 4);
    assert_eq!(kernel.states().len(), 2);
    assert_eq!(b.daemon.segments.segment_ids().len(), 1);

    client.delete_segment(&id).await.unwrap();
    assert!(b.daemon.segments.segment_ids().is_empty());

    client.delete_tunnel(&b.addr).await.unwrap();
    assert!(kernel.policies().is_empty());
    assert!(kernel.states().is_empty());
}

#[tokio::test]
async fn test_unix_socket_ping() {
    let dir = std::env::temp_dir().join(format!("wormhole-test-{}", uuid()));
    std::fs::create_dir_all(&dir).unwrap();
    let sock = dir.join("socket");
    let opts = Arc::new(Options {
        hosts: vec![format!("unix://{}", sock.display())],
        external: "127.0.0.1".parse().unwrap(),
        cidr: "100.65.0.0/14".parse().unwrap(),
        udp_start_port: 4500,
        udp_end_port: 4599,
        psk: test_psk(),
    });
    let daemon = Daemon::new(
        opts,
        shared_kernel(),
        Arc::new(NullRuntime),
        Arc::new(StreamProxierFactory),
    );
    let server = ApiServer::bind(daemon.clone()).await.unwrap();

    let mut client = connect(&server.bound[0]).await;
    let value = vec![3u8; 16];
    assert_eq!(client.echo(value.clone(), "").await.unwrap(), value);
    let _ = std::fs::remove_dir_all(&dir);
}
