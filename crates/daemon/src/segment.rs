//! Segments: configured L4 proxies with a head (listener) and tail
//! (upstream), possibly chained through child segments on remote peers.
//!
//! A segment is created from two command lists. `init` runs at creation and
//! shapes the head; `trig` runs on the first incoming connection and shapes
//! the tail, so expensive tail setup (containers, remote chains) is deferred
//! until something actually connects. Both lists are consumed by execution.

use std::collections::HashMap;
use std::future::Future;
use std::net::ToSocketAddrs;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::{error, info};
use wormhole_common::addr::{parse_url, uuid};
use wormhole_common::{CommandKind, ErrorKind, PeerClient, SegmentCommand};

use crate::config::Options;
use crate::netns::{ContainerRuntime, NsHandle};
use crate::proxy::{EndpointResolver, Proxier, ProxierFactory};
use crate::tunnel::TunnelManager;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One end of a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub proto: String,
    pub ns: NsHandle,
    pub hostname: String,
    pub port: u16,
}

#[derive(Default)]
struct SegmentState {
    head: ConnectionInfo,
    tail: ConnectionInfo,
    init: Vec<SegmentCommand>,
    trig: Vec<SegmentCommand>,
    child_host: String,
    child_id: String,
    docker_ids: Vec<String>,
    triggered: bool,
}

pub struct Segment {
    state: tokio::sync::Mutex<SegmentState>,
    proxy: tokio::sync::Mutex<Option<Box<dyn Proxier>>>,
}

impl Segment {
    fn new(
        head: Option<ConnectionInfo>,
        init: Vec<SegmentCommand>,
        trig: Vec<SegmentCommand>,
    ) -> Segment {
        Segment {
            state: tokio::sync::Mutex::new(SegmentState {
                head: head.unwrap_or_default(),
                init,
                trig,
                ..Default::default()
            }),
            proxy: tokio::sync::Mutex::new(None),
        }
    }

    /// Drain and execute the init commands, then apply head defaults.
    async fn initialize(&self, manager: &Arc<SegmentManager>) -> Result<(), ErrorKind> {
        let mut state = self.state.lock().await;
        let commands = std::mem::take(&mut state.init);
        execute_commands(manager, &mut state, commands).await?;
        if state.head.proto.is_empty() {
            state.head.proto = "tcp".to_string();
        }
        if state.head.hostname.is_empty() {
            state.head.hostname = "127.0.0.1".to_string();
        }
        Ok(())
    }

    /// Drain and execute the trig commands, apply tail defaults, and refuse
    /// a segment that would proxy to itself. Fires at most once; concurrent
    /// connections serialize on the state lock and observe the latch.
    async fn trigger(&self, manager: &Arc<SegmentManager>) -> Result<(), ErrorKind> {
        let mut state = self.state.lock().await;
        if state.triggered {
            return Ok(());
        }
        let commands = std::mem::take(&mut state.trig);
        execute_commands(manager, &mut state, commands).await?;
        if state.tail.proto.is_empty() {
            state.tail.proto = state.head.proto.clone();
        }
        if state.tail.hostname.is_empty() {
            state.tail.hostname = "127.0.0.1".to_string();
        }
        if state.tail.port == 0 {
            state.tail.port = state.head.port;
        }
        let head_addr = join_host_port(&state.head.hostname, state.head.port);
        let tail_addr = join_host_port(&state.tail.hostname, state.tail.port);
        if host_equal(&state.head.proto, &head_addr, &tail_addr) && state.head.ns == state.tail.ns
        {
            return Err(ErrorKind::SelfProxy);
        }
        state.triggered = true;
        Ok(())
    }
}

/// Resolves the proxier's endpoint pulls against its owning segment. Both
/// references are weak: the segment owns the proxier which owns this.
struct SegmentResolver {
    segment: Weak<Segment>,
    manager: Weak<SegmentManager>,
}

#[async_trait]
impl EndpointResolver for SegmentResolver {
    async fn next_endpoint(
        &self,
        _service: &str,
        _src: std::net::SocketAddr,
    ) -> Result<(NsHandle, String), ErrorKind> {
        let (Some(segment), Some(manager)) = (self.segment.upgrade(), self.manager.upgrade())
        else {
            return Err(ErrorKind::IdNotFound("segment is gone".to_string()));
        };
        segment.trigger(&manager).await?;
        let state = segment.state.lock().await;
        Ok((
            state.tail.ns.clone(),
            join_host_port(&state.tail.hostname, state.tail.port),
        ))
    }
}

/// Daemon-wide segment registry and executor.
pub struct SegmentManager {
    opts: Arc<Options>,
    tunnels: Arc<TunnelManager>,
    runtime: Arc<dyn ContainerRuntime>,
    proxier_factory: Arc<dyn ProxierFactory>,
    segments: Mutex<HashMap<String, Arc<Segment>>>,
}

impl SegmentManager {
    pub fn new(
        opts: Arc<Options>,
        tunnels: Arc<TunnelManager>,
        runtime: Arc<dyn ContainerRuntime>,
        proxier_factory: Arc<dyn ProxierFactory>,
    ) -> SegmentManager {
        SegmentManager {
            opts,
            tunnels,
            runtime,
            proxier_factory,
            segments: Mutex::new(HashMap::new()),
        }
    }

    fn get_segment(&self, id: &str) -> Option<Arc<Segment>> {
        self.segments.lock().unwrap().get(id).cloned()
    }

    pub fn segment_ids(&self) -> Vec<String> {
        self.segments.lock().unwrap().keys().cloned().collect()
    }

    /// Create a segment and return its head listen URL.
    pub async fn create_segment(
        self: &Arc<Self>,
        id: &str,
        init: Vec<SegmentCommand>,
        trig: Vec<SegmentCommand>,
    ) -> Result<String, ErrorKind> {
        let head = self.create_segment_local(id.to_string(), init, trig, None).await?;
        Ok(format!(
            "{}://{}:{}",
            head.proto, head.hostname, head.port
        ))
    }

    /// Create and register a segment; `head` carries the parent's tail when
    /// this is a child. Boxed because child commands recurse into it.
    fn create_segment_local(
        self: &Arc<Self>,
        id: String,
        init: Vec<SegmentCommand>,
        trig: Vec<SegmentCommand>,
        head: Option<ConnectionInfo>,
    ) -> BoxFuture<'static, Result<ConnectionInfo, ErrorKind>> {
        let manager = self.clone();
        Box::pin(async move {
            if manager.get_segment(&id).is_some() {
                return Err(ErrorKind::IdAlreadyExists(id));
            }
            info!("Creating segment {}", id);
            let segment = Arc::new(Segment::new(head, init, trig));
            segment.initialize(&manager).await?;

            let (head_proto, head_hostname, head_port, head_ns) = {
                let state = segment.state.lock().await;
                (
                    state.head.proto.clone(),
                    state.head.hostname.clone(),
                    state.head.port,
                    state.head.ns.clone(),
                )
            };
            let resolver = Arc::new(SegmentResolver {
                segment: Arc::downgrade(&segment),
                manager: Arc::downgrade(&manager),
            });
            let mut proxy = manager.proxier_factory.new_proxier(resolver, &head_hostname);
            proxy.set_ns(head_ns);
            let port = proxy.add_service("segment", &head_proto, head_port).await?;
            let head = {
                let mut state = segment.state.lock().await;
                state.head.port = port;
                state.head.clone()
            };
            *segment.proxy.lock().await = Some(proxy);
            manager
                .segments
                .lock()
                .unwrap()
                .insert(id.clone(), segment);
            info!("Finished creating segment {}", id);
            Ok(head)
        })
    }

    /// Stop a segment's proxy, delete its child (local or remote), remove
    /// its containers, and unregister it. Boxed because local children
    /// recurse into it.
    pub fn delete_segment<'a>(self: &'a Arc<Self>, id: &str) -> BoxFuture<'a, Result<(), ErrorKind>> {
        let id = id.to_string();
        Box::pin(async move {
            info!("Deleting segment {}", id);
            let segment = self.segments.lock().unwrap().remove(&id);
            let Some(segment) = segment else {
                return Err(ErrorKind::IdNotFound(id));
            };
            self.cleanup_segment(&segment).await;
            info!("Finished deleting segment {}", id);
            Ok(())
        })
    }

    async fn cleanup_segment(self: &Arc<Self>, segment: &Arc<Segment>) {
        if let Some(mut proxy) = segment.proxy.lock().await.take() {
            proxy.stop_proxy("segment").await;
        }
        let (child_host, child_id, docker_ids) = {
            let state = segment.state.lock().await;
            (
                state.child_host.clone(),
                state.child_id.clone(),
                state.docker_ids.clone(),
            )
        };
        if !child_id.is_empty() {
            if child_host.is_empty() {
                if let Err(e) = self.delete_segment(&child_id).await {
                    error!("Failed to delete child segment {}: {}", child_id, e);
                }
            } else {
                match PeerClient::connect(&child_host, &self.opts.psk).await {
                    Ok(mut client) => {
                        if let Err(e) = client.delete_segment(&child_id).await {
                            error!("Failed to delete remote child {}: {}", child_id, e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to connect to child host at {}: {}", child_host, e)
                    }
                }
            }
        }
        if !docker_ids.is_empty() {
            self.runtime.remove_containers(&docker_ids);
        }
    }

    /// Drain every segment; used on daemon shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        for id in self.segment_ids() {
            info!("Cleaning segment {}", id);
            if let Err(e) = self.delete_segment(&id).await {
                error!("Failed to clean segment {}: {}", id, e);
            }
        }
    }
}

async fn execute_commands(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    commands: Vec<SegmentCommand>,
) -> Result<(), ErrorKind> {
    for command in commands {
        match command.kind {
            CommandKind::None => {}
            CommandKind::Url => execute_url(manager, state, &command)?,
            CommandKind::DockerNs => execute_docker_ns(manager, state, &command)?,
            CommandKind::DockerRun => execute_docker_run(manager, state, &command)?,
            CommandKind::Child => execute_child(manager, state, command, false).await?,
            CommandKind::Chain => execute_child(manager, state, command, true).await?,
            CommandKind::Remote => execute_remote(manager, state, command).await?,
            CommandKind::Tunnel => execute_tunnel(manager, state, command, false).await?,
            CommandKind::UdpTunnel => execute_tunnel(manager, state, command, true).await?,
        }
    }
    Ok(())
}

fn target<'a>(state: &'a mut SegmentState, command: &SegmentCommand) -> &'a mut ConnectionInfo {
    if command.tail {
        &mut state.tail
    } else {
        &mut state.head
    }
}

fn execute_url(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    command: &SegmentCommand,
) -> Result<(), ErrorKind> {
    let (proto, ns, hostname, port) = parse_url(&command.arg)?;
    let ci = target(state, command);
    if !proto.is_empty() {
        ci.proto = proto;
    }
    if !ns.is_empty() {
        ci.ns = manager.runtime.namespace_by_name(&ns)?;
    }
    if !hostname.is_empty() {
        ci.hostname = hostname;
    }
    if port != 0 {
        ci.port = port;
    }
    Ok(())
}

fn execute_docker_ns(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    command: &SegmentCommand,
) -> Result<(), ErrorKind> {
    let ns = manager.runtime.namespace_by_container(&command.arg)?;
    target(state, command).ns = ns;
    Ok(())
}

fn execute_docker_run(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    command: &SegmentCommand,
) -> Result<(), ErrorKind> {
    let id = manager.runtime.run_container(&command.arg)?;
    state.docker_ids.push(id.clone());
    let ns = manager.runtime.namespace_by_container(&id)?;
    target(state, command).ns = ns;
    Ok(())
}

async fn execute_child(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    command: SegmentCommand,
    chain: bool,
) -> Result<(), ErrorKind> {
    let id = uuid();
    let head = manager
        .create_segment_local(
            id.clone(),
            command.child_init,
            command.child_trig,
            Some(state.tail.clone()),
        )
        .await?;
    if chain {
        state.tail = head;
    }
    state.child_id = id;
    Ok(())
}

async fn execute_remote(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    mut command: SegmentCommand,
) -> Result<(), ErrorKind> {
    let mut client = PeerClient::connect(&command.arg, &manager.opts.psk).await?;
    let dst = client.get_src_ip(Some(manager.opts.external)).await?;
    command.add_init(SegmentCommand::new(CommandKind::Url, false, dst.to_string()));
    let id = uuid();
    let url = client
        .create_segment(&id, command.child_init, command.child_trig)
        .await?;
    apply_child_url(state, &url)?;
    state.child_host = command.arg;
    state.child_id = id;
    Ok(())
}

async fn execute_tunnel(
    manager: &Arc<SegmentManager>,
    state: &mut SegmentState,
    mut command: SegmentCommand,
    udp: bool,
) -> Result<(), ErrorKind> {
    let (_, dst) = manager.tunnels.create_tunnel(&command.arg, udp).await?;
    command.add_init(SegmentCommand::new(CommandKind::Url, false, dst.to_string()));
    let mut client = PeerClient::connect(&command.arg, &manager.opts.psk).await?;
    let id = uuid();
    let url = client
        .create_segment(&id, command.child_init, command.child_trig)
        .await?;
    apply_child_url(state, &url)?;
    state.child_host = command.arg;
    state.child_id = id;
    Ok(())
}

/// Point our tail at a child's listen URL.
fn apply_child_url(state: &mut SegmentState, url: &str) -> Result<(), ErrorKind> {
    let (proto, _, hostname, port) = parse_url(url)?;
    state.tail.proto = proto;
    state.tail.hostname = hostname;
    state.tail.port = port;
    Ok(())
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whether two `host:port` strings name the same endpoint under `proto`.
fn host_equal(proto: &str, h1: &str, h2: &str) -> bool {
    if h1 == h2 {
        return true;
    }
    if proto.starts_with("tcp") || proto.starts_with("udp") {
        let a1 = h1.to_socket_addrs().ok().and_then(|mut a| a.next());
        let a2 = h2.to_socket_addrs().ok().and_then(|mut a| a.next());
        return match (a1, a2) {
            (Some(a1), Some(a2)) => a1 == a2,
            _ => false,
        };
    }
    false
}
