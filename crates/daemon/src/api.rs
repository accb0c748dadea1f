//! RPC serving: the daemon's addressable surface.
//!
//! One task per accepted connection; frames that fail PSK verification are
//! answered with a typed rejection and the connection dropped. Dispatch maps
//! each method byte onto the tunnel, segment, and echo subsystems.

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use wormhole_common::addr::split_addr;
use wormhole_common::proto::{self, encode_reply, Frame};
use wormhole_common::ErrorKind;

use crate::config::Options;
use crate::echo::echo;
use crate::kernel::KernelNet;
use crate::netns::ContainerRuntime;
use crate::proxy::ProxierFactory;
use crate::segment::SegmentManager;
use crate::tunnel::TunnelManager;

/// The daemon: options plus the tunnel and segment subsystems. RPC handlers
/// borrow this; nothing lives in globals so tests can run several daemons in
/// one process.
pub struct Daemon {
    pub opts: Arc<Options>,
    pub tunnels: Arc<TunnelManager>,
    pub segments: Arc<SegmentManager>,
}

impl Daemon {
    pub fn new(
        opts: Arc<Options>,
        kernel: Arc<dyn KernelNet>,
        runtime: Arc<dyn ContainerRuntime>,
        proxier_factory: Arc<dyn ProxierFactory>,
    ) -> Arc<Daemon> {
        let tunnels = Arc::new(TunnelManager::new(opts.clone(), kernel));
        let segments = Arc::new(SegmentManager::new(
            opts.clone(),
            tunnels.clone(),
            runtime,
            proxier_factory,
        ));
        Arc::new(Daemon {
            opts,
            tunnels,
            segments,
        })
    }

    /// Startup: reconstruct tunnel state from the kernel before serving.
    pub fn init(&self) {
        self.tunnels.discover();
    }

    /// Shutdown: drain segments. Tunnels are intentionally left in place;
    /// discovery restores them on the next start.
    pub async fn shutdown(&self) {
        self.segments.shutdown().await;
    }
}

/// Bound RPC listeners with their accept tasks.
pub struct ApiServer {
    /// Actual bound addresses, in `proto://addr` form.
    pub bound: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ApiServer {
    /// Bind every configured host and start accepting.
    pub async fn bind(daemon: Arc<Daemon>) -> anyhow::Result<ApiServer> {
        let mut bound = Vec::new();
        let mut tasks = Vec::new();
        for host in &daemon.opts.hosts {
            let (proto, address) = split_addr(host);
            match proto {
                "tcp" => {
                    let address = if address.starts_with(':') {
                        format!("0.0.0.0{}", address)
                    } else {
                        address.to_string()
                    };
                    let listener = TcpListener::bind(&address)
                        .await
                        .with_context(|| format!("listen on {}", host))?;
                    let local = listener.local_addr()?;
                    bound.push(format!("tcp://{}", local));
                    let daemon = daemon.clone();
                    tasks.push(tokio::spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, peer)) => {
                                    let daemon = daemon.clone();
                                    tokio::spawn(async move {
                                        handle_connection(daemon, stream).await;
                                    });
                                    info!("Accepted connection from {}", peer);
                                }
                                Err(e) => {
                                    warn!("Accept failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }));
                }
                "unix" => {
                    // A stale socket from an unclean shutdown blocks the bind.
                    let _ = std::fs::remove_file(address);
                    let listener = UnixListener::bind(address)
                        .with_context(|| format!("listen on {}", host))?;
                    bound.push(host.clone());
                    let daemon = daemon.clone();
                    tasks.push(tokio::spawn(async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, _)) => {
                                    let daemon = daemon.clone();
                                    tokio::spawn(async move {
                                        handle_connection(daemon, stream).await;
                                    });
                                }
                                Err(e) => {
                                    warn!("Accept failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }));
                }
                other => anyhow::bail!("unsupported listen protocol: {}", other),
            }
        }
        Ok(ApiServer { bound, tasks })
    }

    /// Close the listeners; in-flight connections run to completion.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn handle_connection<S>(daemon: Arc<Daemon>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match proto::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read frame: {}", e);
                return;
            }
        };
        let authenticated = frame.verify(&daemon.opts.psk.key);
        let reply_body = if authenticated {
            dispatch(&daemon, frame.method, &frame.body).await
        } else {
            warn!(
                "Rejecting frame from {:?}: PSK authentication failed",
                frame.identity
            );
            encode_reply::<()>(Err(ErrorKind::PeerRejected(
                "PSK authentication failed".to_string(),
            )))
        };
        let reply = Frame::seal(frame.method, &daemon.opts.psk, reply_body);
        if let Err(e) = proto::write_frame(&mut stream, &reply).await {
            warn!("Failed to write reply: {}", e);
            return;
        }
        if !authenticated {
            return;
        }
    }
}

fn decode_args<T: DeserializeOwned>(body: &[u8]) -> Result<T, ErrorKind> {
    serde_cbor::from_slice(body)
        .map_err(|e| ErrorKind::PeerRejected(format!("undecodable args: {}", e)))
}

fn reply_with<A, R, F>(body: &[u8], call: F) -> Vec<u8>
where
    A: DeserializeOwned,
    R: Serialize,
    F: FnOnce(A) -> Result<R, ErrorKind>,
{
    encode_reply(decode_args(body).and_then(call))
}

async fn dispatch(daemon: &Arc<Daemon>, method: u8, body: &[u8]) -> Vec<u8> {
    match method {
        proto::METHOD_ECHO => match decode_args::<proto::EchoArgs>(body) {
            Ok(args) => encode_reply(
                echo(&daemon.opts, &args.host, args.value)
                    .await
                    .map(|value| proto::EchoReply { value }),
            ),
            Err(e) => encode_reply::<proto::EchoReply>(Err(e)),
        },
        proto::METHOD_GET_SRC_IP => reply_with(body, |args: proto::GetSrcIpArgs| {
            Ok(proto::GetSrcIpReply {
                src: daemon.tunnels.get_src_ip(args.dst),
            })
        }),
        proto::METHOD_BUILD_TUNNEL => reply_with(body, |args: proto::BuildTunnelArgs| {
            daemon
                .tunnels
                .build_tunnel(args.dst, args.tunnel)
                .map(|(src, tunnel)| proto::BuildTunnelReply { src, tunnel })
        }),
        proto::METHOD_DESTROY_TUNNEL => reply_with(body, |args: proto::DestroyTunnelArgs| {
            daemon
                .tunnels
                .destroy_tunnel(args.dst)
                .map(|src| proto::DestroyTunnelReply { src })
        }),
        proto::METHOD_CREATE_TUNNEL => match decode_args::<proto::CreateTunnelArgs>(body) {
            Ok(args) => encode_reply(
                daemon
                    .tunnels
                    .create_tunnel(&args.host, args.udp)
                    .await
                    .map(|(src, dst)| proto::CreateTunnelReply { src, dst }),
            ),
            Err(e) => encode_reply::<proto::CreateTunnelReply>(Err(e)),
        },
        proto::METHOD_DELETE_TUNNEL => match decode_args::<proto::DeleteTunnelArgs>(body) {
            Ok(args) => encode_reply(
                daemon
                    .tunnels
                    .delete_tunnel(&args.host)
                    .await
                    .map(|()| proto::DeleteTunnelReply {}),
            ),
            Err(e) => encode_reply::<proto::DeleteTunnelReply>(Err(e)),
        },
        proto::METHOD_CREATE_SEGMENT => match decode_args::<proto::CreateSegmentArgs>(body) {
            Ok(args) => encode_reply(
                daemon
                    .segments
                    .create_segment(&args.id, args.init, args.trig)
                    .await
                    .map(|url| proto::CreateSegmentReply { url }),
            ),
            Err(e) => encode_reply::<proto::CreateSegmentReply>(Err(e)),
        },
        proto::METHOD_DELETE_SEGMENT => match decode_args::<proto::DeleteSegmentArgs>(body) {
            Ok(args) => encode_reply(
                daemon
                    .segments
                    .delete_segment(&args.id)
                    .await
                    .map(|()| proto::DeleteSegmentReply {}),
            ),
            Err(e) => encode_reply::<proto::DeleteSegmentReply>(Err(e)),
        },
        other => {
            warn!("Unknown method {:#x}", other);
            encode_reply::<()>(Err(ErrorKind::PeerRejected(format!(
                "unknown method {:#x}",
                other
            ))))
        }
    }
}
