//! Proxier collaborator: the byte-moving engine behind a segment's head.
//!
//! The segment layer only depends on the [`Proxier`] trait (bind a service,
//! stop it, pin it to a namespace) and feeds it upstream endpoints through
//! the pull-based [`EndpointResolver`] callback on each new head connection.
//! [`StreamProxier`] is the stock implementation: a TCP splice and a UDP
//! datagram relay, both able to bind and dial inside network namespaces.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use wormhole_common::ErrorKind;

use crate::netns::{with_netns, NsHandle};

/// Pull callback invoked once per new head connection; returns the resolved
/// tail as `(namespace, host:port)`.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn next_endpoint(
        &self,
        service: &str,
        src: SocketAddr,
    ) -> Result<(NsHandle, String), ErrorKind>;
}

/// The proxy engine contract assumed by the segment executor.
#[async_trait]
pub trait Proxier: Send + Sync {
    /// Pin subsequent binds to a namespace.
    fn set_ns(&mut self, ns: NsHandle);

    /// Bind a named service; `port = 0` auto-picks. Returns the bound port.
    async fn add_service(&mut self, name: &str, proto: &str, port: u16)
        -> Result<u16, ErrorKind>;

    /// Stop a named service and release its listener.
    async fn stop_proxy(&mut self, name: &str);
}

/// Builds a proxier for a segment's head.
pub trait ProxierFactory: Send + Sync {
    fn new_proxier(&self, resolver: Arc<dyn EndpointResolver>, host: &str) -> Box<dyn Proxier>;
}

#[derive(Debug, Default)]
pub struct StreamProxierFactory;

impl ProxierFactory for StreamProxierFactory {
    fn new_proxier(&self, resolver: Arc<dyn EndpointResolver>, host: &str) -> Box<dyn Proxier> {
        Box::new(StreamProxier {
            resolver,
            host: host.to_string(),
            ns: NsHandle::none(),
            services: HashMap::new(),
        })
    }
}

pub struct StreamProxier {
    resolver: Arc<dyn EndpointResolver>,
    host: String,
    ns: NsHandle,
    services: HashMap<String, JoinHandle<()>>,
}

#[async_trait]
impl Proxier for StreamProxier {
    fn set_ns(&mut self, ns: NsHandle) {
        self.ns = ns;
    }

    async fn add_service(
        &mut self,
        name: &str,
        proto: &str,
        port: u16,
    ) -> Result<u16, ErrorKind> {
        let addr = format!("{}:{}", self.host, port);
        let (port, handle) = match proto {
            "tcp" => serve_tcp(self.resolver.clone(), name, &self.ns, &addr).await?,
            "udp" => serve_udp(self.resolver.clone(), name, &self.ns, &addr).await?,
            other => {
                return Err(ErrorKind::InvalidAddress(format!(
                    "unsupported proxy protocol: {}",
                    other
                )))
            }
        };
        if let Some(old) = self.services.insert(name.to_string(), handle) {
            old.abort();
        }
        info!("Proxying {} service {} on port {}", proto, name, port);
        Ok(port)
    }

    async fn stop_proxy(&mut self, name: &str) {
        if let Some(handle) = self.services.remove(name) {
            handle.abort();
            // The listener is released once the task is fully torn down.
            let _ = handle.await;
        }
    }
}

impl Drop for StreamProxier {
    fn drop(&mut self) {
        for handle in self.services.values() {
            handle.abort();
        }
    }
}

async fn serve_tcp(
    resolver: Arc<dyn EndpointResolver>,
    name: &str,
    ns: &NsHandle,
    addr: &str,
) -> Result<(u16, JoinHandle<()>), ErrorKind> {
    let bind_ns = ns.clone();
    let bind_addr = addr.to_string();
    let listener = tokio::task::spawn_blocking(move || {
        with_netns(&bind_ns, || {
            let listener = std::net::TcpListener::bind(&bind_addr)?;
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
    })
    .await
    .map_err(|e| ErrorKind::KernelOpFailed(format!("bind task: {}", e)))?
    .map_err(|e| ErrorKind::InvalidAddress(format!("bind {}: {}", addr, e)))?;
    let listener = TcpListener::from_std(listener)
        .map_err(|e| ErrorKind::InvalidAddress(format!("bind {}: {}", addr, e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| ErrorKind::InvalidAddress(e.to_string()))?
        .port();

    let service = name.to_string();
    let handle = tokio::spawn(async move {
        loop {
            let (mut conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed for {}: {}", service, e);
                    break;
                }
            };
            let resolver = resolver.clone();
            let service = service.clone();
            tokio::spawn(async move {
                let (ns, target) = match resolver.next_endpoint(&service, peer).await {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        warn!("Dropping connection from {}: {}", peer, e);
                        return;
                    }
                };
                match dial_tcp(&ns, &target).await {
                    Ok(mut upstream) => {
                        let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                    }
                    Err(e) => warn!("Failed to dial {}: {}", target, e),
                }
            });
        }
    });
    Ok((port, handle))
}

async fn dial_tcp(ns: &NsHandle, target: &str) -> std::io::Result<TcpStream> {
    let ns = ns.clone();
    let target = target.to_string();
    let stream = tokio::task::spawn_blocking(move || {
        with_netns(&ns, || {
            let stream = std::net::TcpStream::connect(&target)?;
            stream.set_nonblocking(true)?;
            Ok(stream)
        })
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    TcpStream::from_std(stream)
}

async fn serve_udp(
    resolver: Arc<dyn EndpointResolver>,
    name: &str,
    ns: &NsHandle,
    addr: &str,
) -> Result<(u16, JoinHandle<()>), ErrorKind> {
    let bind_ns = ns.clone();
    let bind_addr = addr.to_string();
    let socket = tokio::task::spawn_blocking(move || {
        with_netns(&bind_ns, || {
            let socket = std::net::UdpSocket::bind(&bind_addr)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
    })
    .await
    .map_err(|e| ErrorKind::KernelOpFailed(format!("bind task: {}", e)))?
    .map_err(|e| ErrorKind::InvalidAddress(format!("bind {}: {}", addr, e)))?;
    let socket = Arc::new(
        UdpSocket::from_std(socket)
            .map_err(|e| ErrorKind::InvalidAddress(format!("bind {}: {}", addr, e)))?,
    );
    let port = socket
        .local_addr()
        .map_err(|e| ErrorKind::InvalidAddress(e.to_string()))?
        .port();

    let service = name.to_string();
    let handle = tokio::spawn(async move {
        let mut upstreams: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
        let mut buf = [0u8; 65536];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Receive failed for {}: {}", service, e);
                    break;
                }
            };
            let upstream = match upstreams.get(&peer) {
                Some(upstream) => upstream.clone(),
                None => {
                    let (ns, target) = match resolver.next_endpoint(&service, peer).await {
                        Ok(endpoint) => endpoint,
                        Err(e) => {
                            warn!("Dropping datagram from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let upstream = match dial_udp(&ns, &target).await {
                        Ok(upstream) => Arc::new(upstream),
                        Err(e) => {
                            warn!("Failed to dial {}: {}", target, e);
                            continue;
                        }
                    };
                    upstreams.insert(peer, upstream.clone());
                    // Reverse path: upstream replies go back to the client.
                    let reply_socket = socket.clone();
                    let reply_upstream = upstream.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 65536];
                        while let Ok(len) = reply_upstream.recv(&mut buf).await {
                            if reply_socket.send_to(&buf[..len], peer).await.is_err() {
                                break;
                            }
                        }
                    });
                    upstream
                }
            };
            if let Err(e) = upstream.send(&buf[..len]).await {
                warn!("Forward to upstream failed: {}", e);
                upstreams.remove(&peer);
            }
        }
    });
    Ok((port, handle))
}

async fn dial_udp(ns: &NsHandle, target: &str) -> std::io::Result<UdpSocket> {
    let ns = ns.clone();
    let target = target.to_string();
    let socket = tokio::task::spawn_blocking(move || {
        with_netns(&ns, || {
            let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(&target)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    UdpSocket::from_std(socket)
}
