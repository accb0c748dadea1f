//! Peer RPC client.
//!
//! One [`PeerClient`] wraps one authenticated stream to a peer daemon and
//! issues the typed request/reply methods over it. Dial addresses use the
//! `validate_addr` form (`tcp://host:port` or `unix://path`).

use std::io;
use std::net::IpAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::addr::split_addr;
use crate::command::{SegmentCommand, Tunnel};
use crate::error::ErrorKind;
use crate::proto::{self, Frame, PskConfig};

/// Object-safe alias for the dialed stream.
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RpcStream for T {}

pub struct PeerClient {
    stream: Box<dyn RpcStream>,
    psk: PskConfig,
}

impl PeerClient {
    /// Dial a peer daemon at `host` (a validated bind address).
    pub async fn connect(host: &str, psk: &PskConfig) -> Result<PeerClient, ErrorKind> {
        let (proto, address) = split_addr(host);
        let stream: Box<dyn RpcStream> = match proto {
            "unix" => Box::new(
                UnixStream::connect(address)
                    .await
                    .map_err(|e| unreachable_err(host, e))?,
            ),
            "tcp" => {
                // A wildcard or empty host dials loopback.
                let address = if address.starts_with(':') {
                    format!("127.0.0.1{}", address)
                } else {
                    address.to_string()
                };
                Box::new(
                    TcpStream::connect(&address)
                        .await
                        .map_err(|e| unreachable_err(host, e))?,
                )
            }
            other => {
                return Err(ErrorKind::InvalidAddress(format!(
                    "unsupported dial protocol: {}",
                    other
                )))
            }
        };
        Ok(PeerClient {
            stream,
            psk: psk.clone(),
        })
    }

    async fn call<A, R>(&mut self, method: u8, args: &A) -> Result<R, ErrorKind>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = serde_cbor::to_vec(args)
            .map_err(|e| ErrorKind::PeerRejected(format!("unencodable args: {}", e)))?;
        let frame = Frame::seal(method, &self.psk, body);
        proto::write_frame(&mut self.stream, &frame)
            .await
            .map_err(|e| unreachable_err("peer", e))?;
        let reply = proto::read_frame(&mut self.stream)
            .await
            .map_err(|e| unreachable_err("peer", e))?
            .ok_or_else(|| ErrorKind::PeerUnreachable("connection closed".to_string()))?;
        if !reply.verify(&self.psk.key) {
            return Err(ErrorKind::PeerRejected(
                "reply failed PSK authentication".to_string(),
            ));
        }
        if reply.method != method {
            return Err(ErrorKind::PeerRejected(format!(
                "reply method {:#x} does not match request {:#x}",
                reply.method, method
            )));
        }
        proto::decode_reply(&reply.body)
    }

    pub async fn echo(&mut self, value: Vec<u8>, host: &str) -> Result<Vec<u8>, ErrorKind> {
        let reply: proto::EchoReply = self
            .call(
                proto::METHOD_ECHO,
                &proto::EchoArgs {
                    value,
                    host: host.to_string(),
                },
            )
            .await?;
        Ok(reply.value)
    }

    pub async fn get_src_ip(&mut self, dst: Option<IpAddr>) -> Result<IpAddr, ErrorKind> {
        let reply: proto::GetSrcIpReply = self
            .call(proto::METHOD_GET_SRC_IP, &proto::GetSrcIpArgs { dst })
            .await?;
        Ok(reply.src)
    }

    pub async fn build_tunnel(
        &mut self,
        dst: IpAddr,
        tunnel: &Tunnel,
    ) -> Result<(IpAddr, Tunnel), ErrorKind> {
        let reply: proto::BuildTunnelReply = self
            .call(
                proto::METHOD_BUILD_TUNNEL,
                &proto::BuildTunnelArgs {
                    dst,
                    tunnel: tunnel.clone(),
                },
            )
            .await?;
        Ok((reply.src, reply.tunnel))
    }

    pub async fn destroy_tunnel(&mut self, dst: IpAddr) -> Result<IpAddr, ErrorKind> {
        let reply: proto::DestroyTunnelReply = self
            .call(proto::METHOD_DESTROY_TUNNEL, &proto::DestroyTunnelArgs { dst })
            .await?;
        Ok(reply.src)
    }

    pub async fn create_tunnel(
        &mut self,
        host: &str,
        udp: bool,
    ) -> Result<(IpAddr, IpAddr), ErrorKind> {
        let reply: proto::CreateTunnelReply = self
            .call(
                proto::METHOD_CREATE_TUNNEL,
                &proto::CreateTunnelArgs {
                    host: host.to_string(),
                    udp,
                },
            )
            .await?;
        Ok((reply.src, reply.dst))
    }

    pub async fn delete_tunnel(&mut self, host: &str) -> Result<(), ErrorKind> {
        let _: proto::DeleteTunnelReply = self
            .call(
                proto::METHOD_DELETE_TUNNEL,
                &proto::DeleteTunnelArgs {
                    host: host.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn create_segment(
        &mut self,
        id: &str,
        init: Vec<SegmentCommand>,
        trig: Vec<SegmentCommand>,
    ) -> Result<String, ErrorKind> {
        let reply: proto::CreateSegmentReply = self
            .call(
                proto::METHOD_CREATE_SEGMENT,
                &proto::CreateSegmentArgs {
                    id: id.to_string(),
                    init,
                    trig,
                },
            )
            .await?;
        Ok(reply.url)
    }

    pub async fn delete_segment(&mut self, id: &str) -> Result<(), ErrorKind> {
        let _: proto::DeleteSegmentReply = self
            .call(
                proto::METHOD_DELETE_SEGMENT,
                &proto::DeleteSegmentArgs { id: id.to_string() },
            )
            .await?;
        Ok(())
    }
}

fn unreachable_err(host: &str, err: io::Error) -> ErrorKind {
    ErrorKind::PeerUnreachable(format!("{}: {}", host, err))
}
