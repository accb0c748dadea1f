//! Framed RPC wire protocol.
//!
//! Every message is a u32 big-endian length followed by a CBOR-encoded
//! [`Frame`]. A frame names its method, carries the sender's PSK identity
//! (its hostname), the CBOR body of the method's args or reply, and an
//! HMAC-SHA256 tag over the rest of the frame keyed with the pre-shared key.
//! Tags are compared in constant time; a frame that fails verification is
//! rejected before its body is ever decoded.

use std::net::IpAddr;
use std::path::Path;

use hmac::{Hmac, Mac};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::{SegmentCommand, Tunnel};
use crate::error::ErrorKind;

pub const METHOD_ECHO: u8 = 0x21;
pub const METHOD_GET_SRC_IP: u8 = 0x22;
pub const METHOD_BUILD_TUNNEL: u8 = 0x23;
pub const METHOD_DESTROY_TUNNEL: u8 = 0x24;
pub const METHOD_CREATE_TUNNEL: u8 = 0x25;
pub const METHOD_DELETE_TUNNEL: u8 = 0x26;
pub const METHOD_CREATE_SEGMENT: u8 = 0x27;
pub const METHOD_DELETE_SEGMENT: u8 = 0x28;

/// Upper bound on a single frame; segment programs are small and tunnel
/// records are fixed-size, so anything larger is a protocol violation.
pub const MAX_FRAME: u32 = 1 << 20;

const INSECURE_KEY: &str = "wormhole";

/// Pre-shared key plus the identity presented with it.
#[derive(Debug, Clone)]
pub struct PskConfig {
    pub key: String,
    pub identity: String,
}

impl PskConfig {
    /// Load the PSK from a keyfile. A missing or unreadable file falls back
    /// to the insecure default key with a loud warning, matching the CLI
    /// contract: a daemon must never refuse to start over a missing keyfile.
    pub fn load(keyfile: &Path) -> PskConfig {
        let key = match std::fs::read(keyfile) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!("Failed to open keyfile {}: {}", keyfile.display(), err);
                warn!("** WARNING: USING INSECURE PRE-SHARED-KEY **");
                INSECURE_KEY.to_string()
            }
        };
        PskConfig {
            key,
            identity: default_identity(),
        }
    }
}

/// The local hostname, used as the PSK identity on every frame.
pub fn default_identity() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => INSECURE_KEY.to_string(),
    }
}

/// One request or reply on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub method: u8,
    pub identity: String,
    pub body: Vec<u8>,
    pub tag: Option<[u8; 32]>,
}

impl Frame {
    /// Build an authenticated frame for `body` under the shared key.
    pub fn seal(method: u8, psk: &PskConfig, body: Vec<u8>) -> Frame {
        let mut frame = Frame {
            method,
            identity: psk.identity.clone(),
            body,
            tag: None,
        };
        let bytes = serde_cbor::to_vec(&frame).expect("frame encoding cannot fail");
        frame.tag = Some(calculate_hmac(&psk.key, &bytes));
        frame
    }

    /// Verify the frame's tag against the shared key, in constant time.
    pub fn verify(&self, key: &str) -> bool {
        let mut check = self.clone();
        let tag = match check.tag.take() {
            Some(tag) => tag,
            None => return false,
        };
        let bytes = match serde_cbor::to_vec(&check) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let expected = calculate_hmac(key, &bytes);
        tag.ct_eq(&expected).into()
    }
}

fn calculate_hmac(key: &str, data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_cbor::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame; `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let frame = serde_cbor::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

/// Reply body: the method's reply value or a typed error.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResult<T> {
    Ok(T),
    Err(ErrorKind),
}

impl<T> RpcResult<T> {
    pub fn into_result(self) -> Result<T, ErrorKind> {
        match self {
            RpcResult::Ok(v) => Ok(v),
            RpcResult::Err(e) => Err(e),
        }
    }
}

impl<T> From<Result<T, ErrorKind>> for RpcResult<T> {
    fn from(r: Result<T, ErrorKind>) -> Self {
        match r {
            Ok(v) => RpcResult::Ok(v),
            Err(e) => RpcResult::Err(e),
        }
    }
}

/// Encode a reply body.
pub fn encode_reply<T: Serialize>(result: Result<T, ErrorKind>) -> Vec<u8> {
    serde_cbor::to_vec(&RpcResult::from(result)).expect("reply encoding cannot fail")
}

/// Decode a reply body.
pub fn decode_reply<T: DeserializeOwned>(body: &[u8]) -> Result<T, ErrorKind> {
    let result: RpcResult<T> = serde_cbor::from_slice(body)
        .map_err(|e| ErrorKind::PeerRejected(format!("undecodable reply: {}", e)))?;
    result.into_result()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EchoArgs {
    pub value: Vec<u8>,
    pub host: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EchoReply {
    pub value: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetSrcIpArgs {
    pub dst: Option<IpAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetSrcIpReply {
    pub src: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildTunnelArgs {
    pub dst: IpAddr,
    pub tunnel: Tunnel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildTunnelReply {
    pub src: IpAddr,
    pub tunnel: Tunnel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyTunnelArgs {
    pub dst: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyTunnelReply {
    pub src: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTunnelArgs {
    pub host: String,
    pub udp: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTunnelReply {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTunnelArgs {
    pub host: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTunnelReply {}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSegmentArgs {
    pub id: String,
    pub init: Vec<SegmentCommand>,
    pub trig: Vec<SegmentCommand>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSegmentReply {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteSegmentArgs {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteSegmentReply {}

#[cfg(test)]
mod tests {
    use super::*;

    fn psk() -> PskConfig {
        PskConfig {
            key: "test-key".to_string(),
            identity: "testhost".to_string(),
        }
    }

    #[test]
    fn test_seal_verify_roundtrip() {
        let frame = Frame::seal(METHOD_ECHO, &psk(), vec![1, 2, 3]);
        assert!(frame.verify("test-key"));
        assert!(!frame.verify("other-key"));
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let mut frame = Frame::seal(METHOD_ECHO, &psk(), vec![1, 2, 3]);
        frame.body[0] = 9;
        assert!(!frame.verify("test-key"));
        frame.body[0] = 1;
        frame.identity = "mallory".to_string();
        assert!(!frame.verify("test-key"));
    }

    #[test]
    fn test_untagged_frame_rejected() {
        let mut frame = Frame::seal(METHOD_ECHO, &psk(), vec![]);
        frame.tag = None;
        assert!(!frame.verify("test-key"));
    }

    #[tokio::test]
    async fn test_frame_stream_roundtrip() {
        let frame = Frame::seal(
            METHOD_CREATE_SEGMENT,
            &psk(),
            serde_cbor::to_vec(&CreateSegmentArgs {
                id: "foo".to_string(),
                init: vec![SegmentCommand::new(crate::CommandKind::Url, false, ":40")],
                trig: vec![],
            })
            .unwrap(),
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, &frame).await.unwrap();
        cursor.set_position(0);
        let back = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(back.method, METHOD_CREATE_SEGMENT);
        assert!(back.verify("test-key"));
        let args: CreateSegmentArgs = serde_cbor::from_slice(&back.body).unwrap();
        assert_eq!(args.id, "foo");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_reply_error_roundtrip() {
        let body = encode_reply::<EchoReply>(Err(ErrorKind::IpInUse("100.65.0.1".into())));
        let err = decode_reply::<EchoReply>(&body).unwrap_err();
        assert!(err.is_ip_in_use());
    }
}
