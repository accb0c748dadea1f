//! Echo: the liveness probe behind `wormhole ping`.

use log::info;
use wormhole_common::addr::validate_addr;
use wormhole_common::{ErrorKind, PeerClient};

use crate::config::Options;

/// Echo `value` back, or forward the echo one hop to `host` and verify the
/// peer returned it unchanged.
pub async fn echo(opts: &Options, host: &str, value: Vec<u8>) -> Result<Vec<u8>, ErrorKind> {
    info!("Echo called with {:?} ({} bytes)", host, value.len());
    if host.is_empty() {
        return Ok(value);
    }
    let host = validate_addr(host)?;
    let mut client = PeerClient::connect(&host, &opts.psk).await?;
    let response = client.echo(value.clone(), "").await?;
    if response != value {
        return Err(ErrorKind::EchoMismatch);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wormhole_common::PskConfig;

    fn opts() -> Arc<Options> {
        Arc::new(Options {
            hosts: vec![],
            external: "127.0.0.1".parse().unwrap(),
            cidr: "100.65.0.0/14".parse().unwrap(),
            udp_start_port: 4500,
            udp_end_port: 4599,
            psk: PskConfig {
                key: "wormhole".to_string(),
                identity: "test".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn test_local_echo_returns_value() {
        let value = vec![1, 2, 3, 4];
        assert_eq!(echo(&opts(), "", value.clone()).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_forwarded_echo_to_bad_addr_fails() {
        assert!(echo(&opts(), "bad://host", vec![1]).await.is_err());
    }
}
