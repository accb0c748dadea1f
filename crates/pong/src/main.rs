//! Echo helper: listens, echoes the first payload back, then exits.
//! Round-trip scenarios run it as the far end of a proxy chain.

use std::process::exit;

use log::error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    env_logger::init();
    let host = std::env::args().nth(1).unwrap_or_else(|| ":9001".to_string());
    let addr = if host.starts_with(':') {
        format!("0.0.0.0{}", host)
    } else {
        host
    };
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Listen error: {}", e);
            exit(1);
        }
    };
    loop {
        let (mut conn, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                exit(1);
            }
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => {}
                Ok(n) => {
                    if conn.write_all(&buf[..n]).await.is_ok() {
                        exit(0);
                    }
                }
            }
        });
    }
}
