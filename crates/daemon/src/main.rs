use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ipnet::Ipv4Net;
use log::info;
use wormhole_common::addr::validate_addr;
use wormhole_common::PskConfig;
use wormholed::config::{self, Options, DEFAULT_CIDR, DEFAULT_KEYFILE, DEFAULT_PORT_RANGE};
use wormholed::kernel::KernelNet;
use wormholed::{ApiServer, Daemon, DockerRuntime, IpCommandKernel, StreamProxierFactory};

#[derive(Parser, Debug)]
#[command(
    name = "wormholed",
    version,
    about = "Wormhole proxy-overlay daemon",
    long_about = "Wormhole proxy-overlay daemon\n\n\
        Cooperates with peer daemons to build multi-hop tcp/udp proxy chains\n\
        across network namespaces and hosts, optionally over ipsec tunnels\n\
        with overlay addresses drawn from a shared cidr.\n\n\
        Examples:\n  \
          # Listen on the default port with tunnels sourced from 10.0.0.1\n  \
          wormholed -I 10.0.0.1\n\n  \
          # Bind two endpoints and use a dedicated overlay range\n  \
          wormholed -H tcp://:9999 -H unix:///var/run/wormhole -C 100.65.0.0/14"
)]
struct Args {
    /// Keyfile for psk auth (if not found defaults to insecure key)
    #[arg(short = 'K', long = "keyfile", default_value = DEFAULT_KEYFILE)]
    keyfile: PathBuf,

    /// Multiple tcp://host:port or unix://path/to/socket to bind
    #[arg(short = 'H', long = "host", action = clap::ArgAction::Append)]
    hosts: Vec<String>,

    /// Ip for tunnel (defaults to src of default route)
    #[arg(short = 'I', long = "ip")]
    external: Option<IpAddr>,

    /// Cidr for overlay ips (must be the same on all hosts)
    #[arg(short = 'C', long = "cidr", default_value = DEFAULT_CIDR)]
    cidr: Ipv4Net,

    /// Inclusive port range for udp tunnels
    #[arg(short = 'P', long = "ports", default_value = DEFAULT_PORT_RANGE)]
    ports: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut hosts = Vec::new();
    for host in &args.hosts {
        hosts.push(validate_addr(host)?);
    }
    if hosts.is_empty() {
        hosts.push(validate_addr("")?);
    }

    let kernel: Arc<dyn KernelNet> = Arc::new(IpCommandKernel);
    let external = config::resolve_external(kernel.as_ref(), args.external)?;
    let (udp_start_port, udp_end_port) = config::parse_port_range(&args.ports)?;
    let psk = PskConfig::load(&args.keyfile);

    let opts = Arc::new(Options {
        hosts,
        external,
        cidr: args.cidr,
        udp_start_port,
        udp_end_port,
        psk,
    });
    let daemon = Daemon::new(
        opts,
        kernel,
        Arc::new(DockerRuntime),
        Arc::new(StreamProxierFactory),
    );
    daemon.init();

    let server = ApiServer::bind(daemon.clone()).await?;
    info!("Serving on {:?}", server.bound);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    info!("Shutting down");
    daemon.shutdown().await;
    server.shutdown();
    Ok(())
}
