use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use wormhole_common::addr::validate_addr;
use wormhole_common::{PeerClient, PskConfig};

mod parser;

const DEFAULT_KEYFILE: &str = "/etc/wormhole/key.secret";

const CREATE_HELP: &str = "\
Creates a proxy wormhole. The wormhole has a head and a tail. The head
represents where the proxy listens, and the tail represents where the
proxy connects. Both the head and the tail have the following values:

    protocol: the protocol of the connection (currently udp or tcp)
    namespace: the network namespace of the connection
    host: hostname or ip address of the connection
    port: port of the connection

Prints the id and the listen url of the wormhole.

SUBCOMMANDS:
    url URL          set the current data to values specified in URL, which
                     is in the form {protocol://}{namespace@}{host}{:port}
    id ID            set the id of the wormhole to ID
    docker-ns ID     set the namespace using docker container ID
    docker-run ARGS  docker run using ARGS and use the container's namespace
    child            create a child wormhole using the current proxy values
                     as a base; everything following applies to the child
    chain            like child, but also point the current wormhole's tail
                     at the child so bytes flow through it
    remote HOST      create a child wormhole on HOST and point the tail at it
    tunnel HOST      create an ipsec tunnel to HOST, then a child wormhole
                     on HOST reached over the tunnel
    udptunnel HOST   like tunnel, with espinudp encapsulation
    tail             all following commands modify the tail instead of the head
    trigger          all following commands modify the tail and are executed
                     when something connects to the head";

#[derive(Parser, Debug)]
#[command(
    name = "wormhole",
    version,
    about = "Client for the wormhole proxy-overlay daemon"
)]
struct Args {
    /// Keyfile for psk auth (if not found defaults to insecure key)
    #[arg(short = 'K', long = "keyfile", default_value = DEFAULT_KEYFILE)]
    keyfile: PathBuf,

    /// Server tcp://host:port or unix://path/to/socket
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1")]
    host: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping wormholed and print the latency in milliseconds
    Ping {
        /// Forward the echo through the daemon on HOST
        host: Option<String>,
    },
    /// Create a proxy wormhole from segment subcommands
    #[command(after_help = CREATE_HELP)]
    Create {
        /// Segment subcommands
        #[arg(num_args = 0.., trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Delete the proxy wormhole ID
    Delete { id: String },
    /// Create an ipsec tunnel to HOST and print the overlay source and
    /// destination addresses
    TunnelCreate {
        /// Use espinudp encapsulation
        #[arg(long)]
        udp: bool,
        host: String,
    },
    /// Delete the ipsec tunnel to HOST
    TunnelDelete { host: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let psk = PskConfig::load(&args.keyfile);
    let server = validate_addr(&args.host)?;
    let mut client = PeerClient::connect(&server, &psk).await?;

    match args.command {
        Command::Ping { host } => {
            let host = match host {
                Some(host) => validate_addr(&host)?,
                None => String::new(),
            };
            let mut value = vec![0u8; 16];
            OsRng.fill_bytes(&mut value);
            let start = Instant::now();
            let result = client.echo(value.clone(), &host).await?;
            if result != value {
                bail!("Incorrect response from echo");
            }
            debug!("Reply took {:?}: {:?}", start.elapsed(), result);
            println!("{:.6}", start.elapsed().as_secs_f64() * 1000.0);
        }
        Command::Create { args } => {
            let (id, init, trig) = parser::parse_segment(&args)?;
            let url = client.create_segment(&id, init, trig).await?;
            println!("{} {}", id, url);
        }
        Command::Delete { id } => {
            client.delete_segment(&id).await?;
        }
        Command::TunnelCreate { udp, host } => {
            let host = validate_addr(&host)?;
            let (src, dst) = client.create_tunnel(&host, udp).await?;
            println!("{} {}", src, dst);
        }
        Command::TunnelDelete { host } => {
            let host = validate_addr(&host)?;
            client.delete_tunnel(&host).await?;
        }
    }
    Ok(())
}
