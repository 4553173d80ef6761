use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ledger_lite::config::{NodeConfig, PeerConfig};
use ledger_lite::node::Node;
use ledger_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "ledger-lite")]
#[command(about = "A replicated log service with Raft consensus")]
struct Args {
    /// Node ID (unique identifier for this server)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Address peers should use to reach this server (defaults to
    /// 127.0.0.1:<port>)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for the durable log; omit to keep everything in memory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Write the initial cluster configuration into an empty log at startup.
    /// Pass to every member of a brand new cluster.
    #[arg(long)]
    bootstrap: bool,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let host = parts[1];
                let port = parts[2];
                let addr = format!("{}:{}", host, port);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let advertise_addr = args
        .advertise_addr
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));
    let peers = parse_peers(&args.peers);

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        advertise_addr,
        peers,
        storage_dir: args.storage_dir,
        bootstrap: args.bootstrap,
        ..NodeConfig::default()
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        advertise_addr = %config.advertise_addr,
        bootstrap = config.bootstrap,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting ledger-lite server"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}
