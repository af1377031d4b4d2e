//! bitmesh-node: run a mesh participant from the terminal
//!
//! Lines typed on stdin are broadcast. `/to <peer-hex> <text>` sends a
//! directed, acknowledged message; `/peers` lists the peer table;
//! `/fav <peer-hex>` toggles a favorite; `/quit` exits.

use anyhow::{Context, Result};
use bitmesh::delivery::DeliveryState;
use bitmesh::metrics::MetricsConfig;
use bitmesh::transport::{QuicRelayConfig, UdpMeshConfig};
use bitmesh::{Destination, MeshNode, NodeConfig, PeerId, SendReceipt};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer mesh messaging node", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name announced to other peers
    #[arg(short, long)]
    name: Option<String>,

    /// Local-mesh UDP bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Local-mesh neighbor to contact directly (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// QUIC relay to connect to (repeatable)
    #[arg(long = "relay")]
    relays: Vec<SocketAddr>,

    /// Accept self-signed relay certificates
    #[arg(long)]
    insecure: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics: Option<SocketAddr>,

    /// Secret key file, created on first run
    #[arg(long)]
    identity: Option<PathBuf>,

    /// SQLite URL for the peer table
    #[arg(long)]
    database: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if self.name.is_some() {
            config.display_name = self.name;
        }
        if self.identity.is_some() {
            config.identity_path = self.identity;
        }
        if self.database.is_some() {
            config.database_url = self.database;
        }
        if self.bind.is_some() || !self.seeds.is_empty() {
            let mesh = config.mesh.get_or_insert_with(UdpMeshConfig::default);
            if let Some(bind) = self.bind {
                mesh.bind_addr = bind;
            }
            mesh.seeds.extend(self.seeds);
        }
        if !self.relays.is_empty() || self.insecure {
            let relay = config.relay.get_or_insert_with(QuicRelayConfig::default);
            relay.relays.extend(self.relays);
            relay.insecure_skip_verify |= self.insecure;
        }
        if let Some(addr) = self.metrics {
            config.metrics = Some(MetricsConfig::with_addr(addr));
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bitmesh=info")),
        )
        .with_target(false)
        .init();

    let config = Args::parse().into_config()?;
    let (node, report) = MeshNode::start(config)
        .await
        .context("Failed to start node")?;
    let node = Arc::new(node);

    println!("Peer ID: {}", report.peer_id);
    if let Some(addr) = node.mesh_addr() {
        println!("Local mesh on {}", addr);
    }
    if let Some(addr) = node.relay_addr() {
        println!("Relay endpoint on {}", addr);
    }
    for (kind, error) in &report.failures {
        eprintln!("{} transport unavailable: {}", kind.as_str(), error);
    }

    let mut inbox = node.subscribe_messages();
    let printer = {
        let node = node.clone();
        tokio::spawn(async move {
            while let Ok(message) = inbox.recv().await {
                let label = node
                    .registry()
                    .lookup(&message.sender)
                    .map(|peer| peer.label())
                    .unwrap_or_else(|| message.sender.short());
                let scope = if message.destination.is_broadcast() { "*" } else { "@" };
                println!("[{}{}] {}", scope, label, String::from_utf8_lossy(&message.payload));
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !handle_line(&node, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    printer.abort();
    node.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit
async fn handle_line(node: &Arc<MeshNode>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if line == "/quit" {
        return false;
    }

    if line == "/peers" {
        for peer in node.peers() {
            println!(
                "{}{}{}",
                peer.label(),
                if peer.favorite { " *" } else { "" },
                if peer.stale { " (stale)" } else { "" }
            );
        }
        return true;
    }

    if let Some(rest) = line.strip_prefix("/fav ") {
        match rest.trim().parse::<PeerId>() {
            Ok(peer) => {
                let favorite = !node
                    .registry()
                    .lookup(&peer)
                    .map(|p| p.favorite)
                    .unwrap_or(false);
                if !node.set_favorite(&peer, favorite) {
                    println!("Unknown peer {}", peer.short());
                }
            }
            Err(e) => println!("{}", e),
        }
        return true;
    }

    if let Some(rest) = line.strip_prefix("/to ") {
        let Some((peer, text)) = rest.split_once(' ') else {
            println!("Usage: /to <peer-hex> <text>");
            return true;
        };
        let peer = match peer.parse::<PeerId>() {
            Ok(peer) => peer,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };
        match node.send(Destination::Peer(peer), text.as_bytes().to_vec()).await {
            Ok(SendReceipt::Tracked { mut state, .. }) => {
                tokio::spawn(async move {
                    if let Ok(settled) = state.wait_for(|s| s.is_terminal()).await.map(|s| *s) {
                        match settled {
                            DeliveryState::Acknowledged => println!("-> {} delivered", peer.short()),
                            other => println!("-> {} not delivered: {:?}", peer.short(), other),
                        }
                    }
                });
            }
            Ok(_) => {}
            Err(e) => println!("Send failed: {}", e),
        }
        return true;
    }

    if let Err(e) = node
        .send(Destination::Broadcast, line.as_bytes().to_vec())
        .await
    {
        println!("Send failed: {}", e);
    }
    true
}
