use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use whanau::{Key, Node, ServerGroup, WalkStrategy, WhanauConfig};

/// A routing-store seed entry (format: KEY=SERVER[,SERVER...]).
#[derive(Clone, Debug)]
struct RecordArg {
    key: Key,
    servers: ServerGroup,
}

impl FromStr for RecordArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, servers) = s
            .split_once('=')
            .context("record must look like KEY=SERVER[,SERVER...]")?;
        if key.is_empty() {
            anyhow::bail!("record key must not be empty");
        }
        let servers = ServerGroup::new(servers.split(',').filter(|s| !s.is_empty()));
        if servers.is_empty() {
            anyhow::bail!("record {key} needs at least one server");
        }
        Ok(RecordArg {
            key: Key::from(key),
            servers,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "whanau")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Social-graph neighbor (IP:PORT). Repeat for each neighbor.
    #[arg(short, long = "neighbor", value_name = "ADDR")]
    neighbors: Vec<String>,

    /// Answer random walks like a Sybil node (single hop).
    #[arg(long)]
    sybil: bool,

    /// Seed the routing store (KEY=SERVER[,SERVER...]). Repeatable.
    #[arg(short, long = "record", value_name = "RECORD")]
    records: Vec<RecordArg>,

    /// Seconds between setup passes.
    #[arg(short, long, default_value = "30")]
    setup_interval: u64,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,

    #[arg(long, default_value_t = whanau_defaults().layer_count)]
    layers: usize,

    #[arg(long, default_value_t = whanau_defaults().finger_width)]
    finger_width: usize,

    #[arg(long, default_value_t = whanau_defaults().successor_width)]
    successor_width: usize,

    #[arg(long, default_value_t = whanau_defaults().mixing_steps)]
    mixing_steps: usize,

    #[arg(long, default_value_t = whanau_defaults().db_sample_size)]
    db_sample_size: usize,

    /// Precomputed walk endpoints to keep ready (0 disables).
    #[arg(long, default_value_t = 0)]
    walk_cache: usize,

    /// Nodes a lookup may visit before giving up, this one included.
    #[arg(long, default_value_t = whanau_defaults().max_lookup_hops)]
    max_lookup_hops: usize,
}

fn whanau_defaults() -> WhanauConfig {
    WhanauConfig::default()
}

impl Args {
    fn config(&self) -> WhanauConfig {
        WhanauConfig {
            layer_count: self.layers,
            finger_width: self.finger_width,
            successor_width: self.successor_width,
            mixing_steps: self.mixing_steps,
            db_sample_size: self.db_sample_size,
            walk_cache_capacity: self.walk_cache,
            max_lookup_hops: self.max_lookup_hops,
            ..WhanauConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let strategy = if args.sybil {
        WalkStrategy::Sybil
    } else {
        WalkStrategy::Honest
    };

    let node = Node::bind(
        &args.bind.to_string(),
        args.neighbors.clone(),
        strategy,
        args.config(),
    )
    .await?;
    info!("Node address: {}", node.address());

    for record in &args.records {
        node.insert_record(record.key.clone(), record.servers.clone())
            .await;
    }
    if args.neighbors.is_empty() {
        warn!("no neighbors configured; walks and setup will fail");
    }

    let _setup = node.spawn_periodic_setup(Duration::from_secs(args.setup_interval.max(1)));

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                info!(
                    stored_keys = snapshot.stored_keys,
                    db_sample = snapshot.db_sample_size,
                    layers = snapshot.layers,
                    fingers = snapshot.fingers,
                    successors = snapshot.successors,
                    generation = snapshot.generation,
                    walk_cache = snapshot.walk_cache_len,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
