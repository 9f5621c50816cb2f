//! Weft ledger node binary.
//!
//! Runs a full weft node: sled-backed event store, HTTP gossip server,
//! and the per-ledger worker loop.
//!
//! Usage:
//!   weft-node                                  # run node (default)
//!   weft-node node --listen 0.0.0.0:9760       # run node (explicit)
//!   weft-node init-genesis --name my-ledger    # bootstrap a new ledger

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use weft::block::{build_genesis, GenesisBundle, LedgerConfiguration, WitnessProfile};
use weft::config::WeftConfig;
use weft::consensus::ConsensusRegistry;
use weft::crypto::keys::load_or_generate_keypair;
use weft::event::CreatorId;
use weft::gossip::http::{serve, HttpState, HttpTransport};
use weft::node::{AcceptAllOperations, LedgerNode};

/// Weft BFT DAG ledger node.
#[derive(Parser, Debug)]
#[command(name = "weft-node", version, about = "Weft continuity ledger node")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "./weft.toml", global = true)]
    config: PathBuf,

    /// Data directory (overrides the config file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the weft node.
    Node {
        /// Gossip HTTP listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Address other peers should use to reach this node.
        #[arg(long)]
        advertise: Option<String>,

        /// Path to the shared genesis bundle.
        #[arg(long)]
        genesis: Option<PathBuf>,
    },

    /// Bootstrap a new ledger: generate the genesis bundle file.
    InitGenesis {
        /// Ledger name.
        #[arg(long, default_value = "weft")]
        name: String,

        /// Output path for the genesis bundle.
        #[arg(long, default_value = "./genesis.json")]
        out: PathBuf,

        /// Optional JSON file with additional witness profiles
        /// (`[{"id": ..., "public_key": ..., "address": ...}]`).
        #[arg(long)]
        witnesses: Option<PathBuf>,

        /// This node's advertised gossip address.
        #[arg(long, default_value = "http://127.0.0.1:9760")]
        advertise: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WeftConfig::load(&cli.config)?;
    if let Some(data_dir) = &cli.data_dir {
        config.node.data_dir = data_dir.display().to_string();
    }

    match cli.command {
        Some(Command::InitGenesis {
            name,
            out,
            witnesses,
            advertise,
        }) => init_genesis(&config, name, out, witnesses, advertise),
        Some(Command::Node {
            listen,
            advertise,
            genesis,
        }) => {
            if let Some(listen) = listen {
                config.node.listen_addr = listen;
            }
            if let Some(advertise) = advertise {
                config.node.advertised_addr = advertise;
            }
            if let Some(genesis) = genesis {
                config.node.genesis_path = genesis.display().to_string();
            }
            run_node(config)
        }
        None => run_node(config),
    }
}

/// Build and write the genesis bundle for a new ledger.
fn init_genesis(
    config: &WeftConfig,
    name: String,
    out: PathBuf,
    witnesses: Option<PathBuf>,
    advertise: String,
) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&config.node.data_dir);
    let keypair = load_or_generate_keypair(&data_dir)?;

    let mut witness_pool = vec![WitnessProfile {
        id: CreatorId::from_key(&keypair.public),
        public_key: keypair.public.clone(),
        address: advertise,
    }];
    if let Some(path) = witnesses {
        let contents = std::fs::read_to_string(&path)?;
        let extra: Vec<WitnessProfile> = serde_json::from_str(&contents)?;
        witness_pool.extend(extra);
    }

    let configuration = LedgerConfiguration { name, witness_pool };
    let genesis = build_genesis(&keypair, configuration, weft::now_ms());
    std::fs::write(&out, serde_json::to_vec_pretty(&genesis)?)?;
    tracing::info!(
        ledger = %genesis.ledger,
        witnesses = genesis.configuration.witness_pool.len(),
        path = %out.display(),
        "Wrote genesis bundle"
    );
    Ok(())
}

/// Run the node until ctrl-c.
fn run_node(config: WeftConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let data_dir = PathBuf::from(&config.node.data_dir);
        let keypair = load_or_generate_keypair(&data_dir)?;

        let genesis_bytes = std::fs::read(&config.node.genesis_path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "cannot read genesis bundle {} (run init-genesis first): {e}",
                    config.node.genesis_path
                ),
            )
        })?;
        let genesis: GenesisBundle = serde_json::from_slice(&genesis_bytes)?;

        let db = sled::open(data_dir.join("db"))?;
        let transport = Arc::new(HttpTransport::new(config.continuity.pull_timeout_ms));
        let (node, worker) = LedgerNode::build(
            db,
            &genesis,
            keypair,
            config.node.advertised_addr.clone(),
            config.continuity.clone(),
            transport,
            Arc::new(AcceptAllOperations),
            &ConsensusRegistry::standard(),
            "Continuity2017",
        )?;

        let listener = tokio::net::TcpListener::bind(config.node.listen_addr).await?;
        tracing::info!(
            ledger = %node.store.ledger(),
            listen = %config.node.listen_addr,
            peer = %node.local_id,
            "Weft node started"
        );

        let http_state = HttpState {
            gossip: node.server.clone(),
            store: node.store.clone(),
            api: Some(node.api.clone()),
        };
        let server_task = tokio::spawn(serve(listener, http_state));
        let worker_task = tokio::spawn(worker.run());

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
        node.halt();
        let _ = worker_task.await;
        server_task.abort();
        tracing::info!("Node stopped");
        Ok(())
    })
}
