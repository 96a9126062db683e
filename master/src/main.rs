use clap::Parser;
use log::info;
use master::addrmap::AddrMapTable;
use master::games::{GamePolicy, PolicyMode};
use master::network::MasterServer;
use master::registry::{RegistryConfig, ServerRegistry};
use std::path::PathBuf;
use std::time::Duration;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind the master socket to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// UDP port to listen on
    #[clap(short, long, default_value = "27950")]
    port: u16,

    /// Bits of bucket index in the server hash tables (1-12)
    #[clap(long, default_value = "4")]
    hash_size: u8,

    /// Maximum number of registered servers
    #[clap(long, default_value = "4096")]
    max_servers: usize,

    /// Maximum number of servers per public address (0 = unlimited)
    #[clap(long, default_value = "8")]
    max_per_address: u32,

    /// Include ports when hashing server addresses
    #[clap(long)]
    hash_ports: bool,

    /// Refuse registrations from loopback addresses
    #[clap(long)]
    no_loopback: bool,

    /// Accept only these games (comma-separated)
    #[clap(long, value_delimiter = ',')]
    accept_games: Vec<String>,

    /// Reject these games and accept all others (comma-separated)
    #[clap(long, value_delimiter = ',')]
    reject_games: Vec<String>,

    /// Address mapping "from[:port]=to[:port]", repeatable
    #[clap(short = 'm', long = "addr-map")]
    addr_maps: Vec<String>,

    /// File the periodic server snapshot is written to
    #[clap(long)]
    snapshot_file: Option<PathBuf>,

    /// Seconds between snapshot writes
    #[clap(long, default_value = "300")]
    snapshot_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();

    // Game policy lines must all share one mode; a disagreement is fatal
    let mut policy = GamePolicy::new();
    if !args.accept_games.is_empty() {
        policy.declare(PolicyMode::Accept, &args.accept_games)?;
    }
    if !args.reject_games.is_empty() {
        policy.declare(PolicyMode::Reject, &args.reject_games)?;
    }

    // Resolve address mappings before the socket starts accepting packets;
    // this is the only place blocking name resolution happens
    let mut addrmaps = AddrMapTable::new();
    for mapping in &args.addr_maps {
        addrmaps.add(mapping)?;
    }
    addrmaps.resolve_all()?;

    let config = RegistryConfig {
        hash_size: args.hash_size,
        max_servers: args.max_servers,
        max_per_address: args.max_per_address,
        hash_ports: args.hash_ports,
        allow_loopback: !args.no_loopback,
        rng_seed: None,
    };
    let registry = ServerRegistry::new(config, addrmaps)?;

    let bind_addr = format!("{}:{}", args.host, args.port);
    info!("Starting master server on {}", bind_addr);

    let server = MasterServer::new(
        &bind_addr,
        registry,
        policy,
        args.snapshot_file,
        Duration::from_secs(args.snapshot_interval),
    )
    .await?;

    server.run().await;
    Ok(())
}
