//! Process entry point: parses CLI args, loads configuration, wires up a
//! storage backend, and runs the server until a shutdown signal arrives.
use atlas_relay::config::Settings;
use atlas_relay::error::Result;
use atlas_relay::repo::memory::MemoryRepo;
use atlas_relay::repo::postgres::PostgresRepo;
use atlas_relay::repo::NostrRepo;
use atlas_relay::server;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "A Nostr relay")]
struct Args {
    /// Path to a TOML config file (without extension; `config` by default).
    #[arg(short, long)]
    config: Option<String>,
    /// Run against an in-process memory store instead of the SQL backend.
    /// Intended for local development and tests, never production.
    #[arg(long)]
    in_memory: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    // `start_server` already listens for ctrl-c/SIGTERM on its own runtime
    // (see `ctrl_c_or_signal`); this channel exists only so a future
    // embedder (or a test harness) can trigger shutdown programmatically.
    // Dropping the sender immediately is fine: the blocking listener sees
    // a closed channel and simply never fires.
    let (_shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();

    let rt = tokio::runtime::Runtime::new()?;
    let repo: Arc<dyn NostrRepo> = rt.block_on(build_repo(&args, &settings))?;

    info!("starting relay on {}:{}", settings.network.address, settings.network.port);
    server::start_server(&settings, repo, shutdown_rx)?;
    Ok(())
}

async fn build_repo(args: &Args, settings: &Settings) -> Result<Arc<dyn NostrRepo>> {
    if args.in_memory {
        warn!("running with an in-memory store; all data is lost on restart");
        return Ok(Arc::new(MemoryRepo::new()));
    }
    let database_url = format!(
        "postgres://{}:{}",
        settings.database.server, settings.database.port
    );
    let repo = Arc::new(
        PostgresRepo::connect(&database_url, settings.database.min_conn, settings.database.max_conn).await?,
    );
    repo.spawn_change_feed_listener();
    Ok(repo)
}
