//! NFSv4.1 proxy probe
//!
//! Brings up the proxy client against a backend server the same way the
//! proxy does, and reports on the session it gets.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use nfs4proto::ArgOp;
use proxyclient::{ProxyClient, ProxyClientConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "proxyprobe")]
#[command(about = "Probe an NFSv4.1 backend through the proxy client", long_about = None)]
struct Cli {
    /// Ganesha configuration file path
    #[arg(
        short = 'c',
        long,
        env = "GANESHA_CONF",
        default_value = "/etc/ganesha/ganesha.conf"
    )]
    conf: String,

    /// Backend server address
    /// If not specified, will be read from the Remote_Server block
    #[arg(long, env = "NFS_SERVER")]
    server: Option<String>,

    /// Backend port
    #[arg(long)]
    port: Option<u16>,

    /// Number of call slots
    #[arg(long)]
    slots: Option<usize>,

    /// Seconds to wait for the session
    #[arg(long, default_value = "30")]
    wait: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved client configuration
    ShowConfig,
    /// Establish a session and print its state
    Session,
    /// Print the server's lease time
    Lease,
    /// Send SEQUENCE + PUTROOTFH compounds and report latency
    Ping {
        /// Number of compounds to send
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Compounds in flight at once
        #[arg(short = 'j', long, default_value = "1")]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let client = Arc::new(ProxyClient::start(config).context("Failed to start proxy client")?);
    let session = client
        .wait_for_session(Duration::from_secs(cli.wait))
        .await
        .context("No session with the backend")?;
    info!("Session {} is up", session);

    let outcome = match cli.command {
        Commands::ShowConfig => Ok(()),
        Commands::Session => show_session(&client).await,
        Commands::Lease => show_lease(&client).await,
        Commands::Ping { count, concurrency } => ping(&client, count, concurrency).await,
    };

    client.shutdown().await;
    outcome
}

/// Config file first, then command-line overrides
fn load_config(cli: &Cli) -> Result<ProxyClientConfig> {
    let mut config = if Path::new(&cli.conf).exists() {
        debug!("Loading configuration from: {}", cli.conf);
        let blocks = proxyconfig::BlockConfig::from_file(&cli.conf)
            .with_context(|| format!("Failed to parse {}", cli.conf))?;
        ProxyClientConfig::from_block_config(&blocks)
            .with_context(|| format!("Invalid proxy settings in {}", cli.conf))?
    } else {
        debug!("Configuration file not found: {}", cli.conf);
        ProxyClientConfig::default()
    };

    if let Some(server) = &cli.server {
        config.server_addr = server.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(slots) = cli.slots {
        config.slots = slots;
    }
    config.validate().context("Invalid client configuration")?;
    Ok(config)
}

async fn show_session(client: &ProxyClient) -> Result<()> {
    let state = client.session_state().await;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn show_lease(client: &ProxyClient) -> Result<()> {
    let state = client.session_state().await;
    println!("{}", state.lease.as_secs());
    Ok(())
}

async fn ping(client: &Arc<ProxyClient>, count: usize, concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        return Err(anyhow!("concurrency must be at least 1"));
    }

    let started = Instant::now();
    let mut latencies = Vec::with_capacity(count);
    let mut failures = 0usize;
    let mut in_flight = JoinSet::new();
    let mut sent = 0usize;

    while sent < count || !in_flight.is_empty() {
        while sent < count && in_flight.len() < concurrency {
            let client = Arc::clone(client);
            in_flight.spawn(async move {
                let start = Instant::now();
                let res = client
                    .execute(vec![ArgOp::Sequence(Default::default()), ArgOp::PutRootFh])
                    .await;
                (start.elapsed(), res)
            });
            sent += 1;
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (elapsed, res) = joined.context("Ping task panicked")?;
        match res {
            Ok(res) if res.is_ok() => latencies.push(elapsed),
            Ok(res) => {
                failures += 1;
                eprintln!("compound failed: {}", res.status_name());
            }
            Err(e) => {
                failures += 1;
                eprintln!("call failed: {}", e);
            }
        }
    }

    latencies.sort();
    let total = started.elapsed();
    println!(
        "{} ok, {} failed in {:.3}s",
        latencies.len(),
        failures,
        total.as_secs_f64()
    );
    if let (Some(min), Some(max)) = (latencies.first(), latencies.last()) {
        let median = latencies[latencies.len() / 2];
        println!("latency min {:?} median {:?} max {:?}", min, median, max);
    }

    if failures > 0 {
        return Err(anyhow!("{} of {} compounds failed", failures, count));
    }
    Ok(())
}
