//! Sockspool - Latency-Ranked SOCKS5 Proxy Gateway
//!
//! This is the main entry point for the Sockspool application.

use anyhow::Result;
use clap::Parser;
use sockspool::checker::Checker;
use sockspool::config::{DEFAULT_CHECK_WORKERS, DEFAULT_LISTEN};
use sockspool::connector::UpstreamConnector;
use sockspool::pool::{channel, parser, ProxyPool};
use sockspool::server;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sockspool - SOCKS5 gateway over a latency-ranked pool of upstream proxies
#[derive(Parser, Debug)]
#[command(name = "sockspool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the proxy list file (one scheme://IPv4:port per line)
    #[arg(long)]
    pfile: PathBuf,

    /// Number of workers in the health-checking fleet
    #[arg(long, default_value_t = DEFAULT_CHECK_WORKERS)]
    chkth: usize,

    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = setup_logging(&args.log_level) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(args).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("{} v{}", sockspool::NAME, sockspool::VERSION);

    let pool = ProxyPool::new();
    let added = parser::load_proxy_file(&pool, &args.pfile)?;
    info!("loaded {added} proxies from {}", args.pfile.display());

    let connector = UpstreamConnector::new();
    let checker = Checker::resolve(connector.clone()).await?;

    let (traffic_tx, traffic_rx) = channel::request_channel();
    let (check_tx, check_rx) = channel::request_channel();
    tokio::spawn(pool.clone().serve_traffic(traffic_rx));
    tokio::spawn(pool.clone().serve_checker(check_rx));
    checker.spawn(args.chkth, check_tx);

    server::run(&args.listen, traffic_tx, connector).await
}

/// Setup logging based on configuration
fn setup_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
