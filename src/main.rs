//! WireMQ - MQTT v3.1.1 wire-protocol engine
//!
//! Usage:
//!   wiremq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path
//!   -b, --bind <ADDR>       Bind address (default: 0.0.0.0:1883)
//!   --max-packet-size <N>   Maximum packet size (default: 1MB)
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wiremq::broker::Dispatcher;
use wiremq::config::Config;
use wiremq::server::{ConnectionTable, Server};
use wiremq::session::MemorySessionCache;
use wiremq::worker::TaskWorker;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// WireMQ - MQTT v3.1.1 wire-protocol engine
#[derive(Parser, Debug)]
#[command(name = "wiremq")]
#[command(version = "0.1.0")]
#[command(about = "MQTT v3.1.1 wire-protocol engine")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let bind = args.bind.unwrap_or(file_config.server.bind);
    let max_packet_size = args
        .max_packet_size
        .unwrap_or(file_config.limits.max_packet_size);

    info!("Starting WireMQ");
    info!("  Bind address: {}", bind);
    info!("  Max packet size: {} bytes", max_packet_size);

    let cache = Arc::new(MemorySessionCache::new());
    let connections = Arc::new(ConnectionTable::new());

    let worker = Arc::new(TaskWorker::new(connections.clone(), cache.clone()));
    let queue = worker.spawn();

    let dispatcher = Arc::new(Dispatcher::new(cache, connections.clone(), Arc::new(queue)));

    let server = Arc::new(Server::new(bind, max_packet_size, connections, dispatcher));
    server.run().await?;

    Ok(())
}
