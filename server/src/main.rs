use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::config::ServerConfig;
use server::dispatcher::TickControl;
use server::network::Server;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind the stream listener and datagram socket to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port shared by both endpoints
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// Milliseconds between snapshot broadcasts
    #[clap(short, long, default_value = "200")]
    snapshot_ms: u64,
    /// Milliseconds the driver sleeps between ticks
    #[clap(short, long, default_value = "16")]
    tick_ms: u64,
}

/// Builds the server, then ticks it until it asks to stop or Ctrl+C arrives.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        snapshot_interval: Duration::from_millis(args.snapshot_ms),
        ..ServerConfig::default()
    };

    let mut server = Server::new(config)?;

    let stop = Arc::new(AtomicBool::new(false));
    if let Some(reactor) = server.reactor() {
        let stop = Arc::clone(&stop);
        reactor.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    stop.store(true, Ordering::Relaxed);
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    let tick_interval = Duration::from_millis(args.tick_ms);
    while !stop.load(Ordering::Relaxed) {
        if server.tick() == TickControl::Stop {
            break;
        }
        std::thread::sleep(tick_interval);
    }

    server.shutdown();
    Ok(())
}
