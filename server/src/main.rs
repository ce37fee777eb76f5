use clap::Parser;
use log::{error, info};
use server::session::{self, SessionConfig};
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, then drives a single session from the
/// connection lobby through to a concluded game.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "5555")]
        port: u16,
        /// Player capacity (5 to 10)
        #[clap(short, long, default_value = "10")]
        max_participants: usize,
        /// Seconds to wait for players to connect
        #[clap(long, default_value = "60")]
        connect_timeout: u64,
        /// Seconds to wait for connected players to pick names
        #[clap(long, default_value = "60")]
        naming_timeout: u64,
    }

    env_logger::init();
    let args = Args::parse();

    let config = SessionConfig {
        host: args.host,
        port: args.port,
        max_participants: args.max_participants,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        naming_timeout: Duration::from_secs(args.naming_timeout),
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = session::run(config) => match result {
            Ok(outcome) => info!("Session finished: {:?}", outcome),
            Err(e) => {
                error!("Session failed: {}", e);
                return Err(e.into());
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
