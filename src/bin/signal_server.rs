//! Standalone signal server binary.

use std::time::Duration;

use clap::Parser;
use tandem::{SignalConfig, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "signal-server", about = "Rendezvous broker for tandem peers")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Seconds a lone connection request waits for its counterpart
    #[arg(long, default_value_t = 60)]
    pairing_timeout: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let server = SignalServer::new(SignalConfig {
        bind_addr: args.bind,
        pairing_timeout: Duration::from_secs(args.pairing_timeout),
    });
    server.run().await
}
