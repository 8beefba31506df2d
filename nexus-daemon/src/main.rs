//! Restream relay daemon entry point.

use clap::Parser;

use nexus_daemon::{init_logging, run, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    run(Args::parse()).await
}
