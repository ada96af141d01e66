mod cli;
mod engine;
mod interactive;
mod model;
mod orchestrator;
mod params;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout carries reports and tables.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    let is_batch = !args.interactive;

    match cli::run(args).await {
        Ok(()) => {
            // Exit explicitly so a lingering stdin or engine thread can't hold the process open
            if is_batch {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
