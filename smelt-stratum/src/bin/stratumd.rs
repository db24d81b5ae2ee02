//! Main entry point for the stratumd daemon.

use std::path::PathBuf;

use clap::Parser;

use smelt_stratum::{config::Config, daemon, tracing};

#[derive(Parser)]
#[command(name = "stratumd", about = "Merge-mining Stratum coordinator")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "stratum.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)?;
    tracing::init(&config.log_level);

    daemon::run(config).await
}
