use std::path::PathBuf;

use clap::Parser;
use magpie::{app, bootstrap};

#[derive(Parser, Debug)]
#[command(name = "magpie", about = "A passive BitTorrent DHT crawler that harvests torrent metadata.")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, env = "MAGPIE_CONFIG_TOML_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let configuration = bootstrap::app::setup(args.config);

    app::start(&configuration).await;

    Ok(())
}
