use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use feedrec::{init_logging, StoreArgs, SystemClock, TuningArgs};

#[derive(Parser, Debug)]
#[command(
    name = "feedrec-regenerate",
    about = "Rebuild clusters and precomputed recommendations for every flagged user"
)]
struct RegenerateCli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RegenerateCli::parse();
    init_logging(cli.verbose);

    let store = Arc::new(cli.store.connect().await?);
    let services = cli.tuning.build_services(store, Arc::new(SystemClock))?;
    let report = services
        .batch
        .run()
        .await
        .context("recommendation regeneration did not start")?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
