use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedrec::{init_logging, user_seed, RatingState, StoreArgs, SystemClock, TuningArgs};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(
    name = "feedrec",
    about = "Serve and maintain article recommendations backed by pgvector"
)]
struct FeedrecCli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the vector extension, schema and tables
    PrepareSchema {
        /// Embedding width of the vector columns
        #[arg(long, env = "FEEDREC_DIMENSIONS", default_value_t = 1536)]
        dims: usize,
    },
    /// Print recommendations for a user as JSON
    Recommend {
        /// User to recommend for
        #[arg(long)]
        user: String,

        /// Maximum records returned
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Rate an item for a user
    Rate {
        /// Rating user
        #[arg(long)]
        user: String,

        /// Rated item
        #[arg(long)]
        item: String,

        /// Thumbs up
        #[arg(long, conflicts_with_all = ["down", "clear"])]
        up: bool,

        /// Thumbs down
        #[arg(long, conflicts_with = "clear")]
        down: bool,

        /// Remove the rating
        #[arg(long)]
        clear: bool,
    },
    /// Mark an item read (or unread) for a user
    Read {
        /// Reading user
        #[arg(long)]
        user: String,

        /// Item read
        #[arg(long)]
        item: String,

        /// Mark unread instead
        #[arg(long, default_value_t = false)]
        unread: bool,
    },
    /// Rebuild one user's interest clusters
    UpdateClusters {
        /// User whose clusters are rebuilt
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = FeedrecCli::parse();
    init_logging(cli.verbose);

    let store = Arc::new(cli.store.connect().await?);
    let services = cli
        .tuning
        .build_services(store.clone(), Arc::new(SystemClock))?;
    match cli.command {
        Command::PrepareSchema { dims } => {
            store
                .prepare_schema(dims)
                .await
                .context("failed to prepare schema")?;
            println!("Schema {} is ready ({dims} dimensions).", cli.store.schema);
        }
        Command::Recommend { user, limit } => {
            let records = services
                .recommender
                .recommend_for(&user, limit)
                .await
                .with_context(|| format!("failed to recommend for {user}"))?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Rate {
            user,
            item,
            up,
            down,
            clear,
        } => {
            let state = match (up, down, clear) {
                (true, _, _) => RatingState::up(),
                (_, true, _) => RatingState::down(),
                (_, _, true) => RatingState::cleared(),
                _ => bail!("one of --up, --down or --clear is required"),
            };
            services
                .ratings
                .set_rating(&user, &item, state)
                .await
                .with_context(|| format!("failed to rate {item} for {user}"))?;
            println!("{}", json!({ "user": user, "item": item, "rating": state }));
        }
        Command::Read { user, item, unread } => {
            services
                .ratings
                .set_read(&user, &item, !unread)
                .await
                .with_context(|| format!("failed to update read state of {item} for {user}"))?;
            println!("{}", json!({ "user": user, "item": item, "read": !unread }));
        }
        Command::UpdateClusters { user } => {
            let config = cli.tuning.build_cluster_config()?;
            let mut rng = ChaCha8Rng::seed_from_u64(user_seed(cli.tuning.seed, &user));
            let stored = services
                .clusters
                .update_clusters(&user, &config, &mut rng)
                .await
                .with_context(|| format!("failed to update clusters for {user}"))?;
            println!("{}", json!({ "user": user, "clusters": stored }));
        }
    }
    Ok(())
}
