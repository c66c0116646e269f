//! Thin CLI wrapping the Relatedness Core library (spec.md §6: "a thin CLI
//! wraps it and is not part of this spec"). The tracker and embedding
//! provider collaborators have no in-crate implementation (spec.md §1 scope),
//! so the CLI surface is limited to operations the core can perform on its
//! own: inspecting and administering the persisted Embedding Index (C4) and
//! showing the effective configuration. Driving a full `analyze` run is left
//! to a host application that supplies real `Tracker`/`EmbeddingProvider`
//! implementations and calls [`relatedness_core::RelatednessEngine`] directly.

use clap::{Parser, Subcommand};
use relatedness_core::{Config, EmbeddingIndex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relatedness-cli", version, about = "Relatedness Core admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and administer the persisted Embedding Index (C4).
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Print the effective configuration loaded from the environment.
    Config,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Print record count, dimension, and approximate memory usage.
    Stats,
    /// Drop all records and persist an empty index.
    Clear,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relatedness_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Config => {
            println!("{config:#?}");
        }
        Commands::Index { action } => match action {
            IndexAction::Stats => {
                let index = EmbeddingIndex::open(&config.vector_db_path)?;
                let stats = index.stats();
                println!(
                    "count={} dimension={} approx_bytes={}",
                    stats.count,
                    stats.dimension.map(|d| d.to_string()).unwrap_or_else(|| "n/a".to_string()),
                    stats.approx_bytes
                );
            }
            IndexAction::Clear => {
                // Resets the on-disk pair directly rather than going through
                // `open`, so a corrupted store (IndexCorrupt) is still
                // recoverable: `open` errors before a `Self` exists, and
                // `clear` needs one.
                EmbeddingIndex::clear_at(&config.vector_db_path)?;
                println!("index cleared at {}", config.vector_db_path.display());
            }
        },
    }

    Ok(())
}
