use clap::{Parser, Subcommand};
use docs_qa::commands::{ask, delete_source, index_path, search, show_config, show_stats, show_status};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "docs-qa")]
#[command(about = "Retrieval-augmented question answering over a private document corpus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration (creates a default file if missing)
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Index all .txt/.md documents under a path
    Index {
        /// File or directory to index
        path: PathBuf,
        /// How many documents to index concurrently
        #[arg(long, default_value_t = 4)]
        parallelism: usize,
    },
    /// Retrieve the most similar chunks for a query
    Search {
        /// Query text
        query: String,
        /// Maximum number of results (1-20)
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum similarity score (0.0-1.0)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Ask a question and get an answer grounded in the indexed corpus
    Ask {
        /// The question to answer
        query: String,
        /// Maximum number of retrieved chunks (1-20)
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum similarity score (0.0-1.0)
        #[arg(long)]
        threshold: Option<f32>,
        /// Stream the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
    /// Delete all indexed chunks for a source
    Delete {
        /// Source reference to delete
        source: String,
    },
    /// Show corpus statistics
    Stats,
    /// Show provider and vector store connectivity
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show: _ } => {
            show_config()?;
        }
        Commands::Index { path, parallelism } => {
            index_path(path, parallelism).await?;
        }
        Commands::Search {
            query,
            top_k,
            threshold,
        } => {
            search(query, top_k, threshold).await?;
        }
        Commands::Ask {
            query,
            top_k,
            threshold,
            stream,
        } => {
            ask(query, top_k, threshold, stream).await?;
        }
        Commands::Delete { source } => {
            delete_source(source).await?;
        }
        Commands::Stats => {
            show_stats().await?;
        }
        Commands::Status => {
            show_status().await?;
        }
    }

    Ok(())
}
