use clap::{Parser, Subcommand};
use collection::prelude::*;
use harness::{resolve_config, ListView, Overrides};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "harness")]
#[command(about = "Page through entity listings the way a list widget would")]
struct Cli {
    /// Base URL of the listing service
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// TOML settings file with a [collection] table
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch pages of a listing, pressing "More" until done
    List {
        /// Listing path, e.g. /api/greetings
        #[arg(short, long, default_value = "/api/greetings")]
        path: String,
        /// Entities per page
        #[arg(short = 'n', long)]
        page_size: Option<usize>,
        /// Number of pages to load
        #[arg(long, default_value = "1", conflicts_with = "all")]
        pages: usize,
        /// Keep loading until the listing is complete
        #[arg(long)]
        all: bool,
        /// Entity field to display
        #[arg(long, default_value = "text")]
        field: String,
    },
    /// Open the listing's popup twice; only the first opening loads
    Activate {
        /// Listing path, e.g. /api/greetings
        #[arg(short, long, default_value = "/api/greetings")]
        path: String,
        /// Entities per page
        #[arg(short = 'n', long)]
        page_size: Option<usize>,
        /// Entity field to display
        #[arg(long, default_value = "text")]
        field: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let page_size = match &cli.command {
        Commands::List { page_size, .. } | Commands::Activate { page_size, .. } => *page_size,
    };
    let config = resolve_config(
        cli.config.as_deref(),
        Overrides {
            base_url: cli.base_url,
            timeout_secs: cli.timeout_secs,
            page_size,
        },
    )?;
    let source = HttpListingSource::new(config.clone())?;

    match cli.command {
        Commands::List {
            path,
            pages,
            all,
            field,
            ..
        } => {
            let collection = Arc::new(EntityCollection::from_config(source, path, &config)?);
            let budget = if all { None } else { Some(pages) };
            list(collection, &field, config.default_page_size, budget).await?;
        }
        Commands::Activate { path, field, .. } => {
            let collection = Arc::new(EntityCollection::from_config(source, path, &config)?);
            activate(collection, &field, config.default_page_size).await?;
        }
    }

    Ok(())
}

async fn list<S: ListingSource + 'static>(
    collection: Arc<EntityCollection<S>>,
    field: &str,
    page_size: usize,
    budget: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let view = ListView::bind(collection.clone(), field);
    let mut loaded = 0;

    while budget.map_or(true, |pages| loaded < pages) {
        let outcome = view.load_more(page_size).await?;
        loaded += 1;

        match outcome {
            FetchOutcome::Failed(err) => {
                error!("Fetching {} failed: {}", collection.resource_path(), err);
                break;
            }
            FetchOutcome::Exhausted => break,
            _ => {}
        }

        if !view.more_visible() {
            break;
        }
    }

    print!("{}", view.render());
    info!(
        "Loaded {} entities from {} (complete: {})",
        collection.len(),
        collection.resource_path(),
        collection.is_complete()
    );

    if view.last_error().is_some() {
        return Err(format!("listing {} could not be loaded", collection.resource_path()).into());
    }
    Ok(())
}

async fn activate<S: ListingSource + 'static>(
    collection: Arc<EntityCollection<S>>,
    field: &str,
    page_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let view = ListView::bind(collection.clone(), field);
    let trigger = ActivationTrigger::new(page_size)?;

    for opening in 1..=2 {
        match trigger.activate(&collection).await? {
            Some(outcome) => println!("Opening {}: loaded {} entities", opening, outcome.added()),
            None => println!("Opening {}: already loaded", opening),
        }
    }

    print!("{}", view.render());
    Ok(())
}
