use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use streamr::config::{Config, CONFIG_FILE_NAME};
use streamr::feed::{ingest, Dispatcher, IngestError};
use streamr::{DeliveryStore, Key, Record, StoreError};

#[derive(Parser, Debug)]
#[command(
    name = "streamr",
    version,
    about = "Queue playable media links from feeds and hand them out one at a time"
)]
struct Args {
    /// Store root holding pending/ and seen/
    #[arg(short = 'C', long, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to <root>/streamr.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch feeds and queue records not seen before
    Update {
        /// Feed URLs of the form <extractor>+<url>, e.g. rss+https://example.com/feed.xml
        #[arg(required = true, value_name = "FEED_URL")]
        feeds: Vec<String>,
    },
    /// Print the next pending record and mark it seen
    Pop,
    /// Print the next pending record, leaving it pending
    Next,
    /// Mark a pending record seen without printing it
    Remove {
        /// Storage key, e.g. shows/ep1
        key: String,
    },
    /// List pending records
    List,
    /// Forget every pending and seen record
    Clear {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    // RUST_LOG wins over the command-line flags.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,streamr={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Link on stderr, media URL on stdout, so the URL can be piped to a player.
fn emit(record: &Record) {
    eprintln!("{}", record.link());
    println!("{}", record.url());
}

async fn update(store: &DeliveryStore, config: &Config, feeds: &[String]) -> Result<()> {
    let dispatcher = Dispatcher::new(config).context("Failed to set up HTTP client")?;
    let mut failed = 0;

    for feed_url in feeds {
        let extraction = match dispatcher.dispatch(feed_url).await {
            Ok(extraction) => extraction,
            Err(e) => {
                tracing::error!(feed = %feed_url, error = %e, "Failed to open feed");
                failed += 1;
                continue;
            }
        };

        let task_store = store.clone();
        let result = tokio::task::spawn_blocking(move || ingest(&task_store, extraction))
            .await
            .context("Extraction task panicked")?;

        match result {
            Ok(report) => {
                tracing::info!(
                    feed = %feed_url,
                    found = report.found,
                    added = report.added,
                    "Feed ingested"
                );
            }
            Err(IngestError::Store(e)) => {
                return Err(e).with_context(|| format!("Failed to store records from {feed_url}"));
            }
            Err(e) => {
                tracing::error!(feed = %feed_url, error = %e, "Failed to extract feed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} feeds failed", feeds.len());
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.root.join(CONFIG_FILE_NAME));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let store = DeliveryStore::open(&args.root)
        .with_context(|| format!("Failed to initialize store in {}", args.root.display()))?;

    match args.command {
        Command::Update { feeds } => update(&store, &config, &feeds).await,
        Command::Pop => match store.pop() {
            Ok(record) => {
                emit(&record);
                Ok(())
            }
            Err(StoreError::Empty) => bail!("Nothing pending"),
            Err(e) => Err(e).context("Failed to pop record"),
        },
        Command::Next => match store.peek() {
            Ok(record) => {
                emit(&record);
                Ok(())
            }
            Err(StoreError::Empty) => bail!("Nothing pending"),
            Err(e) => Err(e).context("Failed to read next record"),
        },
        Command::Remove { key } => {
            let key = Key::parse(&key).with_context(|| format!("Invalid key '{key}'"))?;
            store
                .remove_key(&key)
                .with_context(|| format!("Failed to mark '{key}' seen"))
        }
        Command::List => {
            for entry in store.iter().context("Failed to list pending records")? {
                let record = entry.context("Failed to read pending record")?;
                println!("{} {}", record.key(), record.url());
            }
            Ok(())
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear {} without --yes", args.root.display());
            }
            store.clear().context("Failed to clear store")?;
            println!("Store cleared.");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    tokio::select! {
        result = run(args) => result,
        _ = tokio::signal::ctrl_c() => {
            // Every store write is a rename, so stopping here leaves it consistent.
            tracing::info!("Interrupted");
            std::process::exit(0);
        }
    }
}
