//! # Listing Ingest
//!
//! Fetches classified-ads search pages, extracts the listings on them and
//! keeps one up-to-date row per listing in SQLite.
//!
//! ## Usage
//!
//! ```sh
//! listing_ingest fetch "https://www.avito.ru/moskva/kvartiry/sdam"
//! listing_ingest parse-file --file Trash/20250506_093015/page.html
//! listing_ingest dump --count 10
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: one GET per URL, optionally retried, or a saved capture
//! 2. **Extraction**: listing cards, then embedded JSON, then a raw link sweep
//! 3. **Normalization**: trimmed fields, canonical keys, numeric prices
//! 4. **Storage**: one atomic upsert per listing

use clap::Parser;
use futures::stream::{self, StreamExt};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod error;
mod extract;
mod fetch;
mod models;
mod normalize;
mod outputs;
mod pipeline;
mod snapshot;
mod store;
mod utils;

use cli::{Cli, Command};
use error::IngestError;
use extract::Extractor;
use fetch::retry::RetryFetch;
use fetch::{Fetcher, fetch_cancellable, fetch_from_snapshot};
use outputs::{json, text};
use pipeline::{IngestSummary, ingest};
use store::Store;
use utils::ensure_writable_dir;

/// Used by `parse-file` when no snapshot directory is configured.
const DEFAULT_SNAPSHOT_DIR: &str = "Trash";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_JITTER: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(command = ?args.command, database_url = %args.database_url, "Parsed CLI arguments");

    let store = Store::open(&args.database_url).await?;

    match &args.command {
        Command::Fetch { urls } => run_fetch(&args, &store, urls).await?,
        Command::ParseFile { file } => run_parse_file(&args, &store, file.clone()).await?,
        Command::Dump { count, json } => run_dump(&store, *count, *json).await?,
        Command::Show { key } => run_show(&store, key).await?,
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}

async fn load_extractor(args: &Cli) -> Result<Extractor, IngestError> {
    Extractor::new(&args.extract_rules().await?)
}

/// Resolves once Ctrl-C has been pressed; never resolves otherwise.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[instrument(level = "info", skip_all, fields(urls = urls.len()))]
async fn run_fetch(args: &Cli, store: &Store, urls: &[String]) -> Result<(), IngestError> {
    let extractor = load_extractor(args).await?;
    let http = Fetcher::new(&args.fetch_config()).await?;
    let fetcher = RetryFetch::new(http.clone(), args.retries, RETRY_BASE_DELAY)
        .with_max_jitter(RETRY_MAX_JITTER);
    if let Some(dir) = &args.snapshot_dir {
        ensure_writable_dir(dir).await?;
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling remaining fetches");
            let _ = cancel_tx.send(true);
        }
    });

    let results: Vec<Result<IngestSummary, IngestError>> = stream::iter(urls)
        .then(|url| {
            let cancel_rx = cancel_rx.clone();
            let fetcher = &fetcher;
            let extractor = &extractor;
            async move {
                if *cancel_rx.borrow() {
                    return Err(IngestError::Cancelled);
                }
                let page = fetch_cancellable(fetcher, url, cancelled(cancel_rx)).await?;
                if let Some(dir) = &args.snapshot_dir {
                    if let Err(e) = snapshot::save(dir, &page).await {
                        warn!(%url, error = %e, "Could not save snapshot; continuing");
                    }
                }
                ingest(&page, extractor, store).await
            }
        })
        .collect()
        .await;

    if let Err(e) = http.save_cookies().await {
        warn!(error = %e, "Could not save cookies");
    }

    let mut stored_any = false;
    let mut last_error = None;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(summary) => {
                stored_any = true;
                println!("{}", text::format_summary(&summary));
            }
            Err(IngestError::Cancelled) => last_error = Some(IngestError::Cancelled),
            Err(e) => {
                error!(%url, error = %e, "Failed to ingest page");
                eprintln!("{url}: {e}");
                if !matches!(last_error, Some(IngestError::Cancelled)) {
                    last_error = Some(e);
                }
            }
        }
    }

    // The run fails when it was interrupted or when no page got through.
    match last_error {
        Some(IngestError::Cancelled) => Err(IngestError::Cancelled),
        Some(e) if !stored_any => Err(e),
        _ => Ok(()),
    }
}

#[instrument(level = "info", skip_all)]
async fn run_parse_file(args: &Cli, store: &Store, file: Option<PathBuf>) -> Result<(), IngestError> {
    let path = match file {
        Some(path) => path,
        None => {
            let dir = args
                .snapshot_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR));
            let latest = snapshot::latest(&dir).await?;
            info!(path = %latest.display(), "Using latest snapshot");
            latest
        }
    };

    let extractor = load_extractor(args).await?;
    let page = fetch_from_snapshot(&path).await?;
    let summary = ingest(&page, &extractor, store).await?;
    println!("{}", text::format_summary(&summary));
    Ok(())
}

async fn run_dump(store: &Store, count: i64, as_json: bool) -> Result<(), IngestError> {
    let records = store.recent(count).await?;
    if as_json {
        println!("{}", json::records_to_json(&records)?);
    } else {
        let total = store.count_all().await?;
        print!("{}", text::format_records(&records));
        println!("\nShowing {} of {total} listing(s).", records.len());
    }
    Ok(())
}

async fn run_show(store: &Store, key: &str) -> Result<(), IngestError> {
    println!("{}", json::record_to_json(&find_listing(store, key).await?)?);
    Ok(())
}

/// Look up a listing by a key as a user would type it.
async fn find_listing(store: &Store, key: &str) -> Result<models::StoredRecord, IngestError> {
    let key = normalize::canonical_key(key);
    store.get(&key).await?.ok_or_else(|| {
        warn!(%key, "No such listing");
        IngestError::Validation(format!("no listing with key {key:?}"))
    })
}
