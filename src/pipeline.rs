//! Page → records → store.

use crate::error::{IngestError, Result};
use crate::extract::{Extractor, Strategy};
use crate::models::RawPage;
use crate::normalize::normalize;
use crate::store::Store;
use crate::utils::truncate_for_log;
use serde::Serialize;
use tracing::{info, instrument, warn};

/// What one ingest run did with a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// URL or snapshot path of the page.
    pub source: String,
    pub strategy: Strategy,
    /// Unique records extracted.
    pub found: usize,
    /// Records written to the store.
    pub stored: usize,
    /// Listings dropped for lack of a usable key.
    pub skipped: usize,
    /// Same-key occurrences merged on the page.
    pub duplicates: usize,
}

/// Extract every listing from `page`, normalize it and upsert it in
/// document order.
///
/// A record whose key normalizes to nothing is counted as skipped. A
/// storage failure aborts the run; records already written stay written.
#[instrument(level = "info", skip_all, fields(source = %page.source))]
pub async fn ingest(page: &RawPage, extractor: &Extractor, store: &Store) -> Result<IngestSummary> {
    let extraction = extractor.extract(page);
    if extraction.strategy == Strategy::Nothing {
        warn!(
            bytes = page.body.len(),
            preview = %truncate_for_log(&page.text(), 300),
            "No listings recognized on page"
        );
    }
    let mut summary = IngestSummary {
        source: page.source.to_string(),
        strategy: extraction.strategy,
        found: extraction.records.len(),
        stored: 0,
        skipped: extraction.skipped,
        duplicates: extraction.duplicates,
    };

    for record in extraction.records.into_iter().map(normalize) {
        match store.upsert(&record).await {
            Ok(_) => summary.stored += 1,
            Err(IngestError::Validation(reason)) => {
                warn!(key = %record.natural_key, %reason, "Skipping listing");
                summary.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        found = summary.found,
        stored = summary.stored,
        skipped = summary.skipped,
        duplicates = summary.duplicates,
        "Ingested page"
    );
    Ok(summary)
}
