//! JSON rendering.

use crate::error::{IngestError, Result};
use crate::models::StoredRecord;
use serde::Serialize;

fn pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| IngestError::Storage(format!("cannot encode json: {e}")))
}

/// Render `records` as a pretty-printed JSON array.
///
/// # Arguments
///
/// * `records` - Records in the order they should appear.
///
/// # Returns
///
/// The JSON text. Each element is flat: the listing fields sit next to
/// `seq`, `first_seen` and `last_updated`.
pub fn records_to_json(records: &[StoredRecord]) -> Result<String> {
    pretty(records)
}

/// Render one record as a pretty-printed JSON object, shaped like an
/// element of [`records_to_json`].
pub fn record_to_json(record: &StoredRecord) -> Result<String> {
    pretty(record)
}
