//! Plain-text rendering.
//!
//! ```text
//! 1. Диван угловой
//!    12 500 ₽ · Москва, м. Сокол
//!    Залог 12 500 ₽ · Без комиссии
//!    https://www.avito.ru/moskva/mebel/divan_3578421570
//! ```

use crate::models::StoredRecord;
use crate::pipeline::IngestSummary;

const NO_PRICE: &str = "price n/a";
const NO_TITLE: &str = "(untitled)";

/// `1234567` → `"1 234 567"`.
pub fn group_digits(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

fn price_line(stored: &StoredRecord) -> String {
    match stored.record.price {
        Some(price) => format!("{} ₽", group_digits(price)),
        None => NO_PRICE.to_string(),
    }
}

/// The printed rental terms joined with ` · `, if the listing has any.
fn terms_line(stored: &StoredRecord) -> Option<String> {
    let record = &stored.record;
    let terms: Vec<&str> = [
        &record.deposit_text,
        &record.commission_text,
        &record.utilities_text,
    ]
    .into_iter()
    .filter_map(|t| t.as_deref())
    .collect();
    (!terms.is_empty()).then(|| terms.join(" · "))
}

/// One numbered block for a record.
///
/// # Arguments
///
/// * `index` - 1-based position shown before the title.
/// * `stored` - The record to render.
///
/// # Returns
///
/// Title line, price line, then the terms and URL lines when present; every
/// line ends with `\n`.
pub fn format_record(index: usize, stored: &StoredRecord) -> String {
    let record = &stored.record;
    let title = if record.title.is_empty() {
        NO_TITLE
    } else {
        record.title.as_str()
    };

    let mut block = format!("{index}. {title}\n   {}", price_line(stored));
    if let Some(location) = &record.location {
        block.push_str(" · ");
        block.push_str(location);
    }
    block.push('\n');
    if let Some(terms) = terms_line(stored) {
        block.push_str("   ");
        block.push_str(&terms);
        block.push('\n');
    }
    if let Some(url) = &record.url {
        block.push_str("   ");
        block.push_str(url);
        block.push('\n');
    }
    block
}

/// All records as numbered blocks separated by blank lines.
pub fn format_records(records: &[StoredRecord]) -> String {
    if records.is_empty() {
        return "No listings stored yet.\n".to_string();
    }
    records
        .iter()
        .enumerate()
        .map(|(i, r)| format_record(i + 1, r))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per ingested page, e.g. `<url>: stored 2 listing(s), skipped 1`.
pub fn format_summary(summary: &IngestSummary) -> String {
    let mut line = format!(
        "{}: stored {} listing(s), skipped {}",
        summary.source, summary.stored, summary.skipped
    );
    if summary.duplicates > 0 {
        line.push_str(&format!(", merged {} duplicate(s)", summary.duplicates));
    }
    line
}
