//! Record canonicalization.
//!
//! Everything here is pure and infallible: malformed input degrades to an
//! absent field, never to an error. Applying [`normalize`] twice gives the
//! same record as applying it once.

use crate::models::ListingRecord;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*%").expect("valid regex"));
static COMMISSION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"комиссия\s*(\d+)").expect("valid regex"));

/// Canonicalize every field of a record.
///
/// Strings are whitespace-collapsed and trimmed, empty optionals become
/// `None`, the natural key goes through [`canonical_key`], images are
/// deduplicated, and every numeric field with a printed counterpart
/// (`price`, `deposit`, `commission_percent`) is recomputed from that text
/// when the page printed one.
///
/// # Arguments
///
/// * `record` - A record as produced by extraction or read back from storage.
///
/// # Returns
///
/// The canonical record; passing it through `normalize` again changes nothing.
pub fn normalize(record: ListingRecord) -> ListingRecord {
    let price_text = clean_opt(record.price_text);
    let price = match &price_text {
        Some(text) => parse_price(text),
        None => record.price,
    };
    let deposit_text = clean_opt(record.deposit_text);
    let deposit = match &deposit_text {
        Some(text) => parse_price(text),
        None => record.deposit,
    };
    let commission_text = clean_opt(record.commission_text);
    let commission_percent = match &commission_text {
        Some(text) => parse_percent(text),
        None => record.commission_percent,
    };

    ListingRecord {
        natural_key: canonical_key(&record.natural_key),
        title: collapse_whitespace(&record.title),
        price,
        price_text,
        location: clean_opt(record.location),
        url: clean_opt(record.url),
        description: clean_opt(record.description),
        images: record
            .images
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unique()
            .map(str::to_string)
            .collect(),
        deposit_text,
        deposit,
        commission_text,
        commission_percent,
        utilities_text: clean_opt(record.utilities_text),
        extracted_at: record.extracted_at,
    }
}

/// Collapse runs of whitespace (NBSP and thin spaces included) and trim.
pub fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s, " ").trim().to_string()
}

fn clean_opt(s: Option<String>) -> Option<String> {
    s.map(|s| collapse_whitespace(&s)).filter(|s| !s.is_empty())
}

/// Canonical form of a natural key: no whitespace anywhere, no leading `#`,
/// lowercase.
///
/// Whitespace goes first so that `"# #A1"` and `"a1"` agree; the result is
/// a fixed point, `canonical_key(&canonical_key(s)) == canonical_key(s)`.
/// An empty result means the input carried no usable key.
pub fn canonical_key(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .trim_start_matches('#')
        .chars()
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_price_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '\'' | ',' | '.')
}

/// Parse a printed price into whole currency units.
///
/// Reads the first run of digits. Separator-delimited groups of exactly three
/// digits continue the number (`12 500`, `1,500`, `1.500.000`); anything else
/// ends it, which drops a trailing fraction (`1 299,99` is 1299). Currency
/// symbols and words around the number are ignored.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(parse_price("65 000 ₽ в месяц"), Some(65000));
/// assert_eq!(parse_price("Цена не указана"), None);
/// ```
pub fn parse_price(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;

    let mut head = String::new();
    let mut tail: Vec<String> = Vec::new();
    let mut pending_sep = false;
    for c in text[start..].chars() {
        if c.is_ascii_digit() {
            if pending_sep {
                tail.push(String::new());
                pending_sep = false;
            }
            match tail.last_mut() {
                Some(group) => group.push(c),
                None => head.push(c),
            }
        } else if is_price_separator(c) && !pending_sep {
            pending_sep = true;
        } else {
            break;
        }
    }

    let mut digits = head;
    for group in tail {
        if group.len() != 3 {
            break;
        }
        digits.push_str(&group);
    }
    digits.parse().ok()
}

/// Parse a commission term into a whole percentage.
///
/// `Без комиссии` reads as zero. Otherwise the first `N%` wins, then a bare
/// number right after the word `комиссия`.
pub fn parse_percent(text: &str) -> Option<i64> {
    let lower = text.to_lowercase();
    if lower.contains("без комиссии") {
        return Some(0);
    }
    PERCENT
        .captures(&lower)
        .or_else(|| COMMISSION_NUMBER.captures(&lower))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record() -> ListingRecord {
        let mut r = ListingRecord::new(
            "  #ABC 123 ",
            Utc.with_ymd_and_hms(2025, 5, 6, 12, 0, 0).unwrap(),
        );
        r.title = "  2-к.\u{a0}квартира,\n   54 м² ".to_string();
        r.price_text = Some(" 65\u{a0}000 ₽ ".to_string());
        r.location = Some("   ".to_string());
        r.url = Some(" https://www.avito.ru/moskva/kvartiry/x_123 ".to_string());
        r.description = Some("Светлая\t\tквартира".to_string());
        r.images = vec![
            " https://img/1.jpg".to_string(),
            "https://img/1.jpg".to_string(),
            "".to_string(),
            "https://img/2.jpg".to_string(),
        ];
        r
    }

    #[test]
    fn test_normalize_fields() {
        let n = normalize(record());
        assert_eq!(n.natural_key, "abc123");
        assert_eq!(n.title, "2-к. квартира, 54 м²");
        assert_eq!(n.price, Some(65000));
        assert_eq!(n.price_text.as_deref(), Some("65 000 ₽"));
        assert_eq!(n.location, None);
        assert_eq!(
            n.url.as_deref(),
            Some("https://www.avito.ru/moskva/kvartiry/x_123")
        );
        assert_eq!(n.description.as_deref(), Some("Светлая квартира"));
        assert_eq!(n.images, vec!["https://img/1.jpg", "https://img/2.jpg"]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut unparseable = record();
        unparseable.price_text = Some("Цена не указана".to_string());

        let mut numeric_only = record();
        numeric_only.price_text = None;
        numeric_only.price = Some(1200);

        for r in [record(), unparseable, numeric_only] {
            let once = normalize(r);
            let twice = normalize(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_normalize_keeps_numeric_price_without_text() {
        let mut r = record();
        r.price_text = None;
        r.price = Some(777);
        assert_eq!(normalize(r).price, Some(777));
    }

    #[test]
    fn test_unparseable_price_becomes_absent() {
        let mut r = record();
        r.price = Some(5);
        r.price_text = Some("договорная".to_string());
        assert_eq!(normalize(r).price, None);
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("65 000 ₽"), Some(65000));
        assert_eq!(parse_price("65\u{a0}000\u{a0}₽ в месяц"), Some(65000));
        assert_eq!(parse_price("12\u{202f}500 руб."), Some(12500));
        assert_eq!(parse_price("$1,299.99"), Some(1299));
        assert_eq!(parse_price("1.500.000 ₽"), Some(1500000));
        assert_eq!(parse_price("1 299,99 ₽"), Some(1299));
        assert_eq!(parse_price("1'250'000 CHF"), Some(1250000));
        assert_eq!(parse_price("Залог 30 000 ₽"), Some(30000));
        assert_eq!(parse_price("450"), Some(450));
        assert_eq!(parse_price("Цена не указана"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn test_parse_price_overflow_is_absent() {
        assert_eq!(parse_price("99999999999999999999999"), None);
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key(" 3578421570 "), "3578421570");
        assert_eq!(canonical_key("#AbC-1_2"), "abc-1_2");
        assert_eq!(canonical_key("ab c"), "abc");
        assert_eq!(canonical_key("# #A1"), "a1");
        assert_eq!(canonical_key("#\u{a0}#x"), "x");
        assert_eq!(canonical_key(" # "), "");
    }

    #[test]
    fn test_canonical_key_is_a_fixed_point() {
        for raw in ["# #A1", "#\u{a0}#x", "  ##  Ab C ", "#", "Ü 12", "a#b", "\t#\n#\u{202f}Z"] {
            let once = canonical_key(raw);
            assert_eq!(canonical_key(&once), once, "{raw:?}");
        }
    }

    #[test]
    fn test_normalize_is_idempotent_for_hash_prefixed_keys() {
        for key in ["# #A1", "#\u{a0}#x", "# 42 #"] {
            let mut r = record();
            r.natural_key = key.to_string();
            let once = normalize(r);
            assert_eq!(normalize(once.clone()), once);
        }
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Комиссия 50%"), Some(50));
        assert_eq!(parse_percent("Комиссия 100 %"), Some(100));
        assert_eq!(parse_percent("комиссия 30"), Some(30));
        assert_eq!(parse_percent("Без комиссии"), Some(0));
        assert_eq!(parse_percent("Комиссия"), None);
    }

    #[test]
    fn test_normalize_rental_terms() {
        let mut r = record();
        r.deposit_text = Some(" Залог 50\u{a0}000 ₽ ".to_string());
        r.commission_text = Some("Комиссия  50%".to_string());
        r.commission_percent = Some(99);
        r.utilities_text = Some("  ".to_string());
        let n = normalize(r);
        assert_eq!(n.deposit_text.as_deref(), Some("Залог 50 000 ₽"));
        assert_eq!(n.deposit, Some(50000));
        assert_eq!(n.commission_text.as_deref(), Some("Комиссия 50%"));
        assert_eq!(n.commission_percent, Some(50));
        assert_eq!(n.utilities_text, None);
        assert_eq!(normalize(n.clone()), n);
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace(" a \u{a0}\n b  "), "a b");
        assert_eq!(collapse_whitespace("   "), "");
    }
}
