//! Listing extraction from raw pages.
//!
//! Extraction never fails on content. It runs a chain of strategies and the
//! first one that finds anything wins:
//!
//! | Strategy | Source | Notes |
//! |----------|--------|-------|
//! | [`Strategy::Cards`] | listing blocks matched by the card selectors | per-field best effort |
//! | [`Strategy::JsonLd`] | `application/ld+json` scripts | offers with a key-bearing URL |
//! | [`Strategy::InlineState`] | a `__INITIAL_STATE__` script | `items`/`list`/`docs` arrays |
//! | [`Strategy::RegexSweep`] | raw anchors in the markup | last resort for broken dumps |
//!
//! A listing without a derivable natural key is skipped and counted. Keys are
//! canonicalized before that check, so an id such as `"#"` counts as missing.
//! Duplicate keys on one page are resolved by the configured
//! [`DuplicatePolicy`].

pub mod rules;

use crate::error::Result;
use crate::models::{ListingRecord, RawPage};
use crate::normalize::{canonical_key, collapse_whitespace, parse_percent, parse_price};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use rules::CompiledRules;
pub use rules::{DuplicatePolicy, ExtractRules};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};
use url::Url;

static LD_JSON: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid selector")
});
static SCRIPT: Lazy<Selector> = Lazy::new(|| Selector::parse("script").expect("valid selector"));
static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
        .expect("valid regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static RUBLE_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d\s]*\s*₽").expect("valid regex"));

/// How far past an anchor the regex sweep looks for a price.
const SWEEP_PRICE_WINDOW: usize = 300;

/// Which strategy produced an [`Extraction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cards,
    JsonLd,
    InlineState,
    RegexSweep,
    /// No strategy recognized anything on the page.
    Nothing,
}

/// The outcome of extracting one page.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Records in document order, unique by natural key.
    pub records: Vec<ListingRecord>,
    /// Listings dropped because no natural key could be derived.
    pub skipped: usize,
    /// Occurrences merged into another record with the same key.
    pub duplicates: usize,
    pub strategy: Strategy,
}

/// Turns raw pages into listing records according to a set of [`ExtractRules`].
///
/// Holds only compiled rules, so one extractor can serve any number of pages
/// and tasks.
///
/// # Example
///
/// ```ignore
/// let extractor = Extractor::new(&ExtractRules::default())?;
/// let extraction = extractor.extract(&page);
/// println!("{} listings via {:?}", extraction.records.len(), extraction.strategy);
/// ```
#[derive(Debug)]
pub struct Extractor {
    rules: CompiledRules,
}

/// What a JSON-LD object turned out to be.
enum LdNode {
    Listing(ListingRecord),
    /// Named and linked like a listing, but no key could be derived.
    Keyless,
    /// Anything else; its children may still hold listings.
    Other,
}

/// Per-page values shared by the strategies.
struct PageContext<'a> {
    base: &'a Url,
    at: DateTime<Utc>,
}

impl Extractor {
    /// Compile `rules` into an extractor.
    ///
    /// # Arguments
    ///
    /// * `rules` - Selectors, key pattern, duplicate policy and base URL.
    ///
    /// # Returns
    ///
    /// The extractor, or [`IngestError::Validation`](crate::error::IngestError::Validation)
    /// naming the first selector, pattern or base URL that does not compile.
    pub fn new(rules: &ExtractRules) -> Result<Self> {
        Ok(Self {
            rules: CompiledRules::compile(rules)?,
        })
    }

    /// Extract every recognizable listing from `page`.
    ///
    /// Pure: the same page always yields the same records in the same order.
    ///
    /// # Arguments
    ///
    /// * `page` - The fetched or captured page. Relative links resolve against
    ///   its URL, or against the configured base URL for snapshots.
    ///
    /// # Returns
    ///
    /// An [`Extraction`] with records unique by key and in document order,
    /// together with the skip and duplicate counts of the winning strategy.
    pub fn extract(&self, page: &RawPage) -> Extraction {
        let text = page.text();
        let base = page.url().unwrap_or(&self.rules.base_url);
        let ctx = PageContext {
            base,
            at: page.retrieved_at,
        };
        let document = Html::parse_document(&text);

        let (candidates, skipped, strategy) = self.run_strategies(&document, &text, &ctx);
        let (records, duplicates) = dedupe(candidates, self.rules.duplicate_policy);

        info!(
            source = %page.source,
            ?strategy,
            records = records.len(),
            skipped,
            duplicates,
            "Extracted listings"
        );
        Extraction {
            records,
            skipped,
            duplicates,
            strategy,
        }
    }

    fn run_strategies(
        &self,
        document: &Html,
        raw: &str,
        ctx: &PageContext<'_>,
    ) -> (Vec<ListingRecord>, usize, Strategy) {
        if let Some(cards) = self.find_cards(document) {
            let total = cards.len();
            let records: Vec<ListingRecord> = cards
                .into_iter()
                .filter_map(|card| self.card_record(card, ctx))
                .collect();
            let skipped = total - records.len();
            return (records, skipped, Strategy::Cards);
        }
        debug!("No listing cards matched; trying embedded JSON");

        let (records, ld_skipped) = self.from_json_ld(document, ctx);
        if !records.is_empty() {
            return (records, ld_skipped, Strategy::JsonLd);
        }

        let (records, state_skipped) = self.from_inline_state(document, ctx);
        if !records.is_empty() {
            return (records, state_skipped, Strategy::InlineState);
        }

        // Anchors without a key are ordinary links, not skipped listings.
        let records = self.from_regex_sweep(raw, ctx);
        if !records.is_empty() {
            return (records, 0, Strategy::RegexSweep);
        }
        (Vec::new(), ld_skipped + state_skipped, Strategy::Nothing)
    }

    fn find_cards<'a>(&self, document: &'a Html) -> Option<Vec<ElementRef<'a>>> {
        self.rules.cards.iter().find_map(|selector| {
            let cards: Vec<ElementRef<'a>> = document.select(selector).collect();
            (!cards.is_empty()).then_some(cards)
        })
    }

    fn card_record(&self, card: ElementRef<'_>, ctx: &PageContext<'_>) -> Option<ListingRecord> {
        let link = first_match(card, &self.rules.titles);
        let url = link
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(ctx.base, href));

        let key = self
            .key_from_attributes(card)
            .or_else(|| url.as_deref().and_then(|u| self.key_from_url(u)));
        let Some(key) = key else {
            debug!(url = ?url, "Skipping listing block without an id");
            return None;
        };

        let mut record = ListingRecord::new(key, ctx.at);
        record.title = link
            .map(|a| match a.value().attr("title") {
                Some(title) if !title.trim().is_empty() => collapse_whitespace(title),
                _ => element_text(a),
            })
            .unwrap_or_default();
        record.url = url;
        record.price_text = first_match(card, &self.rules.prices)
            .map(|el| match el.value().attr("content") {
                Some(content) => collapse_whitespace(content),
                None => element_text(el),
            })
            .filter(|s| !s.is_empty());
        record.price = record.price_text.as_deref().and_then(parse_price);
        record.location = first_match(card, &self.rules.locations)
            .map(|addr| match (element_text(addr), address_extra(addr)) {
                (main, Some(extra)) if !main.is_empty() => format!("{main}, {extra}"),
                (_, Some(extra)) => extra,
                (main, None) => main,
            })
            .filter(|s| !s.is_empty());
        if let Some(params) = first_match(card, &self.rules.params) {
            apply_terms(&mut record, &element_text(params));
        }
        record.description = first_match(card, &self.rules.descriptions)
            .map(element_text)
            .filter(|s| !s.is_empty());
        record.images = self
            .rules
            .images
            .iter()
            .flat_map(|selector| card.select(selector))
            .filter_map(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
            .filter_map(|src| resolve(ctx.base, src))
            .unique()
            .collect();
        Some(record)
    }

    fn key_from_attributes(&self, card: ElementRef<'_>) -> Option<String> {
        card.descendants()
            .filter_map(ElementRef::wrap)
            .find_map(|el| {
                self.rules
                    .key_attributes
                    .iter()
                    .filter_map(|attr| el.value().attr(attr))
                    .find_map(usable_key)
            })
    }

    fn key_from_url(&self, url: &str) -> Option<String> {
        self.rules.key_from_url(url).as_deref().and_then(usable_key)
    }

    fn from_json_ld(&self, document: &Html, ctx: &PageContext<'_>) -> (Vec<ListingRecord>, usize) {
        let mut records = Vec::new();
        let mut skipped = 0;
        for script in document.select(&LD_JSON) {
            let raw = script.text().collect::<String>();
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => self.walk_json_ld(&value, ctx, &mut records, &mut skipped),
                Err(e) => debug!(error = %e, "Ignoring malformed ld+json block"),
            }
        }
        (records, skipped)
    }

    fn walk_json_ld(
        &self,
        node: &Value,
        ctx: &PageContext<'_>,
        out: &mut Vec<ListingRecord>,
        skipped: &mut usize,
    ) {
        match node {
            Value::Array(items) => {
                for item in items {
                    self.walk_json_ld(item, ctx, out, skipped);
                }
            }
            Value::Object(map) => match self.json_ld_record(map, ctx) {
                LdNode::Listing(record) => out.push(record),
                LdNode::Keyless => {
                    debug!("Skipping ld+json listing without an id");
                    *skipped += 1;
                }
                LdNode::Other => {
                    for value in map.values() {
                        self.walk_json_ld(value, ctx, out, skipped);
                    }
                }
            },
            _ => {}
        }
    }

    fn json_ld_record(&self, map: &Map<String, Value>, ctx: &PageContext<'_>) -> LdNode {
        let name = map
            .get("name")
            .or_else(|| map.get("headline"))
            .and_then(Value::as_str);
        let url = map
            .get("url")
            .and_then(Value::as_str)
            .and_then(|u| resolve(ctx.base, u));
        let (Some(name), Some(url)) = (name, url) else {
            return LdNode::Other;
        };
        let Some(key) = self.key_from_url(&url) else {
            return LdNode::Keyless;
        };

        let mut record = ListingRecord::new(key, ctx.at);
        record.title = collapse_whitespace(name);
        record.url = Some(url);
        record.price_text = match map.get("offers") {
            Some(Value::Object(offers)) => price_with_currency(offers, "price", "priceCurrency"),
            _ => price_with_currency(map, "price", "priceCurrency"),
        };
        record.price = record.price_text.as_deref().and_then(parse_price);
        record.location = map.get("address").and_then(|addr| match addr {
            Value::Object(addr) => {
                let parts = ["streetAddress", "addressLocality"]
                    .iter()
                    .filter_map(|k| addr.get(*k).and_then(Value::as_str))
                    .filter(|s| !s.trim().is_empty())
                    .join(", ");
                (!parts.is_empty()).then_some(parts)
            }
            other => other.as_str().map(str::to_string),
        });
        record.description = map
            .get("description")
            .and_then(Value::as_str)
            .map(collapse_whitespace);
        record.images = map
            .get("image")
            .map(|img| image_urls(img, ctx.base))
            .unwrap_or_default();
        LdNode::Listing(record)
    }

    fn from_inline_state(&self, document: &Html, ctx: &PageContext<'_>) -> (Vec<ListingRecord>, usize) {
        let mut records = Vec::new();
        let mut skipped = 0;
        for script in document.select(&SCRIPT) {
            let raw = script.text().collect::<String>();
            if !raw.contains("__INITIAL_STATE__") {
                continue;
            }
            let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
                continue;
            };
            if end <= start {
                continue;
            }
            match serde_json::from_str::<Value>(&raw[start..=end]) {
                Ok(state) => self.walk_state(&state, ctx, &mut records, &mut skipped),
                Err(e) => debug!(error = %e, "Ignoring unparseable inline state"),
            }
            if !records.is_empty() {
                break;
            }
        }
        (records, skipped)
    }

    fn walk_state(
        &self,
        node: &Value,
        ctx: &PageContext<'_>,
        out: &mut Vec<ListingRecord>,
        skipped: &mut usize,
    ) {
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    let is_listing_array = matches!(
                        key.to_lowercase().as_str(),
                        "items" | "list" | "docs"
                    );
                    match value {
                        Value::Array(items) if is_listing_array => {
                            for item in items.iter().filter_map(Value::as_object) {
                                match self.state_record(item, ctx) {
                                    Some(record) => out.push(record),
                                    None => *skipped += 1,
                                }
                            }
                        }
                        other => self.walk_state(other, ctx, out, skipped),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk_state(item, ctx, out, skipped);
                }
            }
            _ => {}
        }
    }

    fn state_record(&self, item: &Map<String, Value>, ctx: &PageContext<'_>) -> Option<ListingRecord> {
        let url = item
            .get("url")
            .or_else(|| item.get("uri"))
            .and_then(Value::as_str)
            .and_then(|u| resolve(ctx.base, u));
        let key = item
            .get("id")
            .and_then(scalar)
            .as_deref()
            .and_then(usable_key)
            .or_else(|| url.as_deref().and_then(|u| self.key_from_url(u)))?;

        let mut record = ListingRecord::new(key, ctx.at);
        record.title = item
            .get("title")
            .or_else(|| item.get("name"))
            .and_then(Value::as_str)
            .map(collapse_whitespace)
            .unwrap_or_default();
        record.url = url;
        record.price_text = match item.get("price") {
            Some(Value::Object(price)) => price_with_currency(price, "value", "currency")
                .or_else(|| price_with_currency(price, "price", "currency")),
            Some(other) => scalar(other),
            None => None,
        };
        record.price = record.price_text.as_deref().and_then(parse_price);
        record.location = item
            .get("address")
            .or_else(|| item.get("location"))
            .and_then(Value::as_str)
            .map(collapse_whitespace);
        record.images = item
            .get("images")
            .or_else(|| item.get("thumbnails"))
            .map(|img| image_urls(img, ctx.base))
            .unwrap_or_default();
        Some(record)
    }

    fn from_regex_sweep(&self, raw: &str, ctx: &PageContext<'_>) -> Vec<ListingRecord> {
        let mut records = Vec::new();
        for caps in ANCHOR.captures_iter(raw) {
            let (Some(whole), Some(href), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let Some(url) = resolve(ctx.base, href.as_str()) else {
                continue;
            };
            let Some(key) = self.key_from_url(&url) else {
                continue;
            };
            let title = collapse_whitespace(&TAG.replace_all(inner.as_str(), " "));
            if title.chars().count() < 3 {
                continue;
            }

            let mut record = ListingRecord::new(key, ctx.at);
            record.title = title;
            record.url = Some(url);
            record.price_text = RUBLE_AMOUNT
                .find(window_after(raw, whole.end(), SWEEP_PRICE_WINDOW))
                .map(|m| collapse_whitespace(m.as_str()));
            record.price = record.price_text.as_deref().and_then(parse_price);
            records.push(record);
        }
        records
    }
}

/// Resolve duplicate keys, keeping document order of the surviving records.
///
/// Returns the unique records and how many occurrences were merged away.
fn dedupe(candidates: Vec<ListingRecord>, policy: DuplicatePolicy) -> (Vec<ListingRecord>, usize) {
    let mut slots: Vec<Option<ListingRecord>> = Vec::with_capacity(candidates.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut duplicates = 0;

    for record in candidates {
        let Some(&pos) = positions.get(&record.natural_key) else {
            positions.insert(record.natural_key.clone(), slots.len());
            slots.push(Some(record));
            continue;
        };
        duplicates += 1;
        let replace = match policy {
            DuplicatePolicy::KeepLast => true,
            DuplicatePolicy::KeepFirst => false,
            DuplicatePolicy::PreferImages => {
                let existing_has_images = slots[pos]
                    .as_ref()
                    .is_some_and(|existing| !existing.images.is_empty());
                !existing_has_images || !record.images.is_empty()
            }
        };
        debug!(key = %record.natural_key, replace, "Duplicate listing on page");
        if replace {
            slots[pos] = None;
            positions.insert(record.natural_key.clone(), slots.len());
            slots.push(Some(record));
        }
    }
    (slots.into_iter().flatten().collect(), duplicates)
}

/// The canonical form of `raw`, or `None` when nothing of it survives.
fn usable_key(raw: &str) -> Option<String> {
    let key = canonical_key(raw);
    (!key.is_empty()).then_some(key)
}

/// Fill the rental terms from a line like `Залог 50 000 ₽ · Комиссия 50% · ЖКУ включены`.
///
/// Parts that match no term are ignored.
fn apply_terms(record: &mut ListingRecord, line: &str) {
    for part in line.split('·').map(str::trim).filter(|p| !p.is_empty()) {
        let lower = part.to_lowercase();
        if part.starts_with("Залог") {
            record.deposit = parse_price(part);
            record.deposit_text = Some(part.to_string());
        } else if part.starts_with("Комиссия") || part.starts_with("Без комиссии") {
            record.commission_percent = parse_percent(part);
            record.commission_text = Some(part.to_string());
        } else if part.starts_with("ЖКУ") || lower.contains("счетчики") || lower.contains("счётчики") {
            record.utilities_text = Some(part.to_string());
        }
    }
}

/// The unmarked `<p>` right after an address block, usually metro or district.
fn address_extra(addr: ElementRef<'_>) -> Option<String> {
    addr.next_siblings()
        .find_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "p" && el.value().attr("data-marker").is_none())
        .map(element_text)
        .filter(|s| !s.is_empty())
}

fn first_match<'a>(scope: ElementRef<'a>, selectors: &[Selector]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|s| scope.select(s).next())
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

/// Absolute http(s) form of `href` relative to `base`.
fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    base.join(href)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn price_with_currency(map: &Map<String, Value>, amount: &str, currency: &str) -> Option<String> {
    let amount = map.get(amount).and_then(scalar).filter(|s| !s.trim().is_empty())?;
    Some(match map.get(currency).and_then(Value::as_str) {
        Some(cur) => format!("{amount} {cur}"),
        None => amount,
    })
}

fn image_urls(value: &Value, base: &Url) -> Vec<String> {
    let candidates: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("url").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str).into_iter().collect(),
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter_map(|src| resolve(base, src))
        .unique()
        .collect()
}

/// Up to `len` bytes of `s` starting at `start`, cut on a char boundary.
fn window_after(s: &str, start: usize, len: usize) -> &str {
    let mut end = (start + len).min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(start..end).unwrap_or("")
}
