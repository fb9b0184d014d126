//! Data models passed between the pipeline stages.
//!
//! - [`RawPage`]: an unparsed page as fetched from a URL or read from a snapshot
//! - [`ListingRecord`]: one listing extracted from a page
//! - [`StoredRecord`]: a listing as persisted, with its sequence number and timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Where a [`RawPage`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSource {
    Url(Url),
    Snapshot(PathBuf),
}

impl fmt::Display for PageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSource::Url(url) => write!(f, "{url}"),
            PageSource::Snapshot(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The unparsed content of a page.
///
/// Created by the fetcher and consumed by extraction; never mutated.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// The URL or snapshot path the body was read from.
    pub source: PageSource,
    /// The raw bytes of the page.
    pub body: Vec<u8>,
    /// When the body was retrieved.
    pub retrieved_at: DateTime<Utc>,
}

impl RawPage {
    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The page URL, when the page was fetched over the network.
    pub fn url(&self) -> Option<&Url> {
        match &self.source {
            PageSource::Url(url) => Some(url),
            PageSource::Snapshot(_) => None,
        }
    }
}

/// A single listing extracted from a page.
///
/// Two records with the same `natural_key` describe the same real-world
/// listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Site-stable identifier of the listing (the ad id).
    pub natural_key: String,
    /// Listing headline; empty when the page had none.
    pub title: String,
    /// Price in whole currency units; `None` when it could not be parsed.
    pub price: Option<i64>,
    /// The price as printed on the page.
    pub price_text: Option<String>,
    /// Address or district line.
    pub location: Option<String>,
    /// Absolute link to the listing.
    pub url: Option<String>,
    /// Short description snippet.
    pub description: Option<String>,
    /// Image URLs in page order.
    #[serde(default)]
    pub images: Vec<String>,
    /// Security deposit term as printed, e.g. `Залог 50 000 ₽`.
    pub deposit_text: Option<String>,
    /// Deposit in whole currency units, parsed from `deposit_text`.
    pub deposit: Option<i64>,
    /// Agent commission term as printed, e.g. `Комиссия 50%` or `Без комиссии`.
    pub commission_text: Option<String>,
    /// Commission percentage; `Some(0)` when the listing has none.
    pub commission_percent: Option<i64>,
    /// Utilities term as printed, e.g. `ЖКУ включены (без счётчиков)`.
    pub utilities_text: Option<String>,
    /// Retrieval time of the page the record came from.
    pub extracted_at: DateTime<Utc>,
}

impl ListingRecord {
    /// Create an empty record for `natural_key`.
    ///
    /// # Arguments
    ///
    /// * `natural_key` - The listing's identifier, ideally already canonical.
    /// * `extracted_at` - Retrieval time of the source page.
    ///
    /// # Returns
    ///
    /// A record with an empty title and every optional field absent.
    pub fn new(natural_key: impl Into<String>, extracted_at: DateTime<Utc>) -> Self {
        Self {
            natural_key: natural_key.into(),
            title: String::new(),
            price: None,
            price_text: None,
            location: None,
            url: None,
            description: None,
            images: Vec::new(),
            deposit_text: None,
            deposit: None,
            commission_text: None,
            commission_percent: None,
            utilities_text: None,
            extracted_at,
        }
    }
}

/// A persisted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    /// Insertion order; assigned on first upsert and never changed.
    pub seq: i64,
    #[serde(flatten)]
    pub record: ListingRecord,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}
