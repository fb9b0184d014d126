//! Persistent listing table backed by SQLite.
//!
//! One row per natural key. Every mutation is a single
//! `INSERT … ON CONFLICT DO UPDATE … RETURNING` statement, so concurrent
//! upserts of the same key serialize inside SQLite and the last completed
//! call wins entirely. Timestamps are stored as UTC microseconds so that
//! ordering by them is numeric.

use crate::error::{IngestError, Result};
use crate::models::{ListingRecord, StoredRecord};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS listings (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    natural_key     TEXT    NOT NULL UNIQUE,
    title           TEXT    NOT NULL,
    price           INTEGER,
    price_text      TEXT,
    location        TEXT,
    url             TEXT,
    description     TEXT,
    images_json     TEXT    NOT NULL DEFAULT '[]',
    deposit_text    TEXT,
    deposit         INTEGER,
    commission_text TEXT,
    commission_pct  INTEGER,
    utilities_text  TEXT,
    extracted_at_us INTEGER NOT NULL,
    first_seen_us   INTEGER NOT NULL,
    last_updated_us INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS listings_recent ON listings (last_updated_us DESC, seq DESC);
";

/// Columns added after the first release; tables created before them get
/// them through `ALTER TABLE` on open.
const TERM_COLUMNS: [(&str, &str); 5] = [
    ("deposit_text", "TEXT"),
    ("deposit", "INTEGER"),
    ("commission_text", "TEXT"),
    ("commission_pct", "INTEGER"),
    ("utilities_text", "TEXT"),
];

const COLUMNS: &str = "seq, natural_key, title, price, price_text, location, url, description, \
    images_json, deposit_text, deposit, commission_text, commission_pct, utilities_text, \
    extracted_at_us, first_seen_us, last_updated_us";

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    seq: i64,
    natural_key: String,
    title: String,
    price: Option<i64>,
    price_text: Option<String>,
    location: Option<String>,
    url: Option<String>,
    description: Option<String>,
    images_json: String,
    deposit_text: Option<String>,
    deposit: Option<i64>,
    commission_text: Option<String>,
    commission_pct: Option<i64>,
    utilities_text: Option<String>,
    extracted_at_us: i64,
    first_seen_us: i64,
    last_updated_us: i64,
}

fn from_micros(us: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| IngestError::Storage(format!("{column} out of range: {us}")))
}

impl TryFrom<ListingRow> for StoredRecord {
    type Error = IngestError;

    fn try_from(row: ListingRow) -> Result<Self> {
        let images: Vec<String> = serde_json::from_str(&row.images_json).map_err(|e| {
            IngestError::Storage(format!("corrupt images for {}: {e}", row.natural_key))
        })?;
        Ok(StoredRecord {
            seq: row.seq,
            first_seen: from_micros(row.first_seen_us, "first_seen")?,
            last_updated: from_micros(row.last_updated_us, "last_updated")?,
            record: ListingRecord {
                natural_key: row.natural_key,
                title: row.title,
                price: row.price,
                price_text: row.price_text,
                location: row.location,
                url: row.url,
                description: row.description,
                images,
                deposit_text: row.deposit_text,
                deposit: row.deposit,
                commission_text: row.commission_text,
                commission_percent: row.commission_pct,
                utilities_text: row.utilities_text,
                extracted_at: from_micros(row.extracted_at_us, "extracted_at")?,
            },
        })
    }
}

async fn add_missing_columns(pool: &SqlitePool) -> Result<()> {
    let existing: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('listings')")
        .fetch_all(pool)
        .await?;
    for (name, kind) in TERM_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            info!(column = name, "Adding column to existing listing table");
            sqlx::raw_sql(&format!("ALTER TABLE listings ADD COLUMN {name} {kind}"))
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Handle to the listing table. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `database_url`,
    /// e.g. `sqlite://listings.sqlite3`. `sqlite::memory:` gives
    /// [`Store::in_memory`].
    #[instrument(level = "info")]
    pub async fn open(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database.
    ///
    /// Every SQLite memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        add_missing_columns(&pool).await?;
        info!("Listing store ready");
        Ok(Self { pool })
    }

    /// Insert or update `record`, stamping it with the current time.
    pub async fn upsert(&self, record: &ListingRecord) -> Result<StoredRecord> {
        self.upsert_at(record, Utc::now()).await
    }

    /// Insert or update `record` as of `at`.
    ///
    /// A new key gets a fresh sequence number and `first_seen = at`. An
    /// existing key keeps both and has every other field replaced.
    ///
    /// # Arguments
    ///
    /// * `record` - A normalized record; its key must not be blank.
    /// * `at` - Becomes `last_updated`, and `first_seen` for a new key.
    ///
    /// # Returns
    ///
    /// The row as stored after the statement, or
    /// [`IngestError::Validation`] for a blank key and
    /// [`IngestError::Storage`] when SQLite fails.
    #[instrument(level = "debug", skip_all, fields(key = %record.natural_key))]
    pub async fn upsert_at(&self, record: &ListingRecord, at: DateTime<Utc>) -> Result<StoredRecord> {
        if record.natural_key.trim().is_empty() {
            return Err(IngestError::Validation(
                "cannot store a listing without a natural key".to_string(),
            ));
        }
        let images_json = serde_json::to_string(&record.images)
            .map_err(|e| IngestError::Storage(format!("cannot encode images: {e}")))?;
        let at_us = at.timestamp_micros();

        let sql = format!(
            "INSERT INTO listings (natural_key, title, price, price_text, location, url, description, \
                 images_json, deposit_text, deposit, commission_text, commission_pct, utilities_text, \
                 extracted_at_us, first_seen_us, last_updated_us)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(natural_key) DO UPDATE SET
                 title = excluded.title,
                 price = excluded.price,
                 price_text = excluded.price_text,
                 location = excluded.location,
                 url = excluded.url,
                 description = excluded.description,
                 images_json = excluded.images_json,
                 deposit_text = excluded.deposit_text,
                 deposit = excluded.deposit,
                 commission_text = excluded.commission_text,
                 commission_pct = excluded.commission_pct,
                 utilities_text = excluded.utilities_text,
                 extracted_at_us = excluded.extracted_at_us,
                 last_updated_us = excluded.last_updated_us
             RETURNING {COLUMNS}"
        );
        let row: ListingRow = sqlx::query_as(&sql)
            .bind(&record.natural_key)
            .bind(&record.title)
            .bind(record.price)
            .bind(&record.price_text)
            .bind(&record.location)
            .bind(&record.url)
            .bind(&record.description)
            .bind(images_json)
            .bind(&record.deposit_text)
            .bind(record.deposit)
            .bind(&record.commission_text)
            .bind(record.commission_percent)
            .bind(&record.utilities_text)
            .bind(record.extracted_at.timestamp_micros())
            .bind(at_us)
            .bind(at_us)
            .fetch_one(&self.pool)
            .await?;

        let stored = StoredRecord::try_from(row)?;
        debug!(seq = stored.seq, first_seen = %stored.first_seen, "Upserted listing");
        Ok(stored)
    }

    /// Up to `count` records, most recently updated first; ties go to the
    /// higher sequence number.
    ///
    /// # Arguments
    ///
    /// * `count` - Maximum number of records; must be positive.
    ///
    /// # Returns
    ///
    /// Fewer than `count` records when fewer are stored, or
    /// [`IngestError::Validation`] for `count <= 0`.
    #[instrument(level = "debug", skip(self))]
    pub async fn recent(&self, count: i64) -> Result<Vec<StoredRecord>> {
        if count <= 0 {
            return Err(IngestError::Validation(format!(
                "count must be positive, got {count}"
            )));
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM listings ORDER BY last_updated_us DESC, seq DESC LIMIT ?"
        );
        let rows: Vec<ListingRow> = sqlx::query_as(&sql)
            .bind(count)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredRecord::try_from).collect()
    }

    /// Number of distinct natural keys stored.
    pub async fn count_all(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The record stored under `natural_key`, which must already be canonical.
    pub async fn get(&self, natural_key: &str) -> Result<Option<StoredRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM listings WHERE natural_key = ?");
        let row: Option<ListingRow> = sqlx::query_as(&sql)
            .bind(natural_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(StoredRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 6, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn listing(key: &str, title: &str, price: Option<i64>) -> ListingRecord {
        let mut r = ListingRecord::new(key, ts(0));
        r.title = title.to_string();
        r.price = price;
        r.location = Some("Москва".to_string());
        r.images = vec!["https://img/1.jpg".to_string()];
        r
    }

    #[tokio::test]
    async fn test_insert_then_update_preserves_identity() {
        let store = Store::in_memory().await.unwrap();

        let first = store.upsert_at(&listing("a", "Old", Some(10)), ts(1)).await.unwrap();
        assert_eq!(first.first_seen, ts(1));
        assert_eq!(first.last_updated, ts(1));

        let second = store.upsert_at(&listing("a", "New", None), ts(5)).await.unwrap();
        assert_eq!(second.seq, first.seq);
        assert_eq!(second.first_seen, ts(1));
        assert_eq!(second.last_updated, ts(5));
        assert_eq!(second.record.title, "New");
        assert_eq!(second.record.price, None);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_converges() {
        let store = Store::in_memory().await.unwrap();
        let record = listing("same", "Title", Some(100));

        let once = store.upsert_at(&record, ts(1)).await.unwrap();
        let twice = store.upsert_at(&record, ts(2)).await.unwrap();

        assert_eq!(once.seq, twice.seq);
        assert_eq!(once.record, twice.record);
        assert_eq!(once.first_seen, twice.first_seen);
        assert_eq!(twice.last_updated, ts(2));
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let store = Store::in_memory().await.unwrap();
        let a = store.upsert_at(&listing("a", "A", None), ts(1)).await.unwrap();
        let b = store.upsert_at(&listing("b", "B", None), ts(1)).await.unwrap();
        assert!(b.seq > a.seq);
    }

    #[tokio::test]
    async fn test_recent_orders_by_last_updated() {
        let store = Store::in_memory().await.unwrap();
        for i in 1..=10 {
            store
                .upsert_at(&listing(&format!("k{i}"), &format!("T{i}"), Some(i)), ts(i))
                .await
                .unwrap();
        }

        let recent = store.recent(5).await.unwrap();
        let titles: Vec<&str> = recent.iter().map(|r| r.record.title.as_str()).collect();
        assert_eq!(titles, vec!["T10", "T9", "T8", "T7", "T6"]);
    }

    #[tokio::test]
    async fn test_recent_breaks_ties_by_sequence() {
        let store = Store::in_memory().await.unwrap();
        for key in ["x", "y", "z"] {
            store.upsert_at(&listing(key, key, None), ts(1)).await.unwrap();
        }
        // Touching "x" moves it to the front.
        store.upsert_at(&listing("x", "x", None), ts(2)).await.unwrap();

        let keys: Vec<String> = store
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.record.natural_key)
            .collect();
        assert_eq!(keys, vec!["x", "z", "y"]);
    }

    #[tokio::test]
    async fn test_recent_rejects_non_positive_count() {
        let store = Store::in_memory().await.unwrap();
        assert!(matches!(store.recent(0).await, Err(IngestError::Validation(_))));
        assert!(matches!(store.recent(-3).await, Err(IngestError::Validation(_))));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = Store::in_memory().await.unwrap();
        let err = store.upsert(&listing("  ", "t", None)).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_trips_all_fields() {
        let store = Store::in_memory().await.unwrap();
        let mut record = listing("full", "Полная запись", Some(65000));
        record.price_text = Some("65 000 ₽".to_string());
        record.url = Some("https://www.avito.ru/moskva/x_12345".to_string());
        record.description = Some("Описание".to_string());
        record.images.push("https://img/2.jpg".to_string());
        record.deposit_text = Some("Залог 65 000 ₽".to_string());
        record.deposit = Some(65000);
        record.commission_text = Some("Без комиссии".to_string());
        record.commission_percent = Some(0);
        record.utilities_text = Some("ЖКУ включены".to_string());

        store.upsert_at(&record, ts(3)).await.unwrap();
        let loaded = store.get("full").await.unwrap().unwrap();
        assert_eq!(loaded.record, record);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_keys() {
        let store = Store::in_memory().await.unwrap();
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert(&listing(&format!("key-{i}"), "t", Some(i)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.count_all().await.unwrap(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_never_mixes_fields() {
        let store = Store::in_memory().await.unwrap();
        let handles: Vec<_> = (0..32i64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert(&listing("shared", &format!("title-{i}"), Some(i)))
                        .await
                })
            })
            .collect();
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap().seq);
        }

        assert_eq!(store.count_all().await.unwrap(), 1);
        assert!(seqs.windows(2).all(|w| w[0] == w[1]));
        let stored = store.get("shared").await.unwrap().unwrap();
        let price = stored.record.price.unwrap();
        assert_eq!(stored.record.title, format!("title-{price}"));
    }

    #[tokio::test]
    async fn test_update_clears_dropped_terms() {
        let store = Store::in_memory().await.unwrap();
        let mut record = listing("terms", "T", None);
        record.deposit = Some(1000);
        record.deposit_text = Some("Залог 1 000 ₽".to_string());
        store.upsert_at(&record, ts(1)).await.unwrap();

        let updated = store.upsert_at(&listing("terms", "T", None), ts(2)).await.unwrap();
        assert_eq!(updated.record.deposit, None);
        assert_eq!(updated.record.deposit_text, None);
    }

    #[tokio::test]
    async fn test_open_upgrades_older_table() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("old.sqlite3").display());
        {
            let options = SqliteConnectOptions::from_str(&url).unwrap().create_if_missing(true);
            let pool = SqlitePool::connect_with(options).await.unwrap();
            sqlx::raw_sql(
                "CREATE TABLE listings (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    natural_key TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    price INTEGER, price_text TEXT, location TEXT, url TEXT, description TEXT,
                    images_json TEXT NOT NULL DEFAULT '[]',
                    extracted_at_us INTEGER NOT NULL,
                    first_seen_us INTEGER NOT NULL,
                    last_updated_us INTEGER NOT NULL
                );",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let store = Store::open(&url).await.unwrap();
        let mut record = listing("upgraded", "U", None);
        record.commission_percent = Some(50);
        let stored = store.upsert(&record).await.unwrap();
        assert_eq!(stored.record.commission_percent, Some(50));
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("listings.sqlite3").display());

        let store = Store::open(&url).await.unwrap();
        store.upsert(&listing("persisted", "P", None)).await.unwrap();
        drop(store);

        let reopened = Store::open(&url).await.unwrap();
        assert_eq!(reopened.count_all().await.unwrap(), 1);
    }
}
