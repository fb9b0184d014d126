//! Archive of fetched pages.
//!
//! Each capture lives in its own timestamped directory,
//! `<dir>/<YYYYMMDD_HHMMSS>/page.html`, so a page that failed to parse can be
//! replayed later with `parse-file`.

use crate::error::{IngestError, Result};
use crate::models::RawPage;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, instrument};

pub const PAGE_FILE: &str = "page.html";

fn storage(path: &Path, e: std::io::Error) -> IngestError {
    IngestError::Storage(format!("{}: {e}", path.display()))
}

/// Write `page` under `dir` and return the path of the capture.
///
/// The directory name comes from the page's retrieval time; a second
/// capture within the same second replaces the first.
#[instrument(level = "info", skip_all, fields(dir = %dir.display(), source = %page.source))]
pub async fn save(dir: &Path, page: &RawPage) -> Result<PathBuf> {
    let capture_dir = dir.join(page.retrieved_at.format("%Y%m%d_%H%M%S").to_string());
    fs::create_dir_all(&capture_dir)
        .await
        .map_err(|e| storage(&capture_dir, e))?;

    let path = capture_dir.join(PAGE_FILE);
    fs::write(&path, &page.body)
        .await
        .map_err(|e| storage(&path, e))?;
    info!(path = %path.display(), bytes = page.body.len(), "Saved page snapshot");
    Ok(path)
}

/// The most recent capture under `dir`.
///
/// Newest `<dir>/*/page.html` by modification time (ties broken by
/// directory name), else `<dir>/page.html`, else [`IngestError::NotFound`].
#[instrument(level = "debug")]
pub async fn latest(dir: &Path) -> Result<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    match fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await.map_err(|e| storage(dir, e))? {
                let candidate = entry.path().join(PAGE_FILE);
                let Ok(meta) = fs::metadata(&candidate).await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let is_newer = match &newest {
                    None => true,
                    Some((best_time, best_path)) => {
                        (modified, &candidate) > (*best_time, best_path)
                    }
                };
                if is_newer {
                    newest = Some((modified, candidate));
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(storage(dir, e)),
    }

    if let Some((_, path)) = newest {
        debug!(path = %path.display(), "Found latest capture");
        return Ok(path);
    }

    let flat = dir.join(PAGE_FILE);
    if fs::metadata(&flat).await.is_ok_and(|m| m.is_file()) {
        return Ok(flat);
    }
    Err(IngestError::NotFound(flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageSource;
    use chrono::{TimeZone, Utc};

    fn page_at(hour: u32, body: &str) -> RawPage {
        RawPage {
            source: PageSource::Snapshot(PathBuf::from("in-memory")),
            body: body.as_bytes().to_vec(),
            retrieved_at: Utc.with_ymd_and_hms(2025, 5, 6, hour, 30, 15).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = save(dir.path(), &page_at(9, "<html>a</html>")).await.unwrap();

        assert_eq!(path, dir.path().join("20250506_093015").join("page.html"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<html>a</html>");
    }

    #[tokio::test]
    async fn test_latest_picks_newest_capture() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &page_at(9, "old")).await.unwrap();
        let newer = save(dir.path(), &page_at(10, "new")).await.unwrap();

        assert_eq!(latest(dir.path()).await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_latest_ignores_dirs_without_page() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save(dir.path(), &page_at(9, "only")).await.unwrap();
        std::fs::create_dir(dir.path().join("zzz_empty")).unwrap();

        assert_eq!(latest(dir.path()).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_latest_falls_back_to_flat_file() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("page.html");
        std::fs::write(&flat, "flat").unwrap();

        assert_eq!(latest(dir.path()).await.unwrap(), flat);
    }

    #[tokio::test]
    async fn test_latest_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(latest(dir.path()).await, Err(IngestError::NotFound(_))));

        let missing = dir.path().join("nope");
        assert!(matches!(latest(&missing).await, Err(IngestError::NotFound(_))));
    }
}
