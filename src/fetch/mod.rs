//! Page retrieval from the network or from saved snapshots.
//!
//! [`Fetcher`] makes exactly one request per call. Retrying is a policy the
//! caller layers on with [`retry::RetryFetch`], and cancellation is a race
//! the caller sets up with [`fetch_cancellable`].
//!
//! Cookies set by the site live in a jar shared by every clone of a
//! [`Fetcher`]. With a cookie file configured the jar is seeded from it on
//! startup and written back by [`Fetcher::save_cookies`].

pub mod retry;

use crate::error::{IngestError, Result};
use crate::models::{PageSource, RawPage};
use chrono::Utc;
use rand::seq::IndexedRandom;
use reqwest::cookie::{CookieStore, Jar};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Used when neither an explicit user agent nor a list file is configured.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// On-disk cookie format: origin, then cookie name to value.
type CookieFile = BTreeMap<String, BTreeMap<String, String>>;

/// Anything that can turn a URL into a [`RawPage`].
pub trait FetchPage {
    async fn fetch(&self, url: &str) -> Result<RawPage>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Whole-request timeout, connect included.
    pub timeout: Duration,
    /// Fixed user agent; wins over `user_agent_list`.
    pub user_agent: Option<String>,
    /// File with one user agent per line; one is picked at random.
    pub user_agent_list: Option<PathBuf>,
    /// Proxy URL applied to every scheme.
    pub proxy: Option<String>,
    /// JSON file the cookie jar is loaded from and saved to.
    pub cookie_file: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            user_agent_list: None,
            proxy: None,
            cookie_file: None,
        }
    }
}

/// HTTP page fetcher sharing one connection pool and one cookie jar.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    jar: Arc<Jar>,
    cookie_file: Option<PathBuf>,
    /// Origins contacted or loaded; the jar can only be read back per URL.
    origins: Arc<Mutex<BTreeSet<String>>>,
}

impl Fetcher {
    /// Build the HTTP client described by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Timeout, user agent choice, proxy and cookie file.
    ///
    /// # Returns
    ///
    /// The fetcher, or a validation error for a bad proxy URL. A missing or
    /// unreadable cookie file only logs a warning and starts an empty jar.
    #[instrument(level = "info", skip_all, fields(timeout = ?config.timeout))]
    pub async fn new(config: &FetchConfig) -> Result<Self> {
        let user_agent = pick_user_agent(config).await;
        debug!(%user_agent, "Selected user agent");

        let jar = Arc::new(Jar::default());
        let mut origins = BTreeSet::new();
        if let Some(path) = &config.cookie_file {
            origins = load_cookies(path, &jar).await;
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_provider(Arc::clone(&jar))
            .redirect(reqwest::redirect::Policy::limited(8))
            .timeout(config.timeout);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| IngestError::Validation(format!("invalid proxy {proxy:?}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| IngestError::Validation(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            jar,
            cookie_file: config.cookie_file.clone(),
            origins: Arc::new(Mutex::new(origins)),
        })
    }

    fn remember_origin(&self, url: &Url) {
        self.origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.origin().ascii_serialization());
    }

    /// Write the jar to the configured cookie file; a no-op without one.
    ///
    /// Only name and value are kept, so every cookie comes back as a session
    /// cookie for its origin's root path.
    #[instrument(level = "info", skip(self))]
    pub async fn save_cookies(&self) -> Result<()> {
        let Some(path) = &self.cookie_file else {
            return Ok(());
        };
        let origins: Vec<String> = self
            .origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let mut saved = CookieFile::new();
        for origin in origins {
            let Ok(url) = Url::parse(&origin) else {
                continue;
            };
            let Some(header) = self.jar.cookies(&url) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            let cookies: BTreeMap<String, String> = header
                .split("; ")
                .filter_map(|pair| pair.split_once('='))
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            if !cookies.is_empty() {
                saved.insert(origin, cookies);
            }
        }

        let text = serde_json::to_string_pretty(&saved)
            .map_err(|e| IngestError::Storage(format!("cannot encode cookies: {e}")))?;
        tokio::fs::write(path, text).await.map_err(|e| {
            IngestError::Storage(format!("cannot write cookies {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), origins = saved.len(), "Saved cookies");
        Ok(())
    }

    /// Fetch `url` with a single GET.
    ///
    /// The URL is validated before any network activity. Transport errors,
    /// timeouts and non-2xx statuses become [`IngestError::Network`].
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_by_url(&self, url: &str) -> Result<RawPage> {
        let parsed = validate_url(url)?;
        self.remember_origin(&parsed);

        let response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| IngestError::network(url, &e))?;
        if response.url().origin() != parsed.origin() {
            self.remember_origin(response.url());
        }
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Fetch returned non-success status");
            return Err(IngestError::Network {
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: format!("unexpected status {status}"),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::network(url, &e))?;
        info!(bytes = body.len(), %status, "Fetched page");
        Ok(RawPage {
            source: PageSource::Url(parsed),
            body: body.to_vec(),
            retrieved_at: Utc::now(),
        })
    }
}

impl FetchPage for Fetcher {
    async fn fetch(&self, url: &str) -> Result<RawPage> {
        self.fetch_by_url(url).await
    }
}

/// Read a previously captured page from disk.
#[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
pub async fn fetch_from_snapshot(path: impl AsRef<Path>) -> Result<RawPage> {
    let path = path.as_ref();
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(IngestError::Validation(format!(
                "cannot read snapshot {}: {e}",
                path.display()
            )));
        }
    };
    if body.is_empty() {
        return Err(IngestError::Validation(format!(
            "snapshot {} is empty",
            path.display()
        )));
    }

    info!(bytes = body.len(), "Read snapshot");
    Ok(RawPage {
        source: PageSource::Snapshot(path.to_path_buf()),
        body,
        retrieved_at: Utc::now(),
    })
}

/// Race a fetch against `cancel`; if `cancel` finishes first the fetch is
/// dropped and [`IngestError::Cancelled`] returned.
pub async fn fetch_cancellable<F, C>(fetcher: &F, url: &str, cancel: C) -> Result<RawPage>
where
    F: FetchPage,
    C: Future,
{
    tokio::select! {
        biased;
        _ = cancel => {
            warn!(%url, "Fetch cancelled by caller");
            Err(IngestError::Cancelled)
        }
        res = fetcher.fetch(url) => res,
    }
}

/// Check that `url` is an absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| IngestError::Validation(format!("malformed url {url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(IngestError::Validation(format!(
            "unsupported url scheme {:?} in {url:?}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(IngestError::Validation(format!("url {url:?} has no host")));
    }
    Ok(parsed)
}

/// Seed `jar` from a cookie file and return the origins it named.
async fn load_cookies(path: &Path, jar: &Jar) -> BTreeSet<String> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No cookie file yet");
            return BTreeSet::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read cookie file");
            return BTreeSet::new();
        }
    };
    let saved: CookieFile = match serde_json::from_str(&text) {
        Ok(saved) => saved,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed cookie file");
            return BTreeSet::new();
        }
    };

    let mut origins = BTreeSet::new();
    for (origin, cookies) in saved {
        let Ok(url) = Url::parse(&origin) else {
            warn!(%origin, "Ignoring cookies for an unparseable origin");
            continue;
        };
        for (name, value) in &cookies {
            jar.add_cookie_str(&format!("{name}={value}; Path=/"), &url);
        }
        origins.insert(url.origin().ascii_serialization());
    }
    info!(path = %path.display(), origins = origins.len(), "Loaded cookies");
    origins
}

async fn pick_user_agent(config: &FetchConfig) -> String {
    if let Some(ua) = config.user_agent.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return ua.to_string();
    }
    if let Some(path) = &config.user_agent_list {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let agents: Vec<&str> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                if let Some(ua) = agents.choose(&mut rand::rng()) {
                    return ua.to_string();
                }
                warn!(path = %path.display(), "User agent list is empty");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read user agent list"),
        }
    }
    DEFAULT_USER_AGENT.to_string()
}
