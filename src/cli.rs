//! Command-line interface definitions.
//!
//! Every global option can also be supplied through the environment variable
//! named in its help text.

use crate::error::Result;
use crate::extract::ExtractRules;
use crate::fetch::FetchConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Fetch classified-ads listing pages, extract the listings and keep them in
/// a local SQLite database.
///
/// # Examples
///
/// ```sh
/// # Fetch a search page and store its listings
/// listing_ingest fetch "https://www.avito.ru/moskva/kvartiry/sdam"
///
/// # Re-parse the newest saved capture
/// listing_ingest --snapshot-dir ./Trash parse-file
///
/// # Show the ten most recently updated listings
/// listing_ingest dump --count 10
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://listings.sqlite3", global = true)]
    pub database_url: String,

    /// Whole-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value_t = 20, global = true)]
    pub timeout_secs: u64,

    /// Fixed User-Agent header
    #[arg(long, env = "USER_AGENT", global = true)]
    pub user_agent: Option<String>,

    /// File with one User-Agent per line; one is picked at random
    #[arg(long, env = "USER_AGENT_LIST_PATH", global = true)]
    pub user_agent_list: Option<PathBuf>,

    /// Proxy URL for all requests
    #[arg(long, env = "PROXY_URL", global = true)]
    pub proxy: Option<String>,

    /// Retries for transient fetch failures (403, 429, 5xx, transport errors)
    #[arg(long, env = "FETCH_RETRIES", default_value_t = 0, global = true)]
    pub retries: usize,

    /// YAML file overriding the extraction rules
    #[arg(long, env = "EXTRACT_RULES", global = true)]
    pub rules: Option<PathBuf>,

    /// Base for relative links in pages read from disk; overrides the rules file
    /// [default: https://www.avito.ru]
    #[arg(long, env = "BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// JSON file the cookie jar is loaded from and saved to after fetching
    #[arg(long, env = "COOKIE_FILE", global = true)]
    pub cookie_file: Option<PathBuf>,

    /// Directory for page captures
    #[arg(long, env = "SNAPSHOT_DIR", global = true)]
    pub snapshot_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch each URL and ingest its listings
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Ingest a saved page; defaults to the newest capture in the snapshot directory
    ParseFile {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print the most recently updated listings
    Dump {
        #[arg(short, long, default_value_t = 20)]
        count: i64,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print one stored listing as JSON
    Show {
        /// Listing id, e.g. 3578421570
        key: String,
    },
}

impl Cli {
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: self.user_agent.clone(),
            user_agent_list: self.user_agent_list.clone(),
            proxy: self.proxy.clone(),
            cookie_file: self.cookie_file.clone(),
        }
    }

    /// The extraction rules for this run.
    ///
    /// Starts from the `--rules` file, or the built-in defaults without one.
    /// An explicit `--base-url`/`BASE_URL` replaces whatever base URL that
    /// source carried.
    pub async fn extract_rules(&self) -> Result<ExtractRules> {
        let mut rules = match &self.rules {
            Some(path) => ExtractRules::from_yaml_file(path).await?,
            None => ExtractRules::default(),
        };
        if let Some(base_url) = &self.base_url {
            rules.base_url = base_url.clone();
        }
        Ok(rules)
    }
}
