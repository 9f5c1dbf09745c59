use crate::sync::FetchMode;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// OPDS feeds for Archive of Our Own reading lists.
#[derive(Parser, Debug, Clone)]
#[command(name = "ao3-opds")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "AO3_OPDS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// AO3 account management commands.
    Account {
        /// Account subcommand action.
        #[command(subcommand)]
        action: AccountCommand,
    },

    /// Synchronize a user's AO3 lists once and exit.
    Sync {
        /// Local username.
        username: String,
        /// Only synchronize this list (marked-for-later, bookmarks, subscriptions, history).
        #[arg(short, long)]
        kind: Option<String>,
        /// Refetch everything regardless of freshness.
        #[arg(short, long)]
        force: bool,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        username: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// AO3 account subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum AccountCommand {
    /// Store (and verify) AO3 credentials for a local user.
    Set {
        /// Local username.
        username: String,
        /// AO3 username.
        #[arg(long)]
        ao3_username: String,
        /// AO3 password (will prompt if not provided).
        #[arg(long)]
        ao3_password: Option<String>,
    },

    /// Remove AO3 credentials and cached feeds for a local user.
    Del {
        /// Local username.
        username: String,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Remote site configuration.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Feed document configuration.
    #[serde(default)]
    pub feed: FeedConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Site title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Public base URL used in share links and feed self links.
    #[serde(default)]
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            base_url: String::new(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "AO3 OPDS".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/ao3-opds.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    30
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// How feed endpoints refresh a stale collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Sync and fetch items before responding.
    Inline,
    /// Queue a high-priority sync and respond with what is cached.
    Queued,
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Refresh behaviour of feed endpoints.
    #[serde(default = "default_refresh_mode")]
    pub refresh_mode: RefreshMode,

    /// Fetch mode for accounts.
    #[serde(default)]
    pub user_mode: FetchMode,

    /// Fetch mode for collections.
    #[serde(default)]
    pub feed_mode: FetchMode,

    /// Fetch mode for individual works.
    #[serde(default)]
    pub work_mode: FetchMode,

    /// Seconds a collection listing stays fresh.
    #[serde(default = "default_collection_window")]
    pub collection_window_seconds: u64,

    /// Seconds a fetched work stays fresh.
    #[serde(default = "default_day")]
    pub item_window_seconds: u64,

    /// Seconds between account-wide refreshes.
    #[serde(default = "default_day")]
    pub account_window_seconds: u64,

    /// Hours before a stored AO3 session is re-authenticated.
    #[serde(default = "default_session_refresh_hours")]
    pub session_refresh_hours: u64,

    /// Page cap for the history list.
    #[serde(default = "default_history_max_pages")]
    pub history_max_pages: u32,

    /// Page cap for the other lists.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Number of concurrent job workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deliveries of a job before a transient failure is dropped.
    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,

    /// Delay before the second delivery of a failed job, doubled for each
    /// later one.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    /// Scheduled background sync interval in seconds (0 to disable).
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_mode: default_refresh_mode(),
            user_mode: FetchMode::default(),
            feed_mode: FetchMode::default(),
            work_mode: FetchMode::default(),
            collection_window_seconds: default_collection_window(),
            item_window_seconds: default_day(),
            account_window_seconds: default_day(),
            session_refresh_hours: default_session_refresh_hours(),
            history_max_pages: default_history_max_pages(),
            max_pages: default_max_pages(),
            workers: default_workers(),
            job_attempts: default_job_attempts(),
            retry_delay_seconds: default_retry_delay(),
            interval_seconds: default_interval(),
        }
    }
}

fn default_refresh_mode() -> RefreshMode {
    RefreshMode::Queued
}

fn default_collection_window() -> u64 {
    60 * 60
}

fn default_day() -> u64 {
    24 * 60 * 60
}

fn default_session_refresh_hours() -> u64 {
    14 * 24
}

fn default_history_max_pages() -> u32 {
    21
}

fn default_max_pages() -> u32 {
    100
}

fn default_workers() -> usize {
    2 // AO3 rate-limits aggressively
}

fn default_job_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    30
}

fn default_interval() -> u64 {
    60 * 60
}

impl SyncConfig {
    /// Freshness window for collections.
    pub fn collection_window(&self) -> Duration {
        Duration::from_secs(self.collection_window_seconds)
    }

    /// Freshness window for works.
    pub fn item_window(&self) -> Duration {
        Duration::from_secs(self.item_window_seconds)
    }

    /// Freshness window for accounts.
    pub fn account_window(&self) -> Duration {
        Duration::from_secs(self.account_window_seconds)
    }

    /// Maximum age of a stored remote session.
    pub fn session_refresh(&self) -> Duration {
        Duration::from_secs(self.session_refresh_hours * 60 * 60)
    }

    /// Base delay before a failed job is delivered again.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

/// Remote site configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the archive.
    #[serde(default = "default_remote_base")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Retries after a "too many requests" response.
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// Seconds to sleep before each rate-limit retry.
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_seconds: u64,

    /// User-Agent header sent to the archive.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base(),
            request_timeout_seconds: default_request_timeout(),
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_backoff_seconds: default_rate_limit_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_remote_base() -> String {
    "https://archiveofourown.org".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_rate_limit_backoff() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("ao3-opds/{}", env!("CARGO_PKG_VERSION"))
}

/// Feed document configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Prefix of feed ids; the list kind is appended.
    #[serde(default = "default_feed_id_base")]
    pub id_base: String,

    /// Feed author name.
    #[serde(default = "default_title")]
    pub author_name: String,

    /// Feed author URI.
    #[serde(default)]
    pub author_uri: Option<String>,

    /// Feed author email.
    #[serde(default)]
    pub author_email: Option<String>,

    /// Download formats offered as acquisition links.
    #[serde(default = "default_formats")]
    pub formats: Vec<DownloadFormat>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            id_base: default_feed_id_base(),
            author_name: default_title(),
            author_uri: None,
            author_email: None,
            formats: default_formats(),
        }
    }
}

fn default_feed_id_base() -> String {
    "urn:ao3-opds:feed".to_string()
}

fn default_formats() -> Vec<DownloadFormat> {
    DownloadFormat::ALL.to_vec()
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("ao3-opds.toml"),
            dirs::config_dir()
                .map(|p| p.join("ao3-opds").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ao3-opds/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# ao3-opds configuration

[server]
bind = "0.0.0.0:8080"
title = "AO3 OPDS"
# Public URL, used for share links
# base_url = "https://opds.example.org"

[database]
# path = "/var/lib/ao3-opds/ao3-opds.db"

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
# Session duration in days
session_days = 30

[sync]
# "inline" refreshes before answering, "queued" answers from cache
refresh_mode = "queued"
# Fetch modes: "no_fetch", "update_stale", "force"
user_mode = "update_stale"
feed_mode = "update_stale"
work_mode = "update_stale"
collection_window_seconds = 3600
item_window_seconds = 86400
account_window_seconds = 86400
session_refresh_hours = 336
history_max_pages = 21
max_pages = 100
workers = 2
job_attempts = 3
# Seconds before a failed job runs again, doubled per attempt
retry_delay_seconds = 30
# Background refresh of every account (0 to disable)
interval_seconds = 3600

[remote]
base_url = "https://archiveofourown.org"
request_timeout_seconds = 30
rate_limit_retries = 3
rate_limit_backoff_seconds = 300

[feed]
id_base = "urn:ao3-opds:feed"
author_name = "AO3 OPDS"
# author_uri = "https://opds.example.org"
# author_email = "admin@example.org"
formats = ["azw3", "epub", "html", "mobi", "pdf"]
"#
        .to_string()
    }
}

/// Download formats offered by the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    /// Kindle AZW3.
    Azw3,
    /// EPUB.
    Epub,
    /// Single-page HTML.
    Html,
    /// Mobipocket.
    Mobi,
    /// PDF.
    Pdf,
}

impl DownloadFormat {
    /// Every format, in the order the archive lists them.
    pub const ALL: [DownloadFormat; 5] = [
        DownloadFormat::Azw3,
        DownloadFormat::Epub,
        DownloadFormat::Html,
        DownloadFormat::Mobi,
        DownloadFormat::Pdf,
    ];

    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            DownloadFormat::Azw3 => "application/vnd.amazon.ebook",
            DownloadFormat::Epub => "application/epub+zip",
            DownloadFormat::Html => "text/html",
            DownloadFormat::Mobi => "application/x-mobipocket-ebook",
            DownloadFormat::Pdf => "application/pdf",
        }
    }

    /// Label shown by the archive (and used in link titles).
    pub fn label(&self) -> &'static str {
        match self {
            DownloadFormat::Azw3 => "AZW3",
            DownloadFormat::Epub => "EPUB",
            DownloadFormat::Html => "HTML",
            DownloadFormat::Mobi => "MOBI",
            DownloadFormat::Pdf => "PDF",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "azw3" | "azw" => Some(DownloadFormat::Azw3),
            "epub" => Some(DownloadFormat::Epub),
            "html" | "htm" => Some(DownloadFormat::Html),
            "mobi" => Some(DownloadFormat::Mobi),
            "pdf" => Some(DownloadFormat::Pdf),
            _ => None,
        }
    }

    /// Infer the format from a download URL's path extension.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}
