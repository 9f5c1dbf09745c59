mod schema;
mod upsert;

pub use schema::{Database, Relation};
pub use upsert::{Record, UpsertResult};

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Username for login.
    pub username: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub display_name: Option<String>,
    /// User role: "admin" or "user".
    pub role: String,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

/// Local login session.
#[derive(Debug, Clone)]
pub struct LoginSession {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Device ID (optional).
    pub device_id: Option<String>,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// AO3 credentials owned by a local user.
#[derive(Debug, Clone)]
pub struct RemoteAccount {
    /// Row ID.
    pub id: i64,
    /// Owning local user.
    pub user_id: String,
    /// AO3 username.
    pub username: String,
    /// AO3 password.
    pub password: String,
    /// Serialized remote session token.
    pub session: Option<String>,
    /// When the session was last (re)derived.
    pub updated: i64,
    /// When feeds were last fanned out for the whole account.
    pub synced: i64,
}

/// AO3 reading list kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// "Marked for Later" list.
    MarkedForLater,
    /// Bookmarked works.
    Bookmarks,
    /// Work subscriptions.
    Subscriptions,
    /// Reading history.
    History,
}

impl CollectionKind {
    /// Every kind.
    pub const ALL: [CollectionKind; 4] = [
        CollectionKind::MarkedForLater,
        CollectionKind::Bookmarks,
        CollectionKind::Subscriptions,
        CollectionKind::History,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::MarkedForLater => "marked_for_later",
            CollectionKind::Bookmarks => "bookmarks",
            CollectionKind::Subscriptions => "subscriptions",
            CollectionKind::History => "history",
        }
    }

    /// URL path segment.
    pub fn slug(&self) -> &'static str {
        match self {
            CollectionKind::MarkedForLater => "marked-for-later",
            other => other.as_str(),
        }
    }

    /// Human-readable name.
    pub fn title(&self) -> &'static str {
        match self {
            CollectionKind::MarkedForLater => "Marked for Later",
            CollectionKind::Bookmarks => "Bookmarks",
            CollectionKind::Subscriptions => "Subscriptions",
            CollectionKind::History => "History",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.slug() == s)
            .ok_or_else(|| AppError::NotFound(format!("Unknown feed kind: {}", s)))
    }
}

/// Cached feed for one (account, kind) pair.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Row ID.
    pub id: i64,
    /// Owning remote account.
    pub account_id: i64,
    /// List kind.
    pub kind: CollectionKind,
    /// Rendered feed document, if cached.
    pub content: Option<String>,
    /// Bumped whenever the cached document is dropped.
    pub content_version: i64,
    /// Last successful listing.
    pub updated: i64,
    /// Whether the share link is active.
    pub share_enabled: bool,
    /// Opaque share token.
    pub share_key: Option<String>,
}

/// Stored AO3 work.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    /// Row ID.
    pub id: i64,
    /// AO3 work id.
    pub remote_id: i64,
    /// Title.
    pub title: String,
    /// Remote last-modified time, max(edited, updated).
    pub updated_at: i64,
    /// Remote publication time.
    pub published_at: Option<i64>,
    /// Language.
    pub language: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Summary text.
    pub summary: Option<String>,
    /// Content rating.
    pub rating: Option<String>,
    /// When the metadata was last fetched.
    pub updated: i64,
}

/// Collection entry joined to its item's remote id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryRecord {
    /// Entry row ID.
    pub entry_id: i64,
    /// Item row ID.
    pub item_id: i64,
    /// AO3 work id.
    pub remote_id: i64,
    /// Item metadata fetch time.
    pub item_updated: i64,
}

/// Author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Person {
    /// Display name.
    pub name: String,
    /// Profile URL ("" if unknown).
    pub uri: String,
    /// Email ("" if unknown).
    pub email: String,
}

/// Tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    /// Canonical tag URL.
    pub term: String,
    /// Tag scheme, including the tag kind fragment.
    pub scheme: String,
    /// Tag text.
    pub label: String,
}

/// Acquisition or image link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemLink {
    /// Target URL.
    pub href: String,
    /// Link relation.
    pub rel: String,
    /// MIME type ("" if unknown).
    pub link_type: String,
    /// Human-readable description.
    pub title: Option<String>,
}

/// An item with everything needed to render a feed entry.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    /// The work.
    pub item: Item,
    /// Authors.
    pub authors: Vec<Person>,
    /// Tags.
    pub categories: Vec<Category>,
    /// Links.
    pub links: Vec<ItemLink>,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

/// Whether a timestamp is older than `window`.
pub fn is_stale(ts: i64, window: std::time::Duration) -> bool {
    now_timestamp().saturating_sub(ts) > window.as_secs() as i64
}
