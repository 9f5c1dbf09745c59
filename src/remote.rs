//! Remote site abstraction.
//!
//! The sync engine only talks to the archive through [`RemoteSite`]. Sessions
//! cross process boundaries (database, job descriptors) as opaque versioned
//! tokens produced by [`RemoteSession::to_token`].

mod ao3;
mod retry;

pub use ao3::Ao3Client;
pub use retry::RetryPolicy;

use crate::db::CollectionKind;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const TOKEN_VERSION: &str = "v1";

/// Scheme of tag categories; the tag kind is appended as a fragment.
pub const TAG_SCHEME: &str = "https://archiveofourown.org/faq/tags";

/// Canonical URL of a work, lowercased.
pub fn work_url(base_url: &str, remote_id: i64) -> String {
    format!("{}/works/{}", base_url.trim_end_matches('/'), remote_id).to_lowercase()
}

/// Canonical URL of a tag, using the archive's escapes for reserved
/// characters.
pub fn tag_url(base_url: &str, tag: &str) -> String {
    let escaped = tag
        .replace('/', "*s*")
        .replace('&', "*a*")
        .replace('.', "*d*")
        .replace('?', "*q*")
        .replace('#', "*h*");
    format!(
        "{}/tags/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(&escaped).replace("%2A", "*")
    )
}

/// Authenticated session with the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Username the session was created for.
    pub username: String,
    /// Session cookies, name to value.
    pub cookies: BTreeMap<String, String>,
}

impl RemoteSession {
    /// Serialize into a storable token.
    pub fn to_token(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AppError::Session(format!("Failed to encode session: {}", e)))?;
        Ok(format!("{}.{}", TOKEN_VERSION, URL_SAFE_NO_PAD.encode(json)))
    }

    /// Parse a token produced by [`RemoteSession::to_token`].
    pub fn from_token(token: &str) -> Result<Self> {
        let payload = match token.split_once('.') {
            Some((TOKEN_VERSION, payload)) => payload,
            Some((version, _)) => {
                return Err(AppError::Session(format!(
                    "Unsupported session token version: {}",
                    version
                )));
            }
            None => return Err(AppError::Session("Malformed session token".to_string())),
        };

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AppError::Session(format!("Invalid session encoding: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| AppError::Session(format!("Invalid session payload: {}", e)))
    }

    /// Render the cookies as a `Cookie` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Kinds of tag the archive attaches to a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// Rating (General, Teen, ...).
    Rating,
    /// Archive warning.
    Warning,
    /// Relationship category (F/M, Gen, ...).
    Category,
    /// Fandom.
    Fandom,
    /// Relationship.
    Relationship,
    /// Character.
    Character,
    /// Additional (freeform) tag.
    Freeform,
}

impl TagKind {
    /// Fragment appended to the tag scheme URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Rating => "rating",
            TagKind::Warning => "warning",
            TagKind::Category => "category",
            TagKind::Fandom => "fandom",
            TagKind::Relationship => "relationship",
            TagKind::Character => "character",
            TagKind::Freeform => "tag",
        }
    }
}

/// A tag on a work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag kind.
    pub kind: TagKind,
    /// Tag text.
    pub name: String,
}

/// A work's author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Pseud shown on the work.
    pub name: String,
    /// Profile URL, if the author is not anonymous.
    pub uri: Option<String>,
}

/// Metadata of one work as loaded from the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Work id.
    pub remote_id: u64,
    /// Title.
    pub title: String,
    /// Authors.
    pub authors: Vec<Author>,
    /// Tags of every kind, ratings included.
    pub tags: Vec<Tag>,
    /// Language.
    pub language: Option<String>,
    /// Summary text.
    pub summary: Option<String>,
    /// Publication time.
    pub published: Option<i64>,
    /// Time the last chapter was posted.
    pub updated: Option<i64>,
    /// Time the work was last edited.
    pub edited: Option<i64>,
    /// Download URLs, one per format.
    pub downloads: Vec<String>,
    /// Images embedded in the work text.
    pub images: Vec<String>,
}

impl ItemMetadata {
    /// Remote last-modified time: the later of edited and updated, falling back
    /// to the publication time.
    pub fn updated_at(&self) -> i64 {
        self.edited
            .max(self.updated)
            .or(self.published)
            .unwrap_or(0)
    }

    /// The rating tag, if any.
    pub fn rating(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.kind == TagKind::Rating)
            .map(|t| t.name.as_str())
    }
}

/// The archive as seen by the sync engine.
#[async_trait]
pub trait RemoteSite: Send + Sync {
    /// Log in and return a session. Fails with [`AppError::Authentication`]
    /// on bad credentials.
    async fn authenticate(&self, username: &str, password: &str) -> Result<RemoteSession>;

    /// Work ids on one page of a reading list, in page order. Pages start at
    /// 1; a page past the end yields no ids.
    async fn list_page(
        &self,
        session: &RemoteSession,
        kind: CollectionKind,
        page: u32,
    ) -> Result<Vec<u64>>;

    /// Load the full metadata of a work. Fails with [`AppError::NotFound`]
    /// when the work is gone.
    async fn load_item(&self, session: &RemoteSession, remote_id: u64) -> Result<ItemMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RemoteSession {
        RemoteSession {
            username: "reader".to_string(),
            cookies: BTreeMap::from([
                ("_otwarchive_session".to_string(), "abc123".to_string()),
                ("user_credentials".to_string(), "1".to_string()),
            ]),
        }
    }

    #[test]
    fn session_token_round_trip() {
        let token = session().to_token().unwrap();
        assert!(token.starts_with("v1."));
        assert_eq!(RemoteSession::from_token(&token).unwrap(), session());
    }

    #[test]
    fn session_token_rejects_unknown_version() {
        let token = session().to_token().unwrap();
        let v2 = token.replacen("v1.", "v2.", 1);
        assert!(matches!(
            RemoteSession::from_token(&v2),
            Err(AppError::Session(_))
        ));
        assert!(RemoteSession::from_token("not a token").is_err());
        assert!(RemoteSession::from_token("v1.!!!").is_err());
    }

    #[test]
    fn cookie_header_joins_pairs() {
        assert_eq!(
            session().cookie_header(),
            "_otwarchive_session=abc123; user_credentials=1"
        );
    }

    #[test]
    fn tag_urls_use_archive_escapes() {
        let base = "https://archiveofourown.org";
        assert_eq!(
            tag_url(base, "Aziraphale/Crowley (Good Omens)"),
            "https://archiveofourown.org/tags/Aziraphale*s*Crowley%20%28Good%20Omens%29"
        );
        assert_eq!(tag_url(base, "Tea & Cake"), format!("{}/tags/Tea%20*a*%20Cake", base));
        assert_eq!(tag_url(base, "Mr. Who?"), format!("{}/tags/Mr*d*%20Who*q*", base));
    }

    #[test]
    fn work_urls_are_lowercase() {
        assert_eq!(
            work_url("https://ArchiveOfOurOwn.org/", 42),
            "https://archiveofourown.org/works/42"
        );
    }

    #[test]
    fn updated_at_prefers_latest_edit() {
        let mut meta = ItemMetadata {
            published: Some(10),
            ..Default::default()
        };
        assert_eq!(meta.updated_at(), 10);
        meta.updated = Some(20);
        assert_eq!(meta.updated_at(), 20);
        meta.edited = Some(30);
        assert_eq!(meta.updated_at(), 30);
        meta.updated = Some(40);
        assert_eq!(meta.updated_at(), 40);
    }
}
