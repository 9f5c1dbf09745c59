//! Archive of Our Own over plain HTTP.

use super::{Author, ItemMetadata, RemoteSession, RemoteSite, Tag, TagKind};
use crate::config::RemoteConfig;
use crate::db::CollectionKind;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Client, Response, StatusCode, redirect};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

static AUTH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name="authenticity_token"[^>]*value="([^"]+)""#).expect("valid regex")
});
static WORK_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="/works/(\d+)""#).expect("valid regex"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<h2 class="title heading">\s*(.*?)\s*</h2>"#).expect("valid regex")
});
static AUTHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a rel="author" href="(/users/[^"]+)">([^<]+)</a>"#).expect("valid regex")
});
static TAG_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<dd class="(rating|warning|category|fandom|relationship|character|freeform) tags">(.*?)</dd>"#,
    )
    .expect("valid regex")
});
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a class="tag" href="[^"]*">([^<]+)</a>"#).expect("valid regex"));
static LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<dd class="language"[^>]*>\s*(.*?)\s*</dd>"#).expect("valid regex")
});
static PUBLISHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<dd class="published">(\d{4}-\d{2}-\d{2})</dd>"#).expect("valid regex")
});
static STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<dd class="status">(\d{4}-\d{2}-\d{2})</dd>"#).expect("valid regex")
});
static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div class="summary module"[^>]*>.*?<blockquote class="userstuff">(.*?)</blockquote>"#)
        .expect("valid regex")
});
static DOWNLOAD_MENU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<li class="download"[^>]*>(.*?)</li>\s*</ul>"#).expect("valid regex")
});
static DOWNLOAD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="(/downloads/[^"]+)""#).expect("valid regex"));
static EDITED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]updated_at=(\d+)").expect("valid regex"));
static CHAPTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div id="chapters"[^>]*>(.*)"#).expect("valid regex")
});
static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img\b[^>]*\bsrc="([^"]+)""#).expect("valid regex"));

/// Wrap width for converted text; wide enough that paragraphs stay on one line.
const TEXT_WIDTH: usize = 4096;

/// HTTP client for archiveofourown.org.
pub struct Ao3Client {
    client: Client,
    base_url: String,
}

impl Ao3Client {
    /// Build a client from configuration.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn list_url(&self, username: &str, kind: CollectionKind, page: u32) -> String {
        let user = urlencoding::encode(username);
        match kind {
            CollectionKind::MarkedForLater => format!(
                "{}/users/{}/readings?show=to-read&page={}",
                self.base_url, user, page
            ),
            CollectionKind::Bookmarks => {
                format!("{}/users/{}/bookmarks?page={}", self.base_url, user, page)
            }
            CollectionKind::Subscriptions => format!(
                "{}/users/{}/subscriptions?type=works&page={}",
                self.base_url, user, page
            ),
            CollectionKind::History => {
                format!("{}/users/{}/readings?page={}", self.base_url, user, page)
            }
        }
    }

    /// GET a page as the given session, mapping archive status codes to errors.
    async fn get_page(&self, url: &str, session: Option<&RemoteSession>) -> Result<String> {
        let mut request = self.client.get(url);
        if let Some(session) = session {
            request = request.header(COOKIE, session.cookie_header());
        }
        let response = request.send().await?;

        match response.status() {
            status if status.is_success() => Ok(response.text().await?),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(AppError::RateLimited(format!("Too many requests for {}", url)))
            }
            StatusCode::NOT_FOUND => Err(AppError::NotFound(url.to_string())),
            status if status.is_redirection() => {
                let location = header_str(&response, LOCATION).unwrap_or_default();
                if location.contains("/users/login") || location.contains("/auth_error") {
                    Err(AppError::Authentication(
                        "Archive session is no longer valid".to_string(),
                    ))
                } else {
                    Err(AppError::Remote(format!(
                        "Unexpected redirect from {} to {}",
                        url, location
                    )))
                }
            }
            status => Err(AppError::Remote(format!("HTTP {} for {}", status, url))),
        }
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn capture_cookies(response: &Response, cookies: &mut BTreeMap<String, String>) {
    for value in response.headers().get_all(SET_COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let pair = value.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}

#[async_trait]
impl RemoteSite for Ao3Client {
    async fn authenticate(&self, username: &str, password: &str) -> Result<RemoteSession> {
        let login_url = format!("{}/users/login", self.base_url);
        let mut cookies = BTreeMap::new();

        let response = self.client.get(&login_url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited("Too many login attempts".to_string()));
        }
        capture_cookies(&response, &mut cookies);
        let page = response.text().await?;
        let token = AUTH_TOKEN
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| clean_text(m.as_str()))
            .ok_or_else(|| AppError::Remote("Login form has no authenticity token".to_string()))?;

        let pending = RemoteSession {
            username: username.to_string(),
            cookies,
        };
        let response = self
            .client
            .post(&login_url)
            .header(COOKIE, pending.cookie_header())
            .form(&[
                ("authenticity_token", token.as_str()),
                ("user[login]", username),
                ("user[password]", password),
                ("user[remember_me]", "1"),
                ("commit", "Log in"),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited("Too many login attempts".to_string()));
        }

        let mut cookies = pending.cookies;
        capture_cookies(&response, &mut cookies);
        let location = header_str(&response, LOCATION).unwrap_or_default();

        // A successful login redirects away from the form and sets the
        // remember-me credentials cookie.
        if !response.status().is_redirection()
            || location.contains("/users/login")
            || !cookies.contains_key("user_credentials")
        {
            tracing::debug!(username, status = %response.status(), "Archive login rejected");
            return Err(AppError::Authentication(format!(
                "Archive rejected the credentials for {}",
                username
            )));
        }

        tracing::info!(username, "Logged in to the archive");
        Ok(RemoteSession {
            username: username.to_string(),
            cookies,
        })
    }

    async fn list_page(
        &self,
        session: &RemoteSession,
        kind: CollectionKind,
        page: u32,
    ) -> Result<Vec<u64>> {
        let url = self.list_url(&session.username, kind, page);
        let html = self.get_page(&url, Some(session)).await?;
        let ids = parse_work_ids(&html);
        tracing::debug!(kind = %kind, page, found = ids.len(), "Listed page");
        Ok(ids)
    }

    async fn load_item(&self, session: &RemoteSession, remote_id: u64) -> Result<ItemMetadata> {
        let url = format!(
            "{}/works/{}?view_adult=true&view_full_work=false",
            self.base_url, remote_id
        );
        let html = self.get_page(&url, Some(session)).await?;
        let mut metadata = parse_work(&html, remote_id)?;
        let links = metadata
            .downloads
            .iter_mut()
            .chain(metadata.images.iter_mut())
            .chain(metadata.authors.iter_mut().filter_map(|a| a.uri.as_mut()));
        for link in links {
            if link.starts_with('/') {
                *link = format!("{}{}", self.base_url, link);
            }
        }
        Ok(metadata)
    }
}

fn parse_work_ids(html: &str) -> Vec<u64> {
    WORK_LINK
        .captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

fn parse_date(captures: Option<regex::Captures<'_>>) -> Option<i64> {
    let text = captures?.get(1)?.as_str();
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

fn parse_work(html: &str, remote_id: u64) -> Result<ItemMetadata> {
    let title = TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| clean_text(m.as_str()))
        .ok_or_else(|| AppError::Remote(format!("Work {} page has no title", remote_id)))?;

    let mut authors: Vec<Author> = AUTHOR
        .captures_iter(html)
        .map(|c| Author {
            name: clean_text(&c[2]),
            uri: Some(c[1].to_string()),
        })
        .collect();
    authors.dedup();
    if authors.is_empty() {
        authors.push(Author {
            name: "Anonymous".to_string(),
            uri: None,
        });
    }

    let mut tags = Vec::new();
    for group in TAG_GROUP.captures_iter(html) {
        let kind = match &group[1] {
            "rating" => TagKind::Rating,
            "warning" => TagKind::Warning,
            "category" => TagKind::Category,
            "fandom" => TagKind::Fandom,
            "relationship" => TagKind::Relationship,
            "character" => TagKind::Character,
            _ => TagKind::Freeform,
        };
        tags.extend(TAG.captures_iter(&group[2]).map(|t| Tag {
            kind,
            name: clean_text(&t[1]),
        }));
    }

    let summary = SUMMARY
        .captures(html)
        .map(|c| clean_text(&c[1]))
        .filter(|s| !s.is_empty());

    let downloads = DOWNLOAD_MENU
        .captures(html)
        .map(|menu| {
            DOWNLOAD_LINK
                .captures_iter(&menu[1])
                .map(|c| clean_text(&c[1]))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    // Download links carry the last edit time as a cache buster.
    let edited = downloads
        .iter()
        .filter_map(|href| EDITED.captures(href)?.get(1)?.as_str().parse::<i64>().ok())
        .max();

    let images = CHAPTERS
        .captures(html)
        .map(|text| {
            IMAGE
                .captures_iter(&text[1])
                .map(|c| clean_text(&c[1]))
                .collect()
        })
        .unwrap_or_default();

    Ok(ItemMetadata {
        remote_id,
        title,
        authors,
        tags,
        language: LANGUAGE
            .captures(html)
            .map(|c| clean_text(&c[1]))
            .filter(|s| !s.is_empty()),
        summary,
        published: parse_date(PUBLISHED.captures(html)),
        updated: parse_date(STATUS.captures(html)),
        edited,
        downloads,
        images,
    })
}

/// Plain text of an HTML fragment with entities decoded, one line per block.
fn clean_text(html: &str) -> String {
    let text = html2text::config::plain_no_decorate()
        .string_from_read(html.as_bytes(), TEXT_WIDTH)
        .unwrap_or_else(|e| {
            tracing::debug!(error = %e, "HTML conversion failed, keeping raw text");
            html.to_string()
        });
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK_PAGE: &str = r##"
<dl class="work meta group">
  <dd class="rating tags"><ul class="commas"><li><a class="tag" href="/tags/Teen%20And%20Up%20Audiences/works">Teen And Up Audiences</a></li></ul></dd>
  <dd class="warning tags"><ul class="commas"><li><a class="tag" href="/tags/No%20Archive%20Warnings%20Apply/works">No Archive Warnings Apply</a></li></ul></dd>
  <dd class="fandom tags"><ul class="commas"><li><a class="tag" href="/tags/Good%20Omens/works">Good Omens</a></li></ul></dd>
  <dd class="relationship tags"><ul class="commas"><li><a class="tag" href="/tags/A*s*C/works">Aziraphale/Crowley</a></li></ul></dd>
  <dd class="freeform tags"><ul class="commas"><li><a class="tag" href="/tags/Fluff/works">Fluff</a></li><li><a class="tag" href="/tags/Tea%20&amp;%20Cake/works">Tea &amp; Cake</a></li></ul></dd>
  <dd class="language" lang="en">
    English
  </dd>
  <dd class="published">2023-04-01</dd>
  <dd class="status">2024-01-15</dd>
</dl>
<ul class="work navigation actions">
  <li class="download" aria-haspopup="true">
    <a href="#">Download</a>
    <ul class="expandable secondary">
      <li><a href="/downloads/4242/A_Title.epub?updated_at=1700000000">EPUB</a></li>
      <li><a href="/downloads/4242/A_Title.pdf?updated_at=1700000000">PDF</a></li>
    </ul>
  </li>
</ul>
<h2 class="title heading">
  A Title &amp; More
</h2>
<h3 class="byline heading"><a rel="author" href="/users/writer/pseuds/writer">writer</a></h3>
<div class="summary module" role="complementary">
  <h3 class="heading">Summary:</h3>
  <blockquote class="userstuff"><p>First line.</p><p>Second <i>line</i>.</p></blockquote>
</div>
<div id="chapters" role="article">
  <div class="userstuff"><p>Once upon a time.</p><p><img alt="map" src="https://example.org/map.png" /></p></div>
</div>
"##;

    #[test]
    fn parses_work_page() {
        let work = parse_work(WORK_PAGE, 4242).unwrap();
        assert_eq!(work.title, "A Title & More");
        assert_eq!(work.authors.len(), 1);
        assert_eq!(work.authors[0].name, "writer");
        assert_eq!(
            work.authors[0].uri.as_deref(),
            Some("/users/writer/pseuds/writer")
        );
        assert_eq!(work.rating(), Some("Teen And Up Audiences"));
        assert!(work.tags.contains(&Tag {
            kind: TagKind::Freeform,
            name: "Tea & Cake".to_string()
        }));
        assert!(work.tags.contains(&Tag {
            kind: TagKind::Relationship,
            name: "Aziraphale/Crowley".to_string()
        }));
        assert_eq!(work.language.as_deref(), Some("English"));
        assert_eq!(work.summary.as_deref(), Some("First line.\nSecond line."));
        assert_eq!(work.published, Some(1680307200));
        assert_eq!(work.updated, Some(1705276800));
        assert_eq!(work.downloads.len(), 2);
        assert!(work.downloads[0].ends_with(".epub?updated_at=1700000000"));
        assert_eq!(work.edited, Some(1700000000));
        assert_eq!(work.updated_at(), 1705276800);
        assert_eq!(work.images, vec!["https://example.org/map.png"]);
    }

    #[test]
    fn entities_are_decoded() {
        let html = r#"<h2 class="title heading">Don&#8217;t Panic</h2>
<h3 class="byline heading"><a rel="author" href="/users/k/pseuds/k">K&amp;R</a></h3>
<div class="summary module"><blockquote class="userstuff"><p>Tea&nbsp;time &hellip; &#8220;yes&#8221;</p></blockquote></div>"#;
        let work = parse_work(html, 3).unwrap();
        assert_eq!(work.title, "Don\u{2019}t Panic");
        assert_eq!(work.authors[0].name, "K&R");
        let summary = work.summary.unwrap();
        assert!(summary.starts_with("Tea"));
        assert!(summary.ends_with("time \u{2026} \u{201c}yes\u{201d}"));
        assert!(!summary.contains('&'));
    }

    #[test]
    fn edit_time_is_latest_download_stamp() {
        let html = r##"<h2 class="title heading">T</h2>
<li class="download"><a href="#">Download</a><ul>
<li><a href="/downloads/1/T.epub?updated_at=1700000000">EPUB</a></li>
<li><a href="/downloads/1/T.pdf?updated_at=1700000500">PDF</a></li>
</ul></li>
</ul>"##;
        let work = parse_work(html, 1).unwrap();
        assert_eq!(work.edited, Some(1700000500));
        assert!(work.images.is_empty());
    }

    #[test]
    fn anonymous_works_get_placeholder_author() {
        let html = r#"<h2 class="title heading">Untold</h2>"#;
        let work = parse_work(html, 1).unwrap();
        assert_eq!(work.authors[0].name, "Anonymous");
        assert!(work.authors[0].uri.is_none());
        assert!(work.downloads.is_empty());
    }

    #[test]
    fn missing_title_is_an_error() {
        assert!(parse_work("<html></html>", 1).is_err());
    }

    #[test]
    fn work_ids_ignore_chapter_links() {
        let html = r#"<a href="/works/11">A</a><a href="/works/11/chapters/5">A ch5</a><a href="/works/12">B</a>"#;
        assert_eq!(parse_work_ids(html), vec![11, 12]);
    }

    #[test]
    fn list_urls_per_kind() {
        let client = Ao3Client::new(&RemoteConfig::default()).unwrap();
        assert_eq!(
            client.list_url("me", CollectionKind::MarkedForLater, 2),
            "https://archiveofourown.org/users/me/readings?show=to-read&page=2"
        );
        assert_eq!(
            client.list_url("me", CollectionKind::Subscriptions, 1),
            "https://archiveofourown.org/users/me/subscriptions?type=works&page=1"
        );
    }
}
