//! OPDS catalog generation.

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Link relation of download links.
pub const REL_ACQUISITION: &str = "http://opds-spec.org/acquisition";
/// Link relation of images.
pub const REL_IMAGE: &str = "http://opds-spec.org/image";
/// MIME type of acquisition feeds.
pub const ACQUISITION_FEED_TYPE: &str = "application/atom+xml;profile=opds-catalog;kind=acquisition";

/// OPDS feed link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// Link relation type (e.g., "self", "http://opds-spec.org/acquisition").
    pub rel: String,
    /// URL of the linked resource.
    pub href: String,
    /// MIME type of the linked resource; omitted when empty.
    pub link_type: String,
    /// Optional title for the link.
    pub title: Option<String>,
}

/// Atom person construct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    /// Name.
    pub name: String,
    /// Profile URL.
    pub uri: Option<String>,
    /// Email address.
    pub email: Option<String>,
}

/// Atom category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    /// Machine-readable term.
    pub term: String,
    /// Scheme the term belongs to.
    pub scheme: Option<String>,
    /// Human-readable label.
    pub label: Option<String>,
}

/// OPDS feed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier for the entry.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Last update timestamp.
    pub updated: DateTime<Utc>,
    /// First publication timestamp.
    pub published: Option<DateTime<Utc>>,
    /// Authors list.
    pub authors: Vec<Author>,
    /// Short summary text.
    pub summary: Option<String>,
    /// Dublin Core language.
    pub language: Option<String>,
    /// Dublin Core publisher.
    pub publisher: Option<String>,
    /// Links associated with this entry.
    pub links: Vec<Link>,
    /// Categories/tags.
    pub categories: Vec<Category>,
}

/// OPDS feed builder.
pub struct FeedBuilder {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    author: Option<Author>,
    links: Vec<Link>,
    entries: Vec<Entry>,
}

impl FeedBuilder {
    /// Create a new feed builder.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            updated: Utc::now(),
            author: None,
            links: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Set the feed author.
    pub fn author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }

    /// Override the feed update time.
    pub fn updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = updated;
        self
    }

    /// Add a self link.
    pub fn self_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link {
            rel: "self".to_string(),
            href: href.into(),
            link_type: ACQUISITION_FEED_TYPE.to_string(),
            title: None,
        });
        self
    }

    /// Add an entry.
    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Build the XML feed.
    pub fn build(self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        // XML declaration - writing to Vec can't fail
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

        let mut feed = BytesStart::new("feed");
        feed.push_attribute(("xmlns", "http://www.w3.org/2005/Atom"));
        feed.push_attribute(("xmlns:opds", "http://opds-spec.org/2010/catalog"));
        feed.push_attribute(("xmlns:dc", "http://purl.org/dc/terms/"));
        let _ = writer.write_event(Event::Start(feed));

        write_text_element(&mut writer, "id", &self.id);
        write_text_element(&mut writer, "title", &self.title);
        write_text_element(&mut writer, "updated", &self.updated.to_rfc3339());

        if let Some(author) = &self.author {
            write_author(&mut writer, author);
        }

        for link in &self.links {
            write_link(&mut writer, link);
        }

        for entry in &self.entries {
            write_entry(&mut writer, entry);
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("feed")));

        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

/// Write a simple text element.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    let _ = writer.write_event(Event::Start(BytesStart::new(name)));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

fn write_author<W: std::io::Write>(writer: &mut Writer<W>, author: &Author) {
    let _ = writer.write_event(Event::Start(BytesStart::new("author")));
    write_text_element(writer, "name", &author.name);
    if let Some(uri) = &author.uri {
        write_text_element(writer, "uri", uri);
    }
    if let Some(email) = &author.email {
        write_text_element(writer, "email", email);
    }
    let _ = writer.write_event(Event::End(BytesEnd::new("author")));
}

/// Write a link element.
fn write_link<W: std::io::Write>(writer: &mut Writer<W>, link: &Link) {
    let mut elem = BytesStart::new("link");
    elem.push_attribute(("rel", link.rel.as_str()));
    elem.push_attribute(("href", link.href.as_str()));
    if !link.link_type.is_empty() {
        elem.push_attribute(("type", link.link_type.as_str()));
    }
    if let Some(title) = &link.title {
        elem.push_attribute(("title", title.as_str()));
    }
    let _ = writer.write_event(Event::Empty(elem));
}

/// Write an entry element.
fn write_entry<W: std::io::Write>(writer: &mut Writer<W>, entry: &Entry) {
    let _ = writer.write_event(Event::Start(BytesStart::new("entry")));

    write_text_element(writer, "id", &entry.id);
    write_text_element(writer, "title", &entry.title);
    write_text_element(writer, "updated", &entry.updated.to_rfc3339());
    if let Some(published) = &entry.published {
        write_text_element(writer, "published", &published.to_rfc3339());
    }

    for author in &entry.authors {
        write_author(writer, author);
    }

    if let Some(language) = &entry.language {
        write_text_element(writer, "dc:language", language);
    }
    if let Some(publisher) = &entry.publisher {
        write_text_element(writer, "dc:publisher", publisher);
    }

    if let Some(summary) = &entry.summary {
        let mut elem = BytesStart::new("summary");
        elem.push_attribute(("type", "text"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(summary)));
        let _ = writer.write_event(Event::End(BytesEnd::new("summary")));
    }

    for category in &entry.categories {
        let mut elem = BytesStart::new("category");
        elem.push_attribute(("term", category.term.as_str()));
        if let Some(scheme) = &category.scheme {
            elem.push_attribute(("scheme", scheme.as_str()));
        }
        if let Some(label) = &category.label {
            elem.push_attribute(("label", label.as_str()));
        }
        let _ = writer.write_event(Event::Empty(elem));
    }

    for link in &entry.links {
        write_link(writer, link);
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("entry")));
}
