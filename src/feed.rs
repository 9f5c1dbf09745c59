//! Assembles stored collections into OPDS documents.

use crate::config::Config;
use crate::db::{Collection, Database, FeedItem, timestamp_to_datetime};
use crate::error::Result;
use crate::opds::{self, FeedBuilder};
use crate::remote::work_url;

/// Render a collection from the database.
pub fn render_collection(
    db: &Database,
    config: &Config,
    collection: &Collection,
    owner: &str,
) -> Result<String> {
    let items = db.feed_items(collection.id)?;
    let kind = collection.kind;

    let mut builder = FeedBuilder::new(
        format!("{}/{}", config.feed.id_base, kind.slug()),
        format!("{}'s AO3 {} list", owner, kind.title()),
    )
    .author(opds::Author {
        name: config.feed.author_name.clone(),
        uri: config.feed.author_uri.clone(),
        email: config.feed.author_email.clone(),
    });

    if let Some(newest) = items.iter().map(|i| i.item.updated_at).max() {
        builder = builder.updated(timestamp_to_datetime(newest));
    }
    if !config.server.base_url.is_empty() {
        builder = builder.self_link(format!(
            "{}/feed/{}",
            config.server.base_url.trim_end_matches('/'),
            kind.slug()
        ));
    }

    for item in &items {
        builder = builder.entry(entry(&config.remote.base_url, item));
    }

    Ok(builder.build())
}

/// Cached document of a collection, rendering and caching it when missing.
///
/// The rendered document is not cached when the collection changed after
/// `collection` was read.
pub fn cached_or_render(
    db: &Database,
    config: &Config,
    collection: &Collection,
    owner: &str,
) -> Result<String> {
    if let Some(content) = &collection.content {
        return Ok(content.clone());
    }

    let content = render_collection(db, config, collection, owner)?;
    let cached = db.store_collection_content(collection, &content)?;
    tracing::debug!(collection_id = collection.id, cached, "Rendered feed");
    Ok(content)
}

fn entry(remote_base: &str, feed_item: &FeedItem) -> opds::Entry {
    let item = &feed_item.item;
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    opds::Entry {
        id: work_url(remote_base, item.remote_id),
        title: item.title.clone(),
        updated: timestamp_to_datetime(item.updated_at),
        published: item.published_at.map(timestamp_to_datetime),
        authors: feed_item
            .authors
            .iter()
            .map(|p| opds::Author {
                name: p.name.clone(),
                uri: non_empty(&p.uri),
                email: non_empty(&p.email),
            })
            .collect(),
        summary: item.summary.clone(),
        language: item.language.clone(),
        publisher: item.publisher.clone(),
        links: feed_item
            .links
            .iter()
            .map(|l| opds::Link {
                rel: l.rel.clone(),
                href: l.href.clone(),
                link_type: l.link_type.clone(),
                title: l.title.clone(),
            })
            .collect(),
        categories: feed_item
            .categories
            .iter()
            .map(|c| opds::Category {
                term: c.term.clone(),
                scheme: non_empty(&c.scheme),
                label: Some(c.label.clone()),
            })
            .collect(),
    }
}
