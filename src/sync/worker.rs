use crate::config::DownloadFormat;
use crate::db::{Category, ItemLink, Person, Relation, RemoteAccount};
use crate::error::{AppError, Result};
use crate::opds::{REL_ACQUISITION, REL_IMAGE};
use crate::remote::{ItemMetadata, RemoteSession, TAG_SCHEME, tag_url};
use crate::sync::{FetchMode, SyncEngine};
use rusqlite::types::Value;

/// Publisher recorded for every work.
const PUBLISHER: &str = "Archive of Our Own";

/// What fetching one item did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The stored item was fresh; it was only linked.
    Linked,
    /// The stored item was refetched.
    Refreshed,
    /// The item was fetched and stored for the first time.
    Created,
}

impl SyncEngine {
    /// Fetch one work and link it to a collection.
    ///
    /// A known work is linked before anything is fetched, so the link survives
    /// a failing or rate-limited metadata fetch. A session the archive rejects
    /// is renewed once for the collection's account. Safe to run more than
    /// once.
    pub async fn fetch_item(
        &self,
        session: &RemoteSession,
        collection_id: i64,
        remote_id: u64,
        mode: FetchMode,
    ) -> Result<ItemOutcome> {
        let existing = self.db.get_item_by_remote_id(remote_id as i64)?;

        if let Some(item) = &existing {
            if self.db.link_item(collection_id, item.id)?.created() {
                self.db.invalidate_collection_content(collection_id)?;
            }
            if !mode.should_fetch(item.updated, self.sync.item_window()) {
                return Ok(ItemOutcome::Linked);
            }
        }

        let metadata = match self.load_remote(session, remote_id).await {
            Err(AppError::Authentication(reason)) => {
                tracing::info!(remote_id, reason = %reason, "Session rejected, logging in again");
                let account = self.collection_account(collection_id)?;
                let renewed = self.credentials().renew_session(&account, session).await?;
                self.load_remote(&renewed, remote_id).await
            }
            other => other,
        }
        .inspect_err(|e| {
            tracing::warn!(remote_id, collection_id, error = %e, "Work fetch failed")
        })?;

        let saved = self.db.upsert(
            "items",
            &item_fields(&metadata, remote_id),
            &["remote_id"],
            "id",
            Some("updated"),
        )?;
        self.store_dependents(saved.id, &metadata)?;

        if existing.is_none() {
            self.db.link_item(collection_id, saved.id)?;
        }
        for affected in self.db.collections_containing(saved.id)? {
            self.db.invalidate_collection_content(affected)?;
        }

        tracing::debug!(remote_id, item_id = saved.id, created = saved.created(), "Work stored");
        Ok(if saved.created() {
            ItemOutcome::Created
        } else {
            ItemOutcome::Refreshed
        })
    }

    async fn load_remote(&self, session: &RemoteSession, remote_id: u64) -> Result<ItemMetadata> {
        let remote = &self.remote;
        self.policy
            .run("load_item", move || remote.load_item(session, remote_id))
            .await
    }

    fn collection_account(&self, collection_id: i64) -> Result<RemoteAccount> {
        let collection = self
            .db
            .get_collection(collection_id)?
            .ok_or_else(|| AppError::NotFound(format!("Collection {}", collection_id)))?;
        self.db
            .get_account(collection.account_id)?
            .ok_or_else(|| AppError::NotFound(format!("Account {}", collection.account_id)))
    }

    /// Upsert authors, tags and download links and point the item's join rows
    /// at exactly that set.
    fn store_dependents(&self, item_id: i64, metadata: &ItemMetadata) -> Result<()> {
        let mut keep = Vec::new();
        for author in &metadata.authors {
            let person_id = self.db.save_person(&Person {
                name: author.name.clone(),
                uri: author.uri.clone().unwrap_or_default(),
                email: String::new(),
            })?;
            self.db.relate(Relation::Authors, item_id, person_id)?;
            keep.push(person_id);
        }
        self.db.prune_relations(Relation::Authors, item_id, &keep)?;

        let mut keep = Vec::new();
        for tag in &metadata.tags {
            let category_id = self.db.save_category(&Category {
                term: tag_url(&self.remote_base, &tag.name),
                scheme: format!("{}#{}", TAG_SCHEME, tag.kind.as_str()),
                label: tag.name.clone(),
            })?;
            self.db.relate(Relation::Categories, item_id, category_id)?;
            keep.push(category_id);
        }
        self.db.prune_relations(Relation::Categories, item_id, &keep)?;

        let mut keep = Vec::new();
        let links = self
            .acquisition_links(metadata)
            .into_iter()
            .chain(image_links(metadata));
        for link in links {
            let link_id = self.db.save_link(&link)?;
            self.db.relate(Relation::Links, item_id, link_id)?;
            keep.push(link_id);
        }
        self.db.prune_relations(Relation::Links, item_id, &keep)?;

        Ok(())
    }

    fn acquisition_links(&self, metadata: &ItemMetadata) -> Vec<ItemLink> {
        metadata
            .downloads
            .iter()
            .filter_map(|href| {
                let format = DownloadFormat::from_url(href);
                if format.is_some_and(|f| !self.formats.contains(&f)) {
                    return None;
                }
                Some(ItemLink {
                    href: href.clone(),
                    rel: REL_ACQUISITION.to_string(),
                    link_type: format.map(|f| f.mime_type()).unwrap_or_default().to_string(),
                    title: Some(match format {
                        Some(f) => format!("Download {}", f.label()),
                        None => "Download".to_string(),
                    }),
                })
            })
            .collect()
    }
}

fn image_links(metadata: &ItemMetadata) -> impl Iterator<Item = ItemLink> + '_ {
    metadata.images.iter().map(|href| ItemLink {
        href: href.clone(),
        rel: REL_IMAGE.to_string(),
        link_type: image_type(href).unwrap_or_default().to_string(),
        title: None,
    })
}

fn image_type(href: &str) -> Option<&'static str> {
    let path = href.split(['?', '#']).next()?;
    let (_, ext) = path.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn item_fields(metadata: &ItemMetadata, remote_id: u64) -> Vec<(&'static str, Value)> {
    vec![
        ("remote_id", Value::Integer(remote_id as i64)),
        ("title", Value::Text(metadata.title.clone())),
        ("updated_at", Value::Integer(metadata.updated_at())),
        ("published_at", metadata.published.map_or(Value::Null, Value::Integer)),
        ("language", text(metadata.language.as_deref())),
        ("publisher", Value::Text(PUBLISHER.to_string())),
        ("summary", text(metadata.summary.as_deref())),
        ("rating", text(metadata.rating())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_types_follow_the_extension() {
        assert_eq!(image_type("https://i.example.org/a/map.PNG"), Some("image/png"));
        assert_eq!(image_type("https://i.example.org/b.jpeg?w=200"), Some("image/jpeg"));
        assert_eq!(image_type("https://i.example.org/render"), None);
    }
}
