use crate::config::{Config, DownloadFormat, SyncConfig};
use crate::credentials::CredentialStore;
use crate::db::{CollectionKind, Database, RemoteAccount};
use crate::error::{AppError, Result};
use crate::remote::{RemoteSession, RemoteSite, RetryPolicy};
use crate::sync::{Dispatcher, FetchModes, Job, JobBuffer, JobRunner, Priority, reconcile};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// What a collection sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Collection row.
    pub collection_id: i64,
    /// Whether the remote listing was fetched.
    pub listed: bool,
    /// Entries removed because the work left the list.
    pub removed: usize,
    /// Entries still on the list.
    pub confirmed: usize,
    /// Item fetch jobs dispatched.
    pub dispatched: usize,
}

/// Result of draining a [`JobBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs that succeeded.
    pub completed: usize,
    /// Jobs that failed; failures are logged and skipped.
    pub failed: usize,
}

/// Keeps collections in step with the archive.
pub struct SyncEngine {
    pub(super) db: Database,
    pub(super) remote: Arc<dyn RemoteSite>,
    pub(super) policy: RetryPolicy,
    pub(super) sync: SyncConfig,
    pub(super) remote_base: String,
    pub(super) formats: Vec<DownloadFormat>,
    credentials: CredentialStore,
}

impl SyncEngine {
    /// Create an engine over `db` and `remote`.
    pub fn new(db: Database, remote: Arc<dyn RemoteSite>, config: &Config) -> Self {
        let policy = RetryPolicy::from(&config.remote);
        let credentials = CredentialStore::new(
            db.clone(),
            Arc::clone(&remote),
            policy,
            config.sync.session_refresh(),
        );

        Self {
            db,
            remote,
            policy,
            sync: config.sync.clone(),
            remote_base: config.remote.base_url.clone(),
            formats: config.feed.formats.clone(),
            credentials,
        }
    }

    /// Credential store sharing this engine's database and remote.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Default fetch modes from configuration.
    pub fn default_modes(&self) -> FetchModes {
        FetchModes::from(&self.sync)
    }

    /// Bring one collection up to date with its remote listing.
    ///
    /// A fresh collection is left alone unless the feed mode is FORCE. When the
    /// listing fails the error is returned and the collection stays stale.
    pub async fn sync_collection(
        &self,
        account: &RemoteAccount,
        kind: CollectionKind,
        session: &RemoteSession,
        modes: FetchModes,
        dispatcher: &dyn Dispatcher,
        priority: Priority,
    ) -> Result<SyncOutcome> {
        let collection = self.db.get_or_create_collection(account.id, kind)?;
        let mut outcome = SyncOutcome {
            collection_id: collection.id,
            ..Default::default()
        };

        if !modes
            .feed
            .should_fetch(collection.updated, self.sync.collection_window())
        {
            tracing::debug!(collection_id = collection.id, kind = %kind, "Collection is fresh");
            return Ok(outcome);
        }

        let max_pages = match kind {
            CollectionKind::History => self.sync.history_max_pages,
            _ => self.sync.max_pages,
        };
        let mut session = session.clone();
        let listing = match self.list_remote(&session, kind, max_pages).await {
            Err(AppError::Authentication(reason)) => {
                tracing::info!(
                    account_id = account.id,
                    reason = %reason,
                    "Session rejected, logging in again"
                );
                match self.credentials.renew_session(account, &session).await {
                    Ok(renewed) => {
                        session = renewed;
                        self.list_remote(&session, kind, max_pages).await
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        };
        let remote_ids: Vec<i64> = match listing {
            Ok(ids) => ids.into_iter().map(|id| id as i64).collect(),
            Err(e) => {
                tracing::warn!(
                    collection_id = collection.id,
                    kind = %kind,
                    error = %e,
                    "Listing failed, collection left stale"
                );
                return Err(e);
            }
        };
        outcome.listed = true;

        let entries = self.db.collection_entries(collection.id)?;
        let diff = reconcile(&remote_ids, entries, |e| e.remote_id);

        let gone: Vec<i64> = diff.unmatched_local.iter().map(|e| e.entry_id).collect();
        outcome.removed = self.db.delete_entries(&gone)?;

        let token = session.to_token()?;
        let fetch = |remote_id: i64| Job::FetchItem {
            session: token.clone(),
            collection_id: collection.id,
            remote_id: remote_id as u64,
            mode: modes.work,
        };

        for (entry, remote_id) in &diff.matched {
            self.db.link_item(collection.id, entry.item_id)?;
            outcome.confirmed += 1;
            if modes
                .work
                .should_fetch(entry.item_updated, self.sync.item_window())
            {
                dispatcher.dispatch(fetch(*remote_id), priority)?;
                outcome.dispatched += 1;
            }
        }

        for remote_id in &diff.unmatched_remote {
            dispatcher.dispatch(fetch(*remote_id), priority)?;
            outcome.dispatched += 1;
        }

        self.db.stamp_collection(&collection)?;

        tracing::info!(
            collection_id = collection.id,
            kind = %kind,
            listed = remote_ids.len(),
            removed = outcome.removed,
            dispatched = outcome.dispatched,
            "Collection synced"
        );
        Ok(outcome)
    }

    /// Read a reading list page by page until a page adds no new ids or
    /// `max_pages` is reached. Each page request gets its own timeout and
    /// rate-limit backoff.
    async fn list_remote(
        &self,
        session: &RemoteSession,
        kind: CollectionKind,
        max_pages: u32,
    ) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();

        for page in 1..=max_pages.max(1) {
            let remote = &self.remote;
            let fresh: Vec<u64> = self
                .policy
                .run("list_page", move || remote.list_page(session, kind, page))
                .await?
                .into_iter()
                .filter(|id| seen.insert(*id))
                .collect();
            if fresh.is_empty() {
                break;
            }
            ids.extend(fresh);
        }

        Ok(ids)
    }

    /// Queue a sync of every collection of a user's account.
    ///
    /// Skipped while the account was fanned out within the account window,
    /// unless the user mode says otherwise. Returns the number of collection
    /// jobs dispatched.
    pub async fn sync_account(
        &self,
        user_id: &str,
        modes: FetchModes,
        dispatcher: &dyn Dispatcher,
        priority: Priority,
    ) -> Result<usize> {
        let account = self
            .db
            .get_account_by_user(user_id)?
            .ok_or_else(|| AppError::NotFound("No AO3 account configured".to_string()))?;

        if !modes
            .user
            .should_fetch(account.synced, self.sync.account_window())
        {
            tracing::debug!(account_id = account.id, "Account is fresh");
            return Ok(0);
        }

        let session = self.credentials.get_session(&account, false).await?;
        let token = session.to_token()?;
        for kind in CollectionKind::ALL {
            dispatcher.dispatch(
                Job::SyncCollection {
                    account_id: account.id,
                    kind,
                    session: token.clone(),
                    modes,
                },
                priority,
            )?;
        }
        self.db.mark_account_synced(&account)?;

        tracing::info!(account_id = account.id, ?priority, "Account sync queued");
        Ok(CollectionKind::ALL.len())
    }

    /// Sync one collection and run its item fetches before returning.
    pub async fn refresh_collection(
        &self,
        account: &RemoteAccount,
        kind: CollectionKind,
        modes: FetchModes,
    ) -> Result<SyncOutcome> {
        let session = self.credentials.get_session(account, false).await?;
        let buffer = JobBuffer::new();
        let outcome = self
            .sync_collection(account, kind, &session, modes, &buffer, Priority::High)
            .await?;
        self.drain(&buffer).await;
        Ok(outcome)
    }

    /// Run buffered jobs, and the jobs they dispatch, until none are left.
    ///
    /// A failing job never stops the others.
    pub async fn drain(&self, buffer: &JobBuffer) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some((job, priority)) = buffer.pop() {
            let name = job.name();
            match self.run(job, priority, buffer).await {
                Ok(()) => report.completed += 1,
                Err(e) => {
                    tracing::warn!(job = name, error = %e, "Job failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[async_trait]
impl JobRunner for SyncEngine {
    async fn run(&self, job: Job, priority: Priority, dispatcher: &dyn Dispatcher) -> Result<()> {
        match job {
            Job::SyncAccount { user_id, modes } => {
                self.sync_account(&user_id, modes, dispatcher, priority)
                    .await?;
            }
            Job::SyncCollection {
                account_id,
                kind,
                session,
                modes,
            } => {
                let account = self
                    .db
                    .get_account(account_id)?
                    .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))?;
                let session = RemoteSession::from_token(&session)?;
                self.sync_collection(&account, kind, &session, modes, dispatcher, priority)
                    .await?;
            }
            Job::FetchItem {
                session,
                collection_id,
                remote_id,
                mode,
            } => {
                let session = RemoteSession::from_token(&session)?;
                self.fetch_item(&session, collection_id, remote_id, mode)
                    .await?;
            }
        }
        Ok(())
    }
}
