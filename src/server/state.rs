//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::{Config, RefreshMode};
use crate::db::{Collection, CollectionKind, Database, RemoteAccount, User, is_stale};
use crate::error::{AppError, Result};
use crate::feed;
use crate::remote::RemoteSite;
use crate::sync::{Dispatcher, Job, JobQueue, Priority, SyncEngine};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Sync engine, also the runner of queued jobs.
    pub engine: Arc<SyncEngine>,
    /// Background job queue.
    pub queue: Arc<JobQueue>,
}

impl AppState {
    /// Create application state. The queue is only fed here; serving it is
    /// up to the caller.
    pub fn new(
        config: Config,
        db: Database,
        remote: Arc<dyn RemoteSite>,
        queue: Arc<JobQueue>,
    ) -> Self {
        let auth = AuthService::new(
            db.clone(),
            config.auth.session_days,
            config.auth.registration_enabled(),
        );
        let engine = SyncEngine::new(db.clone(), remote, &config);

        Self {
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
            engine: Arc::new(engine),
            queue,
        }
    }

    /// AO3 account of a local user.
    pub fn account_for(&self, user: &User) -> Result<RemoteAccount> {
        self.db
            .get_account_by_user(&user.id)?
            .ok_or_else(|| AppError::NotFound("No AO3 account configured".to_string()))
    }

    /// Feed document of `kind` for a local user.
    pub async fn user_feed(&self, user: &User, kind: CollectionKind) -> Result<String> {
        let account = self.account_for(user)?;
        let collection = self.db.get_or_create_collection(account.id, kind)?;
        self.serve_collection(&account, collection).await
    }

    /// Feed document behind a share key.
    pub async fn shared_feed(&self, share_key: &str) -> Result<String> {
        let collection = self
            .db
            .get_shared_collection(share_key)?
            .ok_or_else(|| AppError::NotFound("Unknown share link".to_string()))?;
        let account = self
            .db
            .get_account(collection.account_id)?
            .ok_or_else(|| AppError::NotFound("Unknown share link".to_string()))?;
        self.serve_collection(&account, collection).await
    }

    /// Refresh a stale collection per `sync.refresh_mode`, then serve the
    /// cached document or render it.
    ///
    /// A failing refresh is logged; whatever is stored is still served.
    async fn serve_collection(
        &self,
        account: &RemoteAccount,
        collection: Collection,
    ) -> Result<String> {
        let mut collection = collection;

        if is_stale(collection.updated, self.config.sync.collection_window()) {
            match self.config.sync.refresh_mode {
                RefreshMode::Inline => {
                    let modes = self.engine.default_modes();
                    if let Err(e) = self
                        .engine
                        .refresh_collection(account, collection.kind, modes)
                        .await
                    {
                        tracing::warn!(
                            collection_id = collection.id,
                            error = %e,
                            "Inline refresh failed, serving stored feed"
                        );
                    }
                    if let Some(fresh) = self.db.get_collection(collection.id)? {
                        collection = fresh;
                    }
                }
                RefreshMode::Queued => {
                    if let Err(e) = self.queue_refresh(account, collection.kind).await {
                        tracing::warn!(
                            collection_id = collection.id,
                            error = %e,
                            "Could not queue refresh"
                        );
                    }
                }
            }
        }

        feed::cached_or_render(&self.db, &self.config, &collection, &account.username)
    }

    async fn queue_refresh(&self, account: &RemoteAccount, kind: CollectionKind) -> Result<()> {
        let session = self.engine.credentials().get_session(account, false).await?;
        self.queue.dispatch(
            Job::SyncCollection {
                account_id: account.id,
                kind,
                session: session.to_token()?,
                modes: self.engine.default_modes(),
            },
            Priority::High,
        )
    }
}
