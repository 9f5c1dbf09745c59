//! AO3 credentials and cached sessions.

use crate::db::{CollectionKind, Database, RemoteAccount, is_stale};
use crate::error::{AppError, Result};
use crate::remote::{RemoteSession, RemoteSite, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Result of storing credentials.
#[derive(Debug, Clone)]
pub struct CredentialUpdate {
    /// The stored account.
    pub account: RemoteAccount,
    /// Session created while verifying the credentials.
    pub session: RemoteSession,
    /// Whether an existing account switched to a different AO3 username.
    pub username_changed: bool,
}

/// Persists AO3 credentials and hands out authenticated sessions.
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    remote: Arc<dyn RemoteSite>,
    policy: RetryPolicy,
    session_refresh: Duration,
}

impl CredentialStore {
    /// Create a credential store.
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteSite>,
        policy: RetryPolicy,
        session_refresh: Duration,
    ) -> Self {
        Self {
            db,
            remote,
            policy,
            session_refresh,
        }
    }

    /// Verify credentials against the archive and store them for `user_id`.
    ///
    /// Nothing is written when authentication fails. On success one collection
    /// per list kind exists for the account, new ones marked stale. Switching
    /// to another AO3 username marks every collection stale so the next sync
    /// lists them again; stored entries stay until then.
    pub async fn set_credentials(
        &self,
        user_id: &str,
        username: &str,
        password: &str,
    ) -> Result<CredentialUpdate> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(AppError::InvalidInput(
                "AO3 username and password are required".to_string(),
            ));
        }

        let session = self.authenticate(username, password).await?;
        let previous = self.db.get_account_by_user(user_id)?;
        let username_changed = previous.is_some_and(|a| a.username != username);

        let saved = self
            .db
            .save_account(user_id, username, password, &session.to_token()?)?;
        let account = self
            .db
            .get_account(saved.id)?
            .ok_or_else(|| AppError::Internal(format!("Account {} vanished", saved.id)))?;

        for kind in CollectionKind::ALL {
            self.db.get_or_create_collection(account.id, kind)?;
        }
        if username_changed {
            self.db.mark_account_stale(account.id)?;
        }

        tracing::info!(
            user_id,
            account_id = account.id,
            created = saved.created(),
            username_changed,
            "Stored AO3 credentials"
        );

        Ok(CredentialUpdate {
            account,
            session,
            username_changed,
        })
    }

    /// Session for `account`, re-authenticating when the stored one is too old,
    /// unreadable or `force_refresh` is set.
    pub async fn get_session(
        &self,
        account: &RemoteAccount,
        force_refresh: bool,
    ) -> Result<RemoteSession> {
        if !force_refresh
            && !is_stale(account.updated, self.session_refresh)
            && let Some(token) = &account.session
        {
            match RemoteSession::from_token(token) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!(account_id = account.id, error = %e, "Discarding stored session")
                }
            }
        }

        let session = self
            .authenticate(&account.username, &account.password)
            .await?;
        self.db
            .save_account_session(account, &session.to_token()?)?;
        tracing::debug!(account_id = account.id, "Refreshed AO3 session");
        Ok(session)
    }

    /// Replace a session the archive rejected.
    ///
    /// When the stored session already differs from `rejected`, another job
    /// renewed it and it is returned as is. Otherwise this logs in again.
    pub async fn renew_session(
        &self,
        account: &RemoteAccount,
        rejected: &RemoteSession,
    ) -> Result<RemoteSession> {
        let current = self
            .db
            .get_account(account.id)?
            .ok_or_else(|| AppError::NotFound(format!("Account {}", account.id)))?;

        if let Some(token) = &current.session
            && *token != rejected.to_token()?
            && let Ok(session) = RemoteSession::from_token(token)
        {
            return Ok(session);
        }
        self.get_session(&current, true).await
    }

    /// Remove an account. Its collections and entries go with it; items stay.
    pub fn delete_credentials(&self, account: &RemoteAccount) -> Result<()> {
        if !self.db.delete_account(account.id)? {
            return Err(AppError::NotFound(format!("Account {}", account.id)));
        }
        tracing::info!(account_id = account.id, "Deleted AO3 credentials");
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<RemoteSession> {
        let remote = &self.remote;
        self.policy
            .run("authenticate", move || remote.authenticate(username, password))
            .await
    }
}
