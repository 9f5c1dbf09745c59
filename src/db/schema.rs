use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Join tables between items and their dependent entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// item_authors -> persons
    Authors,
    /// item_categories -> categories
    Categories,
    /// item_links -> links
    Links,
}

impl Relation {
    fn table(&self) -> &'static str {
        match self {
            Relation::Authors => "item_authors",
            Relation::Categories => "item_categories",
            Relation::Links => "item_links",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Relation::Authors => "person_id",
            Relation::Categories => "category_id",
            Relation::Links => "link_id",
        }
    }
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    pub(super) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Database(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(10))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Local users
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Local login sessions
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- AO3 credentials, one per local user
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                session TEXT,
                updated INTEGER NOT NULL DEFAULT 0,
                synced INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Cached feeds, one per (account, kind)
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT,
                content_version INTEGER NOT NULL DEFAULT 0,
                updated INTEGER NOT NULL DEFAULT 0,
                share_enabled INTEGER NOT NULL DEFAULT 0,
                share_key TEXT UNIQUE,
                UNIQUE (account_id, kind),
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            -- AO3 works, shared across collections
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id INTEGER UNIQUE NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0,
                published_at INTEGER,
                language TEXT,
                publisher TEXT,
                summary TEXT,
                rating TEXT,
                updated INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS collection_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                updated INTEGER NOT NULL DEFAULT 0,
                UNIQUE (collection_id, item_id),
                FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS persons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                uri TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                updated INTEGER NOT NULL DEFAULT 0,
                UNIQUE (name, uri, email)
            );

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                term TEXT NOT NULL,
                scheme TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL DEFAULT '',
                updated INTEGER NOT NULL DEFAULT 0,
                UNIQUE (term, scheme, label)
            );

            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                href TEXT NOT NULL,
                rel TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL DEFAULT '',
                title TEXT,
                updated INTEGER NOT NULL DEFAULT 0,
                UNIQUE (href, rel, type)
            );

            CREATE TABLE IF NOT EXISTS item_authors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL,
                person_id INTEGER NOT NULL,
                UNIQUE (item_id, person_id),
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
                FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS item_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL,
                category_id INTEGER NOT NULL,
                UNIQUE (item_id, category_id),
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
                FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS item_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL,
                link_id INTEGER NOT NULL,
                UNIQUE (item_id, link_id),
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
                FOREIGN KEY (link_id) REFERENCES links(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            CREATE INDEX IF NOT EXISTS idx_entries_collection ON collection_entries(collection_id);
            CREATE INDEX IF NOT EXISTS idx_entries_item ON collection_entries(item_id);
            "#,
        )
        .map_err(|e| AppError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, display_name, role, created_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.username,
                user.password_hash,
                user.display_name,
                user.role,
                user.created_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidInput(format!("Username '{}' already exists", user.username))
            } else {
                AppError::Database(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash, display_name, role, created_at, last_login
             FROM users WHERE username = ?1",
            params![username],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash, display_name, role, created_at, last_login
             FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, username, password_hash, display_name, role, created_at, last_login
                 FROM users ORDER BY username",
            )
            .map_err(|e| AppError::Database(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Database(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            display_name: row.get(3)?,
            role: row.get(4)?,
            created_at: row.get(5)?,
            last_login: row.get(6)?,
        })
    }

    /// Update user password.
    pub fn update_user_password(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                params![password_hash, username],
            )
            .map_err(|e| AppError::Database(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Database(format!("Failed to update last login: {}", e)))?;
        Ok(())
    }

    /// Delete user (cascades to the AO3 account and its feeds).
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])
            .map_err(|e| AppError::Database(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== LOGIN SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &LoginSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, device_id, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token,
                session.user_id,
                session.device_id,
                session.expires_at,
            ],
        )
        .map_err(|e| AppError::Database(format!("Failed to create session: {}", e)))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<LoginSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, device_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(LoginSession {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    device_id: row.get(2)?,
                    expires_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get session: {}", e)))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(|e| AppError::Database(format!("Failed to delete session: {}", e)))?;
        Ok(())
    }

    /// Cleanup expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                params![now_timestamp()],
            )
            .map_err(|e| AppError::Database(format!("Failed to cleanup sessions: {}", e)))?;
        Ok(rows)
    }

    // ========== ACCOUNT OPERATIONS ==========

    /// Insert or update the AO3 account of a local user, stamping `updated`.
    pub fn save_account(
        &self,
        user_id: &str,
        username: &str,
        password: &str,
        session: &str,
    ) -> Result<UpsertResult> {
        self.upsert(
            "accounts",
            &[
                ("user_id", Value::Text(user_id.to_string())),
                ("username", Value::Text(username.to_string())),
                ("password", Value::Text(password.to_string())),
                ("session", Value::Text(session.to_string())),
            ],
            &["user_id"],
            "id",
            Some("updated"),
        )
    }

    /// Replace the stored session token, stamping `updated`.
    pub fn save_account_session(&self, account: &RemoteAccount, session: &str) -> Result<()> {
        self.upsert(
            "accounts",
            &[
                ("user_id", Value::Text(account.user_id.clone())),
                ("session", Value::Text(session.to_string())),
            ],
            &["user_id"],
            "id",
            Some("updated"),
        )?;
        Ok(())
    }

    /// Record an account-wide feed fan-out.
    pub fn mark_account_synced(&self, account: &RemoteAccount) -> Result<()> {
        self.upsert(
            "accounts",
            &[
                ("user_id", Value::Text(account.user_id.clone())),
                ("synced", Value::Integer(now_timestamp())),
            ],
            &["user_id"],
            "id",
            None,
        )?;
        Ok(())
    }

    /// Get the AO3 account of a local user.
    pub fn get_account_by_user(&self, user_id: &str) -> Result<Option<RemoteAccount>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, username, password, session, updated, synced
             FROM accounts WHERE user_id = ?1",
            params![user_id],
            Self::row_to_account,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get account: {}", e)))
    }

    /// Get an account by ID.
    pub fn get_account(&self, id: i64) -> Result<Option<RemoteAccount>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, username, password, session, updated, synced
             FROM accounts WHERE id = ?1",
            params![id],
            Self::row_to_account,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get account: {}", e)))
    }

    /// List all accounts.
    pub fn list_accounts(&self) -> Result<Vec<RemoteAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, username, password, session, updated, synced
             FROM accounts ORDER BY id",
        )?;
        let accounts = stmt
            .query_map([], Self::row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteAccount> {
        Ok(RemoteAccount {
            id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            password: row.get(3)?,
            session: row.get(4)?,
            updated: row.get(5)?,
            synced: row.get(6)?,
        })
    }

    /// Delete an account; its collections and entries cascade.
    pub fn delete_account(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|e| AppError::Database(format!("Failed to delete account: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== COLLECTION OPERATIONS ==========

    /// Resolve the collection for (account, kind), creating it stale if missing.
    pub fn get_or_create_collection(
        &self,
        account_id: i64,
        kind: CollectionKind,
    ) -> Result<Collection> {
        let result = self.upsert(
            "collections",
            &Self::collection_key(account_id, kind),
            &["account_id", "kind"],
            "id",
            None,
        )?;
        self.get_collection(result.id)?
            .ok_or_else(|| AppError::NotFound(format!("Collection {} vanished", result.id)))
    }

    fn collection_key(account_id: i64, kind: CollectionKind) -> Vec<(&'static str, Value)> {
        vec![
            ("account_id", Value::Integer(account_id)),
            ("kind", Value::Text(kind.as_str().to_string())),
        ]
    }

    /// Mark a collection as freshly listed and drop its cached document.
    pub fn stamp_collection(&self, collection: &Collection) -> Result<()> {
        let saved = self.upsert(
            "collections",
            &Self::collection_key(collection.account_id, collection.kind),
            &["account_id", "kind"],
            "id",
            Some("updated"),
        )?;
        self.invalidate_collection_content(saved.id)
    }

    /// Cache a document rendered from `collection`.
    ///
    /// Only stored while the cache is still empty and has not been invalidated
    /// since `collection` was read. Returns whether the document was stored.
    pub fn store_collection_content(&self, collection: &Collection, content: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE collections SET content = ?1
                 WHERE id = ?2 AND content IS NULL AND content_version = ?3",
                params![content, collection.id, collection.content_version],
            )
            .map_err(|e| AppError::Database(format!("Failed to store feed: {}", e)))?;
        Ok(rows > 0)
    }

    /// Drop the cached document of a collection. Renders started before this
    /// call will not be stored.
    pub fn invalidate_collection_content(&self, collection_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE collections SET content = NULL, content_version = content_version + 1
             WHERE id = ?1",
            params![collection_id],
        )
        .map_err(|e| AppError::Database(format!("Failed to invalidate feed: {}", e)))?;
        Ok(())
    }

    /// Mark every collection of an account stale and clear its fan-out time,
    /// so the next sync lists everything again.
    pub fn mark_account_stale(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET synced = 0 WHERE id = ?1",
            params![account_id],
        )
        .map_err(|e| AppError::Database(format!("Failed to reset account: {}", e)))?;
        conn.execute(
            "UPDATE collections SET updated = 0 WHERE account_id = ?1",
            params![account_id],
        )
        .map_err(|e| AppError::Database(format!("Failed to reset collections: {}", e)))
    }

    /// Enable or disable the share link of a collection.
    pub fn set_collection_sharing(
        &self,
        collection: &Collection,
        enabled: bool,
        share_key: Option<&str>,
    ) -> Result<()> {
        let mut fields = Self::collection_key(collection.account_id, collection.kind);
        fields.push(("share_enabled", Value::Integer(enabled as i64)));
        fields.push((
            "share_key",
            share_key
                .map(|k| Value::Text(k.to_string()))
                .unwrap_or(Value::Null),
        ));
        self.upsert("collections", &fields, &["account_id", "kind"], "id", None)?;
        Ok(())
    }

    /// Get collection by ID.
    pub fn get_collection(&self, id: i64) -> Result<Option<Collection>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, account_id, kind, content, content_version, updated, share_enabled, share_key
             FROM collections WHERE id = ?1",
            params![id],
            Self::row_to_collection,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get collection: {}", e)))
    }

    /// Get an enabled shared collection by its token.
    pub fn get_shared_collection(&self, share_key: &str) -> Result<Option<Collection>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, account_id, kind, content, content_version, updated, share_enabled, share_key
             FROM collections WHERE share_key = ?1 AND share_enabled = 1",
            params![share_key],
            Self::row_to_collection,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get shared collection: {}", e)))
    }

    /// List the collections of an account.
    pub fn list_collections(&self, account_id: i64) -> Result<Vec<Collection>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, kind, content, content_version, updated, share_enabled, share_key
             FROM collections WHERE account_id = ?1 ORDER BY id",
        )?;
        let collections = stmt
            .query_map(params![account_id], Self::row_to_collection)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collections)
    }

    fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
        let kind: String = row.get(2)?;
        let kind = kind.parse::<CollectionKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Collection {
            id: row.get(0)?,
            account_id: row.get(1)?,
            kind,
            content: row.get(3)?,
            content_version: row.get(4)?,
            updated: row.get(5)?,
            share_enabled: row.get(6)?,
            share_key: row.get(7)?,
        })
    }

    // ========== ENTRY OPERATIONS ==========

    /// Current entries of a collection with their items' remote ids.
    pub fn collection_entries(&self, collection_id: i64) -> Result<Vec<EntryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.item_id, i.remote_id, i.updated
             FROM collection_entries e
             JOIN items i ON i.id = e.item_id
             WHERE e.collection_id = ?1",
        )?;
        let entries = stmt
            .query_map(params![collection_id], |row| {
                Ok(EntryRecord {
                    entry_id: row.get(0)?,
                    item_id: row.get(1)?,
                    remote_id: row.get(2)?,
                    item_updated: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Link an item to a collection, or confirm an existing link.
    pub fn link_item(&self, collection_id: i64, item_id: i64) -> Result<UpsertResult> {
        self.upsert(
            "collection_entries",
            &[
                ("collection_id", Value::Integer(collection_id)),
                ("item_id", Value::Integer(item_id)),
            ],
            &["collection_id", "item_id"],
            "id",
            Some("updated"),
        )
    }

    /// Delete entries by ID.
    pub fn delete_entries(&self, entry_ids: &[i64]) -> Result<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        let placeholders: Vec<String> = entry_ids.iter().map(|_| "?".to_string()).collect();
        let sql = format!(
            "DELETE FROM collection_entries WHERE id IN ({})",
            placeholders.join(",")
        );
        let deleted = conn
            .execute(&sql, params_from_iter(entry_ids))
            .map_err(|e| AppError::Database(format!("Failed to delete entries: {}", e)))?;
        Ok(deleted)
    }

    /// IDs of the collections an item is linked to.
    pub fn collections_containing(&self, item_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT collection_id FROM collection_entries WHERE item_id = ?1")?;
        let ids = stmt
            .query_map(params![item_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    // ========== ITEM OPERATIONS ==========

    /// Get item by AO3 work id.
    pub fn get_item_by_remote_id(&self, remote_id: i64) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, remote_id, title, updated_at, published_at, language, publisher,
                    summary, rating, updated
             FROM items WHERE remote_id = ?1",
            params![remote_id],
            Self::row_to_item,
        )
        .optional()
        .map_err(|e| AppError::Database(format!("Failed to get item: {}", e)))
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
        Ok(Item {
            id: row.get(0)?,
            remote_id: row.get(1)?,
            title: row.get(2)?,
            updated_at: row.get(3)?,
            published_at: row.get(4)?,
            language: row.get(5)?,
            publisher: row.get(6)?,
            summary: row.get(7)?,
            rating: row.get(8)?,
            updated: row.get(9)?,
        })
    }

    /// Count stored items.
    pub fn count_items(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?)
    }

    /// Upsert an author and return its ID.
    pub fn save_person(&self, person: &Person) -> Result<i64> {
        Ok(self
            .upsert(
                "persons",
                &[
                    ("name", Value::Text(person.name.clone())),
                    ("uri", Value::Text(person.uri.clone())),
                    ("email", Value::Text(person.email.clone())),
                ],
                &["name", "uri", "email"],
                "id",
                Some("updated"),
            )?
            .id)
    }

    /// Upsert a tag and return its ID.
    pub fn save_category(&self, category: &Category) -> Result<i64> {
        Ok(self
            .upsert(
                "categories",
                &[
                    ("term", Value::Text(category.term.clone())),
                    ("scheme", Value::Text(category.scheme.clone())),
                    ("label", Value::Text(category.label.clone())),
                ],
                &["term", "scheme", "label"],
                "id",
                Some("updated"),
            )?
            .id)
    }

    /// Upsert a link and return its ID.
    pub fn save_link(&self, link: &ItemLink) -> Result<i64> {
        Ok(self
            .upsert(
                "links",
                &[
                    ("href", Value::Text(link.href.clone())),
                    ("rel", Value::Text(link.rel.clone())),
                    ("type", Value::Text(link.link_type.clone())),
                    (
                        "title",
                        link.title.clone().map(Value::Text).unwrap_or(Value::Null),
                    ),
                ],
                &["href", "rel", "type"],
                "id",
                Some("updated"),
            )?
            .id)
    }

    /// Associate an item with a dependent entity.
    pub fn relate(&self, relation: Relation, item_id: i64, other_id: i64) -> Result<()> {
        self.upsert(
            relation.table(),
            &[
                ("item_id", Value::Integer(item_id)),
                (relation.column(), Value::Integer(other_id)),
            ],
            &["item_id", relation.column()],
            "id",
            None,
        )?;
        Ok(())
    }

    /// Remove associations of an item that are not in `keep`.
    pub fn prune_relations(&self, relation: Relation, item_id: i64, keep: &[i64]) -> Result<usize> {
        let conn = self.conn.lock();
        let mut sql = format!("DELETE FROM {} WHERE item_id = ?", relation.table());
        if !keep.is_empty() {
            let placeholders: Vec<&str> = keep.iter().map(|_| "?").collect();
            sql.push_str(&format!(
                " AND {} NOT IN ({})",
                relation.column(),
                placeholders.join(",")
            ));
        }
        let params: Vec<i64> = std::iter::once(item_id).chain(keep.iter().copied()).collect();
        Ok(conn.execute(&sql, params_from_iter(params))?)
    }

    /// Items of a collection with their authors, tags and links, most recently
    /// updated first.
    pub fn feed_items(&self, collection_id: i64) -> Result<Vec<FeedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.id, i.remote_id, i.title, i.updated_at, i.published_at, i.language,
                    i.publisher, i.summary, i.rating, i.updated
             FROM collection_entries e
             JOIN items i ON i.id = e.item_id
             WHERE e.collection_id = ?1
             ORDER BY i.updated_at DESC, i.id",
        )?;
        let items = stmt
            .query_map(params![collection_id], Self::row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut authors_stmt = conn.prepare(
            "SELECT p.name, p.uri, p.email FROM item_authors r
             JOIN persons p ON p.id = r.person_id
             WHERE r.item_id = ?1 ORDER BY r.id",
        )?;
        let mut categories_stmt = conn.prepare(
            "SELECT c.term, c.scheme, c.label FROM item_categories r
             JOIN categories c ON c.id = r.category_id
             WHERE r.item_id = ?1 ORDER BY r.id",
        )?;
        let mut links_stmt = conn.prepare(
            "SELECT l.href, l.rel, l.type, l.title FROM item_links r
             JOIN links l ON l.id = r.link_id
             WHERE r.item_id = ?1 ORDER BY r.id",
        )?;

        let mut feed = Vec::with_capacity(items.len());
        for item in items {
            let authors = authors_stmt
                .query_map(params![item.id], |row| {
                    Ok(Person {
                        name: row.get(0)?,
                        uri: row.get(1)?,
                        email: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let categories = categories_stmt
                .query_map(params![item.id], |row| {
                    Ok(Category {
                        term: row.get(0)?,
                        scheme: row.get(1)?,
                        label: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let links = links_stmt
                .query_map(params![item.id], |row| {
                    Ok(ItemLink {
                        href: row.get(0)?,
                        rel: row.get(1)?,
                        link_type: row.get(2)?,
                        title: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            feed.push(FeedItem {
                item,
                authors,
                categories,
                links,
            });
        }

        Ok(feed)
    }

    /// Rewind a row's timestamp column (tests simulate elapsed time with it).
    #[cfg(test)]
    pub(crate) fn backdate(&self, table: &str, column: &str, id: i64, ts: i64) {
        let conn = self.conn.lock();
        conn.execute(
            &format!("UPDATE {} SET {} = ?1 WHERE id = ?2", table, column),
            params![ts, id],
        )
        .unwrap();
    }
}
