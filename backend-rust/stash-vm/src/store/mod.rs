use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::content::{ContentError, ContentStore, MemoryContentStore};
use crate::models::Notification;
use crate::notify::{LogNotifier, Notifier};

pub(crate) mod cart;
pub(crate) mod friends;
pub(crate) mod images;
pub(crate) mod lists;
pub(crate) mod notifications;
pub(crate) mod search;
pub(crate) mod shares;
pub(crate) mod things;
pub(crate) mod users;

pub(crate) use notifications::Outbox;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Content error: {0}")]
    Content(#[from] ContentError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No access rights: {0}")]
    NoAccessRights(String),
    #[error("Does not belong to user: {0}")]
    DoesNotBelongToUser(String),
    #[error("Entity in use: {0}")]
    EntityInUse(String),
    #[error("A pending friend request already exists")]
    PendingRequestExists,
    #[error("Friendship already exists")]
    FriendshipExists,
    #[error("Friend request is not pending")]
    FriendRequestNotPending,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite store.
///
/// Every mutating operation runs in exactly one transaction. Notifications
/// written by an operation are handed to the notifier after it commits.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    content: Arc<dyn ContentStore>,
    notifier: Arc<dyn Notifier>,
}

impl Store {
    /// Open (or create) the database at `db_path`.
    ///
    /// Starts with an in-memory content store and the log notifier; swap them
    /// with `with_content_store` and `with_notifier`.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            content: Arc::new(MemoryContentStore::new()),
            notifier: Arc::new(LogNotifier),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn with_content_store(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = content;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                purge_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                mime TEXT NOT NULL,
                hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL DEFAULT '',
                information TEXT NOT NULL DEFAULT '',
                image_id TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (image_id) REFERENCES images(id)
            );

            CREATE TABLE IF NOT EXISTS things (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                private_note TEXT NOT NULL DEFAULT '',
                quantity_unit TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS quantity_entries (
                id TEXT PRIMARY KEY,
                thing_id TEXT NOT NULL,
                delta INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                thing_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                value_string TEXT,
                value_float REAL,
                unit TEXT,
                value_datetime TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS images_things (
                image_id TEXT NOT NULL,
                thing_id TEXT NOT NULL,
                PRIMARY KEY (image_id, thing_id),
                FOREIGN KEY (image_id) REFERENCES images(id),
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS lists (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                sharing_state TEXT NOT NULL DEFAULT 'private',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS lists_things (
                list_id TEXT NOT NULL,
                thing_id TEXT NOT NULL,
                PRIMARY KEY (list_id, thing_id),
                FOREIGN KEY (list_id) REFERENCES lists(id),
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS shares (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                target_user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (owner_id) REFERENCES users(id),
                FOREIGN KEY (target_user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS shares_things (
                share_id TEXT PRIMARY KEY,
                thing_id TEXT NOT NULL,
                FOREIGN KEY (share_id) REFERENCES shares(id),
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS shares_lists (
                share_id TEXT PRIMARY KEY,
                list_id TEXT NOT NULL,
                FOREIGN KEY (share_id) REFERENCES shares(id),
                FOREIGN KEY (list_id) REFERENCES lists(id)
            );

            CREATE TABLE IF NOT EXISTS friend_requests (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (sender_id) REFERENCES users(id),
                FOREIGN KEY (receiver_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS friendships (
                friend1_id TEXT NOT NULL,
                friend2_id TEXT NOT NULL,
                friend_request_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (friend1_id, friend2_id),
                CHECK (friend1_id < friend2_id),
                FOREIGN KEY (friend1_id) REFERENCES users(id),
                FOREIGN KEY (friend2_id) REFERENCES users(id),
                FOREIGN KEY (friend_request_id) REFERENCES friend_requests(id)
            );

            CREATE TABLE IF NOT EXISTS cart_entries (
                user_id TEXT NOT NULL,
                thing_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, thing_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (thing_id) REFERENCES things(id)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                actor_id TEXT,
                content_type TEXT NOT NULL,
                content TEXT NOT NULL,
                acknowledged_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (recipient_id) REFERENCES users(id),
                FOREIGN KEY (actor_id) REFERENCES users(id)
            );

            -- Indexes for the resolver and cascade paths
            CREATE INDEX IF NOT EXISTS idx_users_purge_at ON users(purge_at);
            CREATE INDEX IF NOT EXISTS idx_things_owner ON things(owner_id);
            CREATE INDEX IF NOT EXISTS idx_lists_owner ON lists(owner_id, sharing_state);
            CREATE INDEX IF NOT EXISTS idx_lists_things_thing ON lists_things(thing_id);
            CREATE INDEX IF NOT EXISTS idx_images_hash ON images(hash);
            CREATE INDEX IF NOT EXISTS idx_images_things_thing ON images_things(thing_id);
            CREATE INDEX IF NOT EXISTS idx_shares_target_user ON shares(target_user_id);
            CREATE INDEX IF NOT EXISTS idx_shares_owner ON shares(owner_id);
            CREATE INDEX IF NOT EXISTS idx_shares_things_thing ON shares_things(thing_id);
            CREATE INDEX IF NOT EXISTS idx_shares_lists_list ON shares_lists(list_id);
            CREATE INDEX IF NOT EXISTS idx_friendships_friend2 ON friendships(friend2_id);
            CREATE INDEX IF NOT EXISTS idx_friend_requests_sender ON friend_requests(sender_id, state);
            CREATE INDEX IF NOT EXISTS idx_cart_entries_thing ON cart_entries(thing_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id, created_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic inside a transaction rolls it back on unwind, so the
        // connection behind a poisoned lock is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the connection outside of an explicit transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` in a transaction: committed when it returns `Ok`, rolled back otherwise.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Like `transaction`, but notifications queued on the outbox are delivered once it commits.
    pub(crate) fn notifying_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut Outbox) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut outbox = Outbox::default();
        let value = self.transaction(|tx| f(tx, &mut outbox))?;
        self.deliver(outbox.into_notifications());
        Ok(value)
    }

    fn deliver(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if let Err(e) = self.notifier.notify(&notification) {
                log::warn!(
                    "Failed to deliver notification {} to {}: {}",
                    notification.id,
                    notification.recipient_id,
                    e
                );
            }
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as strings.
pub(crate) fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_datetime)
}

/// Map a missing row to `NotFound(what)`, pass every other error through.
pub(crate) fn not_found(what: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> StoreError {
    let what = what.into();
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what),
        _ => StoreError::Database(e),
    }
}

/// `?, ?, ?` for an `IN (..)` clause with `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
