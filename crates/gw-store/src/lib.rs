//! Durable store for the message lifecycle.
//!
//! One embedded SQLite database per state directory, opened in WAL mode with
//! `synchronous=NORMAL` and cached process-wide, so every journal in the
//! process shares a single pool per directory. When the configured path
//! cannot be opened the store falls back to an in-memory database keyed by
//! the same path: reads and writes keep working, crash recovery does not.

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DB_FILE_NAME: &str = "message-lifecycle.db";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State directory error: {0}")]
    StateDir(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the lifecycle database of one state directory.
pub struct StateStore {
    pool: SqlitePool,
    state_dir: PathBuf,
    fallback: bool,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<StateStore>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<StateStore>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl StateStore {
    /// Open (or reuse) the store for a state directory.
    ///
    /// The returned handle is a process-wide singleton per resolved path.
    /// An unopenable path degrades to an in-memory database with a warning
    /// instead of failing the caller.
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Arc<StateStore>> {
        let key = resolve_key(state_dir.as_ref());

        let mut stores = registry().lock().await;
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }

        let store = match Self::open_file(&key).await {
            Ok(pool) => {
                let store = Arc::new(StateStore {
                    pool,
                    state_dir: key.clone(),
                    fallback: false,
                });
                store.schema().await?;
                store
            }
            Err(err) => {
                warn!(
                    state_dir = %key.display(),
                    error = %err,
                    "Could not open lifecycle database, falling back to in-memory store; \
                     crash recovery is inoperative until restart with a writable path"
                );
                let store = Arc::new(StateStore {
                    pool: memory_pool().await?,
                    state_dir: key.clone(),
                    fallback: true,
                });
                store.schema().await?;
                store
            }
        };

        stores.insert(key, store.clone());
        Ok(store)
    }

    /// Open a private in-memory store. Used by tests; never cached.
    pub async fn open_in_memory() -> Result<Arc<StateStore>> {
        let store = Arc::new(StateStore {
            pool: memory_pool().await?,
            state_dir: PathBuf::from(":memory:"),
            fallback: false,
        });
        store.schema().await?;
        Ok(store)
    }

    async fn open_file(state_dir: &Path) -> Result<SqlitePool> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| StoreError::StateDir(format!("{}: {}", state_dir.display(), e)))?;

        let options = SqliteConnectOptions::new()
            .filename(state_dir.join(DB_FILE_NAME))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(state_dir = %state_dir.display(), "Opened lifecycle database");
        Ok(pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// True when this store is the in-memory fallback for an unopenable path.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Create tables and indexes. Safe to call any number of times.
    pub async fn schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Run `f` inside an immediate write transaction. Any error rolls the
    /// whole transaction back.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::SqliteConnection,
        ) -> BoxFuture<'c, std::result::Result<T, sqlx::Error>>,
    {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        match f(&mut conn).await {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err.into())
            }
        }
    }
}

fn resolve_key(state_dir: &Path) -> PathBuf {
    state_dir
        .canonicalize()
        .unwrap_or_else(|_| state_dir.to_path_buf())
}

async fn memory_pool() -> Result<SqlitePool> {
    // A single connection keeps every reader and writer on the same
    // memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().in_memory(true))
        .await?;
    Ok(pool)
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS message_turns (
        id TEXT PRIMARY KEY,
        channel TEXT NOT NULL,
        account_id TEXT,
        external_id TEXT,
        dedupe_key TEXT,
        session_key TEXT NOT NULL,
        payload TEXT NOT NULL,
        route_channel TEXT,
        route_to TEXT,
        route_account_id TEXT,
        route_thread_id TEXT,
        route_reply_to_id TEXT,
        status TEXT NOT NULL,
        accepted_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        terminal_reason TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_dedupe_key
    ON message_turns (dedupe_key)
    WHERE dedupe_key IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_turns_resume
    ON message_turns (status, next_attempt_at, updated_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_turns_session
    ON message_turns (session_key, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_outbox (
        id TEXT PRIMARY KEY,
        turn_id TEXT,
        channel TEXT NOT NULL,
        account_id TEXT,
        target TEXT NOT NULL,
        payload TEXT NOT NULL,
        idempotency_key TEXT,
        queued_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        last_error TEXT,
        error_class TEXT,
        terminal_reason TEXT,
        delivered_at INTEGER,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_idempotency_key
    ON message_outbox (idempotency_key)
    WHERE idempotency_key IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_pending
    ON message_outbox (status, next_attempt_at, queued_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_turn
    ON message_outbox (turn_id)
    "#,
];
