//! Storage layer for Verdict.
//!
//! Two stores live here:
//!
//! - [`ConfigStore`] — the single server-wide configuration database
//!   (SQLite): products, permissions, sessions, accounts, tasks, the
//!   durable task queue, notifications, filter presets, and source
//!   components.
//! - [`ResultStore`] — the per-product analysis-results database
//!   (SQLite or PostgreSQL), opened and closed by the product registry.
//!
//! Every task status transition is a single `UPDATE … WHERE status = ?`
//! round-trip, so the state machine stays monotonic under concurrent
//! writers without long-held locks.

pub mod auth;
pub mod error;
pub mod models;
pub mod products;
pub mod queue;
pub mod result_store;
pub mod schema;
pub mod server_meta;
pub mod tasks;

pub use error::{StoreError, StoreResult};
pub use result_store::ResultStore;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::auth::AuthStore;
use crate::products::ProductStore;
use crate::queue::QueueStore;
use crate::server_meta::ServerMetaStore;
use crate::tasks::TaskStore;

/// Current epoch seconds, UTC.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Handle on the server-wide configuration database.
///
/// Cloning is cheap; the underlying pool is shared.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    /// Open (creating if missing) the configuration store at `path`.
    ///
    /// WAL mode so the server and its worker processes can share the
    /// file.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open configuration store: {}", path.display()))?;
        Ok(Self { pool })
    }

    /// Open a throwaway in-memory store (tests).
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Failed to parse in-memory SQLite URL")?;
        // A single connection: every handle must see the same database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory configuration store")?;
        Ok(Self { pool })
    }

    /// Create tables and stamp the schema version. Idempotent.
    pub async fn init(&self) -> Result<()> {
        schema::init_config_schema(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> QueueStore {
        QueueStore::new(self.pool.clone())
    }

    pub fn products(&self) -> ProductStore {
        ProductStore::new(self.pool.clone())
    }

    pub fn auth(&self) -> AuthStore {
        AuthStore::new(self.pool.clone())
    }

    pub fn server_meta(&self) -> ServerMetaStore {
        ServerMetaStore::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
