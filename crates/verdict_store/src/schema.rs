//! Configuration-store DDL.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Bumped whenever the configuration schema changes shape.
pub const CONFIG_SCHEMA_VERSION: i64 = 1;

/// Create all configuration tables and stamp the version. Idempotent.
pub async fn init_config_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            endpoint        TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            description     TEXT,
            connection_json TEXT NOT NULL,
            schema_status   TEXT NOT NULL DEFAULT 'disconnected'
        );

        CREATE TABLE IF NOT EXISTS permissions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            permission       TEXT NOT NULL,
            product_endpoint TEXT,
            grantee          TEXT NOT NULL,
            is_group         INTEGER NOT NULL DEFAULT 0,
            UNIQUE (permission, product_endpoint, grantee, is_group)
        );

        CREATE TABLE IF NOT EXISTS accounts (
            username        TEXT PRIMARY KEY,
            password_salt   TEXT NOT NULL,
            password_digest TEXT NOT NULL,
            groups_json     TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS sessions (
            session_id   TEXT PRIMARY KEY,
            username     TEXT NOT NULL,
            issued_at    INTEGER NOT NULL,
            last_used_at INTEGER NOT NULL,
            expires_at   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_sessions_username ON sessions(username);

        CREATE TABLE IF NOT EXISTS tasks (
            token             TEXT PRIMARY KEY,
            kind              TEXT NOT NULL,
            summary           TEXT NOT NULL,
            actor             TEXT,
            product_endpoint  TEXT,
            status            TEXT NOT NULL DEFAULT 'ALLOCATED',
            created_at        INTEGER NOT NULL,
            enqueued_at       INTEGER,
            started_at        INTEGER,
            last_heartbeat_at INTEGER,
            finished_at       INTEGER,
            cancel_requested  INTEGER NOT NULL DEFAULT 0,
            owning_server     TEXT,
            consumed          INTEGER NOT NULL DEFAULT 0,
            data_dir          TEXT,
            data_dir_removed  INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS ix_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS ix_tasks_actor ON tasks(actor);
        CREATE INDEX IF NOT EXISTS ix_tasks_product ON tasks(product_endpoint);
        CREATE INDEX IF NOT EXISTS ix_tasks_created ON tasks(created_at);

        CREATE TABLE IF NOT EXISTS task_comments (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            token     TEXT NOT NULL,
            actor     TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            body      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_task_comments_token ON task_comments(token);

        CREATE TABLE IF NOT EXISTS task_queue (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            token       TEXT NOT NULL UNIQUE,
            envelope    BLOB NOT NULL,
            enqueued_at INTEGER NOT NULL,
            claimed_by  TEXT,
            claimed_at  INTEGER
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            message    TEXT NOT NULL,
            severity   TEXT NOT NULL DEFAULT 'info',
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS filter_presets (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            owner            TEXT NOT NULL,
            product_endpoint TEXT,
            name             TEXT NOT NULL,
            value_json       TEXT NOT NULL,
            UNIQUE (owner, product_endpoint, name)
        );

        CREATE TABLE IF NOT EXISTS source_components (
            product_endpoint TEXT NOT NULL,
            name             TEXT NOT NULL,
            description      TEXT,
            patterns_json    TEXT NOT NULL,
            PRIMARY KEY (product_endpoint, name)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create configuration schema")?;

    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    match version {
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(CONFIG_SCHEMA_VERSION)
                .execute(pool)
                .await?;
        }
        Some(v) if v == CONFIG_SCHEMA_VERSION => {}
        Some(v) => {
            anyhow::bail!(
                "Configuration store schema version {} does not match expected {}",
                v,
                CONFIG_SCHEMA_VERSION
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::ConfigStore;

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        store.init().await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, super::CONFIG_SCHEMA_VERSION);
    }
}
