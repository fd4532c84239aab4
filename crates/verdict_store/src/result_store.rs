//! Per-product result store.
//!
//! Each product's analysis results live in their own database, reached
//! through the product's connection spec: a SQLite file (created on
//! first open) or a pre-existing PostgreSQL database. The core treats
//! report content as opaque; only the cleanup-plan aggregate and the
//! schema version are interpreted here.
//!
//! Every method matches on the backend because the two engines differ
//! in placeholders and id generation; the semantics are identical.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Row, SqlitePool};
use tracing::{info, warn};
use verdict_protocol::{CleanupPlanInfo, ConnectionSpec, SchemaStatus};

use crate::error::{StoreError, StoreResult};
use crate::now_secs;

/// Bumped whenever the result-store schema changes shape.
pub const RESULT_SCHEMA_VERSION: i64 = 1;

enum ResultPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

pub struct ResultStore {
    pool: ResultPool,
}

impl ResultStore {
    /// Open a connection pool for the given spec.
    ///
    /// SQLite files are created on first open; PostgreSQL databases must
    /// already exist (creating them is an operator concern).
    pub async fn connect(spec: &ConnectionSpec) -> StoreResult<Self> {
        let pool = match spec {
            ConnectionSpec::Sqlite { path } => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .busy_timeout(std::time::Duration::from_secs(5));
                let pool = SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?;
                ResultPool::Sqlite(pool)
            }
            ConnectionSpec::Postgres {
                host,
                port,
                user,
                password,
                database,
            } => {
                let options = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user)
                    .password(password)
                    .database(database);
                let pool = PgPoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?;
                ResultPool::Postgres(pool)
            }
        };
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> StoreResult<()> {
        match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
            ResultPool::Postgres(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match &self.pool {
            ResultPool::Sqlite(p) => p.close().await,
            ResultPool::Postgres(p) => p.close().await,
        }
    }

    /// Create missing tables and judge the schema version.
    ///
    /// A fresh database is stamped with the current version and reported
    /// `ok`. An older version is `needs_upgrade` (the product stays
    /// mounted but read-only paths may refuse); a newer or garbled one
    /// is `broken`.
    pub async fn ensure_schema(&self) -> StoreResult<SchemaStatus> {
        self.create_tables().await?;

        let version: Option<i64> = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
                    .fetch_optional(p)
                    .await?
            }
            ResultPool::Postgres(p) => {
                sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
                    .fetch_optional(p)
                    .await?
            }
        };

        match version {
            None => {
                match &self.pool {
                    ResultPool::Sqlite(p) => {
                        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                            .bind(RESULT_SCHEMA_VERSION)
                            .execute(p)
                            .await?;
                    }
                    ResultPool::Postgres(p) => {
                        sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                            .bind(RESULT_SCHEMA_VERSION)
                            .execute(p)
                            .await?;
                    }
                }
                info!("Result store initialized at schema version {}", RESULT_SCHEMA_VERSION);
                Ok(SchemaStatus::Ok)
            }
            Some(v) if v == RESULT_SCHEMA_VERSION => Ok(SchemaStatus::Ok),
            Some(v) if v < RESULT_SCHEMA_VERSION => {
                warn!("Result store at schema version {} needs upgrade to {}", v, RESULT_SCHEMA_VERSION);
                Ok(SchemaStatus::NeedsUpgrade)
            }
            Some(v) => {
                warn!("Result store at unknown schema version {}", v);
                Ok(SchemaStatus::Broken)
            }
        }
    }

    async fn create_tables(&self) -> StoreResult<()> {
        match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::raw_sql(
                    r#"
                    CREATE TABLE IF NOT EXISTS schema_version (
                        version INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS reports (
                        hash      TEXT PRIMARY KEY,
                        run_name  TEXT NOT NULL,
                        body      TEXT NOT NULL,
                        stored_at INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS cleanup_plans (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        name        TEXT NOT NULL UNIQUE,
                        description TEXT,
                        due_date    INTEGER,
                        closed_at   INTEGER
                    );
                    CREATE TABLE IF NOT EXISTS cleanup_plan_reports (
                        plan_id     INTEGER NOT NULL,
                        report_hash TEXT NOT NULL,
                        PRIMARY KEY (plan_id, report_hash)
                    );
                    "#,
                )
                .execute(p)
                .await?;
            }
            ResultPool::Postgres(p) => {
                sqlx::raw_sql(
                    r#"
                    CREATE TABLE IF NOT EXISTS schema_version (
                        version BIGINT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS reports (
                        hash      TEXT PRIMARY KEY,
                        run_name  TEXT NOT NULL,
                        body      TEXT NOT NULL,
                        stored_at BIGINT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS cleanup_plans (
                        id          BIGSERIAL PRIMARY KEY,
                        name        TEXT NOT NULL UNIQUE,
                        description TEXT,
                        due_date    BIGINT,
                        closed_at   BIGINT
                    );
                    CREATE TABLE IF NOT EXISTS cleanup_plan_reports (
                        plan_id     BIGINT NOT NULL,
                        report_hash TEXT NOT NULL,
                        PRIMARY KEY (plan_id, report_hash)
                    );
                    "#,
                )
                .execute(p)
                .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Reports (opaque key/value)
    // ========================================================================

    /// Store or overwrite a report blob keyed by its hash.
    pub async fn store_report(&self, hash: &str, run_name: &str, body: &str) -> StoreResult<()> {
        match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO reports (hash, run_name, body, stored_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT (hash) DO UPDATE SET
                        run_name = excluded.run_name,
                        body = excluded.body,
                        stored_at = excluded.stored_at
                    "#,
                )
                .bind(hash)
                .bind(run_name)
                .bind(body)
                .bind(now_secs())
                .execute(p)
                .await?;
            }
            ResultPool::Postgres(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO reports (hash, run_name, body, stored_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (hash) DO UPDATE SET
                        run_name = excluded.run_name,
                        body = excluded.body,
                        stored_at = excluded.stored_at
                    "#,
                )
                .bind(hash)
                .bind(run_name)
                .bind(body)
                .bind(now_secs())
                .execute(p)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn report_count(&self) -> StoreResult<i64> {
        let count: i64 = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM reports")
                    .fetch_one(p)
                    .await?
            }
            ResultPool::Postgres(p) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM reports")
                    .fetch_one(p)
                    .await?
            }
        };
        Ok(count)
    }

    // ========================================================================
    // Cleanup plans
    // ========================================================================

    pub async fn create_plan(
        &self,
        name: &str,
        description: Option<&str>,
        due_date: Option<i64>,
    ) -> StoreResult<CleanupPlanInfo> {
        let id = match &self.pool {
            ResultPool::Sqlite(p) => {
                let result = sqlx::query(
                    "INSERT INTO cleanup_plans (name, description, due_date) VALUES (?, ?, ?)",
                )
                .bind(name)
                .bind(description)
                .bind(due_date)
                .execute(p)
                .await;
                match result {
                    Ok(r) => r.last_insert_rowid(),
                    Err(e) => return Err(map_unique(e, name)),
                }
            }
            ResultPool::Postgres(p) => {
                let result = sqlx::query(
                    "INSERT INTO cleanup_plans (name, description, due_date) VALUES ($1, $2, $3) RETURNING id",
                )
                .bind(name)
                .bind(description)
                .bind(due_date)
                .fetch_one(p)
                .await;
                match result {
                    Ok(row) => row.get::<i64, _>(0),
                    Err(e) => return Err(map_unique(e, name)),
                }
            }
        };

        self.get_plan(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("cleanup plan {id} vanished after insert")))
    }

    pub async fn get_plan(&self, id: i64) -> StoreResult<Option<CleanupPlanInfo>> {
        let base: Option<(i64, String, Option<String>, Option<i64>, Option<i64>)> =
            match &self.pool {
                ResultPool::Sqlite(p) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(p)
                    .await?
                }
                ResultPool::Postgres(p) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans WHERE id = $1",
                    )
                    .bind(id)
                    .fetch_optional(p)
                    .await?
                }
            };

        let Some((id, name, description, due_date, closed_at)) = base else {
            return Ok(None);
        };
        let report_hashes = self.plan_report_hashes(id).await?;
        Ok(Some(CleanupPlanInfo {
            id,
            name,
            description,
            due_date,
            closed_at,
            report_hashes,
        }))
    }

    pub async fn list_plans(&self, include_closed: bool) -> StoreResult<Vec<CleanupPlanInfo>> {
        let rows: Vec<(i64, String, Option<String>, Option<i64>, Option<i64>)> =
            match (&self.pool, include_closed) {
                (ResultPool::Sqlite(p), true) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans ORDER BY name ASC",
                    )
                    .fetch_all(p)
                    .await?
                }
                (ResultPool::Sqlite(p), false) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans WHERE closed_at IS NULL ORDER BY name ASC",
                    )
                    .fetch_all(p)
                    .await?
                }
                (ResultPool::Postgres(p), true) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans ORDER BY name ASC",
                    )
                    .fetch_all(p)
                    .await?
                }
                (ResultPool::Postgres(p), false) => {
                    sqlx::query_as(
                        "SELECT id, name, description, due_date, closed_at FROM cleanup_plans WHERE closed_at IS NULL ORDER BY name ASC",
                    )
                    .fetch_all(p)
                    .await?
                }
            };

        let mut plans = Vec::with_capacity(rows.len());
        for (id, name, description, due_date, closed_at) in rows {
            let report_hashes = self.plan_report_hashes(id).await?;
            plans.push(CleanupPlanInfo {
                id,
                name,
                description,
                due_date,
                closed_at,
                report_hashes,
            });
        }
        Ok(plans)
    }

    pub async fn update_plan(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        due_date: Option<i64>,
    ) -> StoreResult<CleanupPlanInfo> {
        let Some(current) = self.get_plan(id).await? else {
            return Err(StoreError::NotFound(format!("no such cleanup plan: {id}")));
        };

        let name = name.unwrap_or(&current.name);
        let description = description.or(current.description.as_deref());
        let due_date = due_date.or(current.due_date);

        let result = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query(
                    "UPDATE cleanup_plans SET name = ?, description = ?, due_date = ? WHERE id = ?",
                )
                .bind(name)
                .bind(description)
                .bind(due_date)
                .bind(id)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
            }
            ResultPool::Postgres(p) => {
                sqlx::query(
                    "UPDATE cleanup_plans SET name = $1, description = $2, due_date = $3 WHERE id = $4",
                )
                .bind(name)
                .bind(description)
                .bind(due_date)
                .bind(id)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
            }
        };
        if let Err(e) = result {
            return Err(map_unique(e, name));
        }

        self.get_plan(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no such cleanup plan: {id}")))
    }

    /// Close an open plan. Returns false if absent or already closed.
    pub async fn close_plan(&self, id: i64) -> StoreResult<bool> {
        let affected = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query("UPDATE cleanup_plans SET closed_at = ? WHERE id = ? AND closed_at IS NULL")
                    .bind(now_secs())
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
            ResultPool::Postgres(p) => {
                sqlx::query("UPDATE cleanup_plans SET closed_at = $1 WHERE id = $2 AND closed_at IS NULL")
                    .bind(now_secs())
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    /// Reopen a closed plan. Returns false if absent or already open.
    pub async fn reopen_plan(&self, id: i64) -> StoreResult<bool> {
        let affected = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query("UPDATE cleanup_plans SET closed_at = NULL WHERE id = ? AND closed_at IS NOT NULL")
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
            ResultPool::Postgres(p) => {
                sqlx::query("UPDATE cleanup_plans SET closed_at = NULL WHERE id = $1 AND closed_at IS NOT NULL")
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    /// Hard delete, including membership rows.
    pub async fn delete_plan(&self, id: i64) -> StoreResult<bool> {
        let affected = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query("DELETE FROM cleanup_plan_reports WHERE plan_id = ?")
                    .bind(id)
                    .execute(p)
                    .await?;
                sqlx::query("DELETE FROM cleanup_plans WHERE id = ?")
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
            ResultPool::Postgres(p) => {
                sqlx::query("DELETE FROM cleanup_plan_reports WHERE plan_id = $1")
                    .bind(id)
                    .execute(p)
                    .await?;
                sqlx::query("DELETE FROM cleanup_plans WHERE id = $1")
                    .bind(id)
                    .execute(p)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    /// Associate report hashes with a plan. A hash may belong to several
    /// plans; duplicates within one plan are ignored.
    pub async fn set_plan_reports(&self, id: i64, hashes: &[String]) -> StoreResult<()> {
        if self.get_plan(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("no such cleanup plan: {id}")));
        }
        for hash in hashes {
            match &self.pool {
                ResultPool::Sqlite(p) => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO cleanup_plan_reports (plan_id, report_hash) VALUES (?, ?)",
                    )
                    .bind(id)
                    .bind(hash)
                    .execute(p)
                    .await?;
                }
                ResultPool::Postgres(p) => {
                    sqlx::query(
                        "INSERT INTO cleanup_plan_reports (plan_id, report_hash) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(id)
                    .bind(hash)
                    .execute(p)
                    .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn unset_plan_reports(&self, id: i64, hashes: &[String]) -> StoreResult<()> {
        if self.get_plan(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("no such cleanup plan: {id}")));
        }
        for hash in hashes {
            match &self.pool {
                ResultPool::Sqlite(p) => {
                    sqlx::query(
                        "DELETE FROM cleanup_plan_reports WHERE plan_id = ? AND report_hash = ?",
                    )
                    .bind(id)
                    .bind(hash)
                    .execute(p)
                    .await?;
                }
                ResultPool::Postgres(p) => {
                    sqlx::query(
                        "DELETE FROM cleanup_plan_reports WHERE plan_id = $1 AND report_hash = $2",
                    )
                    .bind(id)
                    .bind(hash)
                    .execute(p)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn plan_report_hashes(&self, id: i64) -> StoreResult<Vec<String>> {
        let hashes: Vec<String> = match &self.pool {
            ResultPool::Sqlite(p) => {
                sqlx::query_scalar(
                    "SELECT report_hash FROM cleanup_plan_reports WHERE plan_id = ? ORDER BY report_hash ASC",
                )
                .bind(id)
                .fetch_all(p)
                .await?
            }
            ResultPool::Postgres(p) => {
                sqlx::query_scalar(
                    "SELECT report_hash FROM cleanup_plan_reports WHERE plan_id = $1 ORDER BY report_hash ASC",
                )
                .bind(id)
                .fetch_all(p)
                .await?
            }
        };
        Ok(hashes)
    }
}

fn map_unique(err: sqlx::Error, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(e) if e.is_unique_violation() => {
            StoreError::Conflict(format!("cleanup plan '{name}' already exists"))
        }
        _ => StoreError::Db(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, ResultStore) {
        let dir = TempDir::new().unwrap();
        let spec = ConnectionSpec::Sqlite {
            path: dir.path().join("results.sqlite").display().to_string(),
        };
        let store = ResultStore::connect(&spec).await.unwrap();
        assert_eq!(store.ensure_schema().await.unwrap(), SchemaStatus::Ok);
        (dir, store)
    }

    #[tokio::test]
    async fn test_fresh_store_is_ok_and_stable() {
        let (_dir, store) = open_temp().await;
        // Re-checking an initialized store stays ok.
        assert_eq!(store.ensure_schema().await.unwrap(), SchemaStatus::Ok);
    }

    #[tokio::test]
    async fn test_plan_lifecycle() {
        let (_dir, store) = open_temp().await;

        let plan = store
            .create_plan("q3-triage", Some("pre-release sweep"), None)
            .await
            .unwrap();
        assert!(plan.closed_at.is_none());

        // Duplicate name conflicts.
        assert!(matches!(
            store.create_plan("q3-triage", None, None).await,
            Err(StoreError::Conflict(_))
        ));

        store
            .set_plan_reports(plan.id, &["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        // Re-adding an existing hash is a no-op.
        store
            .set_plan_reports(plan.id, &["h2".to_string()])
            .await
            .unwrap();
        let plan = store.get_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(plan.report_hashes, vec!["h1".to_string(), "h2".to_string()]);

        assert!(store.close_plan(plan.id).await.unwrap());
        assert!(!store.close_plan(plan.id).await.unwrap());
        assert!(store.list_plans(false).await.unwrap().is_empty());
        assert_eq!(store.list_plans(true).await.unwrap().len(), 1);

        assert!(store.reopen_plan(plan.id).await.unwrap());
        let plan = store.get_plan(plan.id).await.unwrap().unwrap();
        assert!(plan.closed_at.is_none());

        store
            .unset_plan_reports(plan.id, &["h1".to_string()])
            .await
            .unwrap();
        let plan = store.get_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(plan.report_hashes, vec!["h2".to_string()]);

        assert!(store.delete_plan(plan.id).await.unwrap());
        assert!(store.get_plan(plan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_may_belong_to_multiple_plans() {
        let (_dir, store) = open_temp().await;
        let a = store.create_plan("plan-a", None, None).await.unwrap();
        let b = store.create_plan("plan-b", None, None).await.unwrap();

        store.set_plan_reports(a.id, &["shared".to_string()]).await.unwrap();
        store.set_plan_reports(b.id, &["shared".to_string()]).await.unwrap();

        assert_eq!(
            store.get_plan(a.id).await.unwrap().unwrap().report_hashes,
            vec!["shared".to_string()]
        );
        assert_eq!(
            store.get_plan(b.id).await.unwrap().unwrap().report_hashes,
            vec!["shared".to_string()]
        );
    }

    #[tokio::test]
    async fn test_opaque_report_storage() {
        let (_dir, store) = open_temp().await;
        store
            .store_report("abc123", "nightly", r#"{"checker":"core.NullDeref"}"#)
            .await
            .unwrap();
        store
            .store_report("abc123", "nightly-2", r#"{"checker":"core.NullDeref"}"#)
            .await
            .unwrap();
        assert_eq!(store.report_count().await.unwrap(), 1);
    }
}
