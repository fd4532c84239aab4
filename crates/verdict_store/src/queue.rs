//! Durable task queue.
//!
//! A small staging table in the configuration store connects the
//! foreground API handlers to the worker processes. Claiming is an
//! atomic fetch-and-lock: select the oldest unclaimed row, then take it
//! with a predicated `UPDATE` inside one transaction, so two workers
//! never run the same payload.

use sqlx::SqlitePool;
use tracing::{debug, info};
use verdict_protocol::TaskToken;

use crate::error::StoreResult;
use crate::models::QueueRow;
use crate::now_secs;

pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of rows currently staged (claimed or not). This is the
    /// figure the push-side capacity bound is checked against.
    pub async fn depth(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stage a packed envelope for pickup.
    pub async fn push(&self, token: TaskToken, envelope: &[u8]) -> StoreResult<()> {
        sqlx::query("INSERT INTO task_queue (token, envelope, enqueued_at) VALUES (?, ?, ?)")
            .bind(token.to_string())
            .bind(envelope)
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stage a payload and take its record through
    /// `ALLOCATED -> ENQUEUED` in one transaction, so a worker can never
    /// see the payload before the record, or the record without its
    /// payload.
    pub async fn push_with_transition(
        &self,
        token: TaskToken,
        server_id: &str,
        envelope: &[u8],
    ) -> StoreResult<()> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ENQUEUED', enqueued_at = ?, owning_server = ?
            WHERE token = ? AND status = 'ALLOCATED'
            "#,
        )
        .bind(now)
        .bind(server_id)
        .bind(token.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(crate::error::StoreError::Conflict(format!(
                "task {token} is not ALLOCATED"
            )));
        }

        sqlx::query("INSERT INTO task_queue (token, envelope, enqueued_at) VALUES (?, ?, ?)")
            .bind(token.to_string())
            .bind(envelope)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Task {} enqueued by {}", token, server_id);
        Ok(())
    }

    /// Atomically claim the oldest unclaimed payload.
    ///
    /// Returns `None` when the queue is empty or another worker won the
    /// race. The row stays in the table until [`QueueStore::remove`] so
    /// a crash between claim and run can be recovered.
    pub async fn claim(&self, worker_id: &str) -> StoreResult<Option<QueueRow>> {
        let mut tx = self.pool.begin().await?;

        let row_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM task_queue
            WHERE claimed_by IS NULL
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row_id) = row_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let affected = sqlx::query(
            r#"
            UPDATE task_queue
            SET claimed_by = ?, claimed_at = ?
            WHERE id = ? AND claimed_by IS NULL
            "#,
        )
        .bind(worker_id)
        .bind(now_secs())
        .bind(row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            // Another worker claimed it between our SELECT and UPDATE.
            tx.commit().await?;
            return Ok(None);
        }

        let row: QueueRow = sqlx::query_as(
            "SELECT id, token, envelope, enqueued_at FROM task_queue WHERE id = ?",
        )
        .bind(row_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Worker {} claimed queue row {}", worker_id, row.id);
        Ok(Some(row))
    }

    /// Drop a consumed (or discarded) payload.
    pub async fn remove(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recover payloads abandoned between claim and run.
    ///
    /// A row claimed longer than `claim_timeout_secs` ago whose task is
    /// still `ENQUEUED` belongs to a worker that died before the
    /// `ENQUEUED -> RUNNING` transition; re-offer it.
    pub async fn reclaim_abandoned(&self, claim_timeout_secs: i64) -> StoreResult<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE task_queue
            SET claimed_by = NULL, claimed_at = NULL
            WHERE claimed_by IS NOT NULL
              AND claimed_at < ?
              AND token IN (SELECT token FROM tasks WHERE status = 'ENQUEUED')
            "#,
        )
        .bind(now_secs() - claim_timeout_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            info!("Re-offered {} abandoned queue payloads", affected);
        }
        Ok(affected)
    }

    /// Delete rows whose task already reached a terminal status.
    pub async fn purge_settled(&self) -> StoreResult<u64> {
        let affected = sqlx::query(
            r#"
            DELETE FROM task_queue
            WHERE token IN (
                SELECT token FROM tasks
                WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED', 'DROPPED')
            )
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }
}
