//! Task record store.
//!
//! The single authority on task existence and status. Every transition
//! is a status-predicated `UPDATE`; a write that matches no row means
//! the record moved first and the caller must re-read.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;
use verdict_protocol::rpc::TaskStatsInfo;
use verdict_protocol::{TaskComment, TaskFilter, TaskInfo, TaskStatus, TaskToken};

use crate::error::{StoreError, StoreResult};
use crate::models::{CommentRow, TaskRow};
use crate::now_secs;

const TASK_COLUMNS: &str = "token, kind, summary, actor, product_endpoint, status, \
     created_at, enqueued_at, started_at, last_heartbeat_at, finished_at, \
     cancel_requested, owning_server, consumed, data_dir, data_dir_removed";

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a fresh `ALLOCATED` record. Atomic: the record is either
    /// visible to all future readers or absent.
    pub async fn allocate(
        &self,
        token: TaskToken,
        kind: &str,
        summary: &str,
        actor: Option<&str>,
        product: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (token, kind, summary, actor, product_endpoint, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'ALLOCATED', ?)
            "#,
        )
        .bind(token.to_string())
        .bind(kind)
        .bind(summary)
        .bind(actor)
        .bind(product)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        info!("Allocated task {} kind={}", token, kind);
        Ok(())
    }

    pub async fn get_row(&self, token: TaskToken) -> StoreResult<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE token = ?"
        ))
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Full record including comments.
    pub async fn get_info(&self, token: TaskToken) -> StoreResult<Option<TaskInfo>> {
        let Some(row) = self.get_row(token).await? else {
            return Ok(None);
        };
        let comments = self.comments(token).await?;
        Ok(Some(row.into_info(comments)?))
    }

    pub async fn comments(&self, token: TaskToken) -> StoreResult<Vec<TaskComment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT actor, timestamp, body FROM task_comments
            WHERE token = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(token.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Record the data directory path. Rejected once the task is terminal.
    pub async fn set_data_dir(&self, token: TaskToken, path: &str) -> StoreResult<()> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET data_dir = ?
            WHERE token = ? AND status IN ('ALLOCATED', 'ENQUEUED', 'RUNNING')
            "#,
        )
        .bind(path)
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!(
                "task {token} unknown or already terminal"
            )));
        }
        Ok(())
    }

    /// `ALLOCATED -> ENQUEUED`, stamping the owning server.
    pub async fn mark_enqueued(&self, token: TaskToken, server_id: &str) -> StoreResult<()> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ENQUEUED', enqueued_at = ?, owning_server = ?
            WHERE token = ? AND status = 'ALLOCATED'
            "#,
        )
        .bind(now_secs())
        .bind(server_id)
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::Conflict(format!(
                "task {token} is not ALLOCATED"
            )));
        }
        Ok(())
    }

    /// `ENQUEUED -> RUNNING`. Returns false when the claim lost the race
    /// (record already moved); the caller discards the payload.
    pub async fn claim_running(&self, token: TaskToken, server_id: &str) -> StoreResult<bool> {
        let now = now_secs();
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', started_at = ?, last_heartbeat_at = ?, owning_server = ?
            WHERE token = ? AND status = 'ENQUEUED'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(server_id)
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    /// Liveness update from the task's own implementation. Accepted only
    /// while `RUNNING` under the calling server; a no-op otherwise.
    pub async fn heartbeat(&self, token: TaskToken, server_id: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET last_heartbeat_at = ?
            WHERE token = ? AND status = 'RUNNING' AND owning_server = ?
            "#,
        )
        .bind(now_secs())
        .bind(token.to_string())
        .bind(server_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Whether a running task has been asked to cancel. Non-`RUNNING`
    /// and unknown tokens read as false, with no side effects.
    pub async fn cancel_requested(&self, token: TaskToken) -> StoreResult<bool> {
        let value: Option<bool> = sqlx::query_scalar(
            "SELECT cancel_requested FROM tasks WHERE token = ? AND status = 'RUNNING'",
        )
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.unwrap_or(false))
    }

    /// Admin cancellation flag. No effect on terminal tasks.
    pub async fn request_cancel(&self, token: TaskToken) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET cancel_requested = 1
            WHERE token = ? AND status IN ('ALLOCATED', 'ENQUEUED', 'RUNNING')
            "#,
        )
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Flag `RUNNING` tasks past the configured wall-clock bound for
    /// cancellation. The out-of-band deadline watcher calls this; tasks
    /// then observe `should_cancel` as usual.
    pub async fn request_cancel_overdue(&self, max_runtime_secs: i64) -> StoreResult<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET cancel_requested = 1
            WHERE status = 'RUNNING' AND cancel_requested = 0 AND started_at < ?
            "#,
        )
        .bind(now_secs() - max_runtime_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// `RUNNING -> <terminal>`, clearing the owning server. `Conflict`
    /// when the record is no longer `RUNNING`.
    pub async fn finish(&self, token: TaskToken, status: TaskStatus) -> StoreResult<()> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidData(format!(
                "finish called with non-terminal status {status}"
            )));
        }
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, finished_at = ?, owning_server = NULL
            WHERE token = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(now_secs())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::Conflict(format!("task {token} is not RUNNING")));
        }
        info!("Task {} finished: {}", token, status);
        Ok(())
    }

    /// Append a comment. Comments are totally ordered per token by the
    /// server-assigned timestamp (insert id breaks ties).
    pub async fn add_comment(&self, token: TaskToken, actor: &str, body: &str) -> StoreResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE token = ?")
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("no such task: {token}")));
        }

        sqlx::query(
            "INSERT INTO task_comments (token, actor, timestamp, body) VALUES (?, ?, ?, ?)",
        )
        .bind(token.to_string())
        .bind(actor)
        .bind(now_secs())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a terminal record as observed-with-intent-to-consume.
    pub async fn set_consumed(&self, token: TaskToken) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET consumed = 1
            WHERE token = ? AND status IN ('COMPLETED', 'FAILED', 'CANCELLED', 'DROPPED')
            "#,
        )
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Filtered listing, newest first. Comments are not populated here;
    /// fetch the full record per token for those.
    pub async fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskInfo>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1"));

        if let Some(statuses) = &filter.statuses {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in statuses {
                sep.push_bind(status.as_str());
            }
            qb.push(")");
        }
        if let Some(kinds) = &filter.kinds {
            qb.push(" AND kind IN (");
            let mut sep = qb.separated(", ");
            for kind in kinds {
                sep.push_bind(kind.clone());
            }
            qb.push(")");
        }
        if let Some(product) = &filter.product {
            qb.push(" AND product_endpoint = ").push_bind(product.clone());
        }
        if let Some(actor) = &filter.actor {
            qb.push(" AND actor = ").push_bind(actor.clone());
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(before);
        }

        let limit = filter.limit.unwrap_or(100).clamp(0, 1000);
        let offset = filter.offset.unwrap_or(0).max(0);
        qb.push(" ORDER BY created_at DESC, token ASC");
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| row.into_info(Vec::new()))
            .collect()
    }

    /// Record counts by status.
    pub async fn stats(&self) -> StoreResult<TaskStatsInfo> {
        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ALLOCATED'),
                COUNT(*) FILTER (WHERE status = 'ENQUEUED'),
                COUNT(*) FILTER (WHERE status = 'RUNNING'),
                COUNT(*) FILTER (WHERE status = 'COMPLETED'),
                COUNT(*) FILTER (WHERE status = 'FAILED'),
                COUNT(*) FILTER (WHERE status = 'CANCELLED'),
                COUNT(*) FILTER (WHERE status = 'DROPPED')
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (allocated, enqueued, running, completed, failed, cancelled, dropped) = row;
        Ok(TaskStatsInfo {
            allocated,
            enqueued,
            running,
            completed,
            failed,
            cancelled,
            dropped,
            total: allocated + enqueued + running + completed + failed + cancelled + dropped,
        })
    }

    /// Demote silent `RUNNING` records to `DROPPED`.
    ///
    /// Own-server records go stale after `stale_secs`; records owned by
    /// other servers only after `orphan_secs`, to accommodate clustered
    /// deployments.
    pub async fn reap_stale_running(
        &self,
        server_id: &str,
        stale_secs: i64,
        orphan_secs: i64,
    ) -> StoreResult<Vec<TaskToken>> {
        let now = now_secs();
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT token FROM tasks
            WHERE status = 'RUNNING'
              AND (
                    (owning_server = ?  AND last_heartbeat_at < ?)
                 OR (owning_server != ? AND last_heartbeat_at < ?)
                 OR (owning_server IS NULL AND last_heartbeat_at < ?)
              )
            "#,
        )
        .bind(server_id)
        .bind(now - stale_secs)
        .bind(server_id)
        .bind(now - orphan_secs)
        .bind(now - stale_secs)
        .fetch_all(&self.pool)
        .await?;

        let mut demoted = Vec::new();
        for (token_text,) in rows {
            let token: TaskToken = token_text
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("bad token in store: {e}")))?;
            // Re-checked per row: the task may have concluded since the scan.
            match self.finish(token, TaskStatus::Dropped).await {
                Ok(()) => demoted.push(token),
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(demoted)
    }

    /// Demote `ALLOCATED` records whose owner never pushed.
    ///
    /// `cutoff` is an epoch-seconds bound on `created_at`; the caller
    /// passes the later of (now - allocated timeout) and its own boot
    /// time, so leftovers from a previous incarnation drop on the first
    /// sweep.
    pub async fn reap_stale_allocated(&self, cutoff: i64) -> StoreResult<Vec<TaskToken>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT token FROM tasks WHERE status = 'ALLOCATED' AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut demoted = Vec::new();
        for (token_text,) in rows {
            let token: TaskToken = token_text
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("bad token in store: {e}")))?;
            let affected = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'DROPPED', finished_at = ?, owning_server = NULL
                WHERE token = ? AND status = 'ALLOCATED'
                "#,
            )
            .bind(now_secs())
            .bind(token.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if affected == 1 {
                demoted.push(token);
            }
        }
        Ok(demoted)
    }

    /// Data directories due for removal: terminal past the grace window,
    /// not yet removed.
    pub async fn data_dirs_to_remove(&self, grace_secs: i64) -> StoreResult<Vec<(TaskToken, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT token, data_dir FROM tasks
            WHERE data_dir IS NOT NULL
              AND data_dir_removed = 0
              AND status IN ('COMPLETED', 'FAILED', 'CANCELLED', 'DROPPED')
              AND finished_at IS NOT NULL
              AND finished_at < ?
            "#,
        )
        .bind(now_secs() - grace_secs)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(token_text, dir)| {
                let token: TaskToken = token_text
                    .parse()
                    .map_err(|e| StoreError::InvalidData(format!("bad token in store: {e}")))?;
                Ok((token, dir))
            })
            .collect()
    }

    pub async fn mark_data_dir_removed(&self, token: TaskToken) -> StoreResult<()> {
        sqlx::query("UPDATE tasks SET data_dir_removed = 1 WHERE token = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigStore;

    async fn setup() -> ConfigStore {
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    async fn allocate_one(store: &ConfigStore) -> TaskToken {
        let token = TaskToken::new();
        store
            .tasks()
            .allocate(token, "echo", "demo", Some("alice"), None)
            .await
            .unwrap();
        token
    }

    #[tokio::test]
    async fn test_allocate_and_get() {
        let store = setup().await;
        let token = allocate_one(&store).await;

        let info = store.tasks().get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Allocated);
        assert_eq!(info.kind, "echo");
        assert_eq!(info.actor.as_deref(), Some("alice"));
        assert!(info.comments.is_empty());

        let missing = store.tasks().get_info(TaskToken::new()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_forward_only_transitions() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        // Cannot claim an ALLOCATED task.
        assert!(!tasks.claim_running(token, "srv-1").await.unwrap());

        tasks.mark_enqueued(token, "srv-1").await.unwrap();
        // Second enqueue conflicts.
        assert!(matches!(
            tasks.mark_enqueued(token, "srv-1").await,
            Err(StoreError::Conflict(_))
        ));

        assert!(tasks.claim_running(token, "srv-1").await.unwrap());
        // Double claim loses.
        assert!(!tasks.claim_running(token, "srv-1").await.unwrap());

        tasks.finish(token, TaskStatus::Completed).await.unwrap();
        // Terminal records never transition again.
        assert!(matches!(
            tasks.finish(token, TaskStatus::Failed).await,
            Err(StoreError::Conflict(_))
        ));

        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert!(info.owning_server.is_none());
        assert!(info.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_only_while_running_under_owner() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        assert!(!tasks.heartbeat(token, "srv-1").await.unwrap());

        tasks.mark_enqueued(token, "srv-1").await.unwrap();
        tasks.claim_running(token, "srv-1").await.unwrap();
        assert!(tasks.heartbeat(token, "srv-1").await.unwrap());
        // Wrong server is a no-op.
        assert!(!tasks.heartbeat(token, "srv-2").await.unwrap());

        tasks.finish(token, TaskStatus::Completed).await.unwrap();
        assert!(!tasks.heartbeat(token, "srv-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flag_and_should_cancel_reads() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        // Not RUNNING: reads false even after the flag is set.
        assert!(tasks.request_cancel(token).await.unwrap());
        assert!(!tasks.cancel_requested(token).await.unwrap());

        tasks.mark_enqueued(token, "srv-1").await.unwrap();
        tasks.claim_running(token, "srv-1").await.unwrap();
        assert!(tasks.cancel_requested(token).await.unwrap());

        tasks.finish(token, TaskStatus::Cancelled).await.unwrap();
        // Terminal: cancel has no effect and reads false.
        assert!(!tasks.request_cancel(token).await.unwrap());
        assert!(!tasks.cancel_requested(token).await.unwrap());
    }

    #[tokio::test]
    async fn test_consumed_only_after_terminal() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        assert!(!tasks.set_consumed(token).await.unwrap());

        tasks.mark_enqueued(token, "srv-1").await.unwrap();
        tasks.claim_running(token, "srv-1").await.unwrap();
        tasks.finish(token, TaskStatus::Failed).await.unwrap();
        assert!(tasks.set_consumed(token).await.unwrap());

        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert!(info.consumed);
    }

    #[tokio::test]
    async fn test_comments_are_append_only_and_ordered() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        tasks.add_comment(token, "alice", "first").await.unwrap();
        tasks.add_comment(token, "bob", "second").await.unwrap();

        let comments = tasks.comments(token).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].body, "first");
        assert_eq!(comments[1].body, "second");
        assert!(comments[0].timestamp <= comments[1].timestamp);

        assert!(matches!(
            tasks.add_comment(TaskToken::new(), "x", "y").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = setup().await;
        let tasks = store.tasks();

        let t1 = allocate_one(&store).await;
        let t2 = TaskToken::new();
        tasks
            .allocate(t2, "store_results", "ingest", Some("bob"), Some("widgets"))
            .await
            .unwrap();
        tasks.mark_enqueued(t2, "srv-1").await.unwrap();

        let by_kind = tasks
            .list(&TaskFilter {
                kinds: Some(vec!["echo".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].token, t1);

        let by_status = tasks
            .list(&TaskFilter {
                statuses: Some(vec![TaskStatus::Enqueued]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].token, t2);

        let by_product = tasks
            .list(&TaskFilter {
                product: Some("widgets".to_string()),
                actor: Some("bob".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_product.len(), 1);
    }

    #[tokio::test]
    async fn test_reaper_demotes_stale_running() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;
        tasks.mark_enqueued(token, "srv-1").await.unwrap();
        tasks.claim_running(token, "srv-1").await.unwrap();

        // Fresh heartbeat: nothing to demote.
        let demoted = tasks.reap_stale_running("srv-1", 120, 1800).await.unwrap();
        assert!(demoted.is_empty());

        // Stale for the owner, but another server must wait for the
        // orphan window.
        let demoted = tasks.reap_stale_running("srv-2", 0, 1800).await.unwrap();
        assert!(demoted.is_empty());

        // Zero tolerance: the owner demotes it.
        let demoted = tasks.reap_stale_running("srv-1", -1, 1800).await.unwrap();
        assert_eq!(demoted, vec![token]);

        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Dropped);
        assert!(info.owning_server.is_none());
    }

    #[tokio::test]
    async fn test_reaper_demotes_never_pushed_allocations() {
        let store = setup().await;
        let tasks = store.tasks();
        let token = allocate_one(&store).await;

        let demoted = tasks.reap_stale_allocated(now_secs() + 1).await.unwrap();
        assert_eq!(demoted, vec![token]);
        let info = tasks.get_info(token).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Dropped);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = setup().await;
        let tasks = store.tasks();
        let t1 = allocate_one(&store).await;
        let _t2 = allocate_one(&store).await;
        tasks.mark_enqueued(t1, "srv-1").await.unwrap();

        let stats = tasks.stats().await.unwrap();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.total, 2);
    }
}
