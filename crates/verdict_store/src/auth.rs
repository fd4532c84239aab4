//! Accounts, sessions, and permission grants.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;
use verdict_protocol::Permission;

use crate::error::{StoreError, StoreResult};
use crate::models::{AccountRow, GrantRow, SessionRow};
use crate::now_secs;

pub struct AuthStore {
    pool: SqlitePool,
}

impl AuthStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub async fn upsert_account(
        &self,
        username: &str,
        password_salt: &str,
        password_digest: &str,
        groups: &[String],
    ) -> StoreResult<()> {
        let groups_json = serde_json::to_string(groups)?;
        sqlx::query(
            r#"
            INSERT INTO accounts (username, password_salt, password_digest, groups_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (username) DO UPDATE SET
                password_salt = excluded.password_salt,
                password_digest = excluded.password_digest,
                groups_json = excluded.groups_json
            "#,
        )
        .bind(username)
        .bind(password_salt)
        .bind(password_digest)
        .bind(groups_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, username: &str) -> StoreResult<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT username, password_salt, password_digest, groups_json FROM accounts WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub async fn create_session(
        &self,
        session_id: &str,
        username: &str,
        expires_at: i64,
    ) -> StoreResult<()> {
        let now = now_secs();
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, username, issued_at, last_used_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(username)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        info!("Session issued for {}", username);
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT session_id, username, issued_at, last_used_at, expires_at FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Refresh a session on use, sliding the expiry forward but never
    /// past the absolute bound.
    pub async fn touch_session(&self, session_id: &str, new_expires_at: i64) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_used_at = ?, expires_at = ? WHERE session_id = ?")
            .bind(now_secs())
            .bind(new_expires_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn purge_expired_sessions(&self) -> StoreResult<u64> {
        let affected = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    // ========================================================================
    // Permission grants
    // ========================================================================

    pub async fn add_grant(
        &self,
        permission: Permission,
        product_endpoint: Option<&str>,
        grantee: &str,
        is_group: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (permission, product_endpoint, grantee, is_group)
            VALUES (?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(permission.as_str())
        .bind(product_endpoint)
        .bind(grantee)
        .bind(is_group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_grant(
        &self,
        permission: Permission,
        product_endpoint: Option<&str>,
        grantee: &str,
        is_group: bool,
    ) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            DELETE FROM permissions
            WHERE permission = ? AND product_endpoint IS ? AND grantee = ? AND is_group = ?
            "#,
        )
        .bind(permission.as_str())
        .bind(product_endpoint)
        .bind(grantee)
        .bind(is_group)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Every grant reaching an identity: direct grants to the username
    /// plus grants to any of its groups. Implication closure is the
    /// authorization engine's business.
    pub async fn grants_for_identity(
        &self,
        username: &str,
        groups: &[String],
    ) -> StoreResult<Vec<GrantRow>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT permission, product_endpoint, grantee, is_group FROM permissions \
             WHERE (is_group = 0 AND grantee = ",
        );
        qb.push_bind(username);
        qb.push(")");
        if !groups.is_empty() {
            qb.push(" OR (is_group = 1 AND grantee IN (");
            let mut sep = qb.separated(", ");
            for group in groups {
                sep.push_bind(group.clone());
            }
            qb.push("))");
        }

        let rows: Vec<GrantRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Delete product-scoped grants when a product is removed.
    pub async fn remove_grants_for_product(&self, endpoint: &str) -> StoreResult<u64> {
        let affected = sqlx::query("DELETE FROM permissions WHERE product_endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

impl GrantRow {
    pub fn parsed_permission(&self) -> StoreResult<Permission> {
        self.permission
            .parse()
            .map_err(|e: String| StoreError::InvalidData(e))
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

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = setup().await;
        let auth = store.auth();
        let now = now_secs();

        auth.create_session("sess-1", "alice", now + 3600).await.unwrap();
        let session = auth.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(session.username, "alice");

        auth.touch_session("sess-1", now + 7200).await.unwrap();
        let session = auth.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(session.expires_at, now + 7200);

        assert!(auth.delete_session("sess-1").await.unwrap());
        assert!(auth.get_session("sess-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_sessions() {
        let store = setup().await;
        let auth = store.auth();
        let now = now_secs();

        auth.create_session("live", "alice", now + 3600).await.unwrap();
        auth.create_session("dead", "bob", now - 1).await.unwrap();

        assert_eq!(auth.purge_expired_sessions().await.unwrap(), 1);
        assert!(auth.get_session("live").await.unwrap().is_some());
        assert!(auth.get_session("dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grants_union_direct_and_group() {
        let store = setup().await;
        let auth = store.auth();

        auth.add_grant(Permission::ProductView, Some("widgets"), "alice", false)
            .await
            .unwrap();
        auth.add_grant(Permission::ProductAdmin, Some("widgets"), "admins", true)
            .await
            .unwrap();
        auth.add_grant(Permission::Superuser, None, "root", false)
            .await
            .unwrap();

        let grants = auth
            .grants_for_identity("alice", &["admins".to_string()])
            .await
            .unwrap();
        assert_eq!(grants.len(), 2);

        let grants = auth.grants_for_identity("alice", &[]).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].parsed_permission().unwrap(), Permission::ProductView);
    }

    #[tokio::test]
    async fn test_product_grant_cleanup() {
        let store = setup().await;
        let auth = store.auth();
        auth.add_grant(Permission::ProductAccess, Some("widgets"), "alice", false)
            .await
            .unwrap();
        auth.add_grant(Permission::Superuser, None, "alice", false)
            .await
            .unwrap();

        assert_eq!(auth.remove_grants_for_product("widgets").await.unwrap(), 1);
        let grants = auth.grants_for_identity("alice", &[]).await.unwrap();
        assert_eq!(grants.len(), 1);
    }
}
