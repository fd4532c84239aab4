//! Notifications, filter presets, and source components.

use sqlx::SqlitePool;
use verdict_protocol::{FilterPresetInfo, NotificationInfo, SourceComponentInfo};

use crate::error::{StoreError, StoreResult};
use crate::models::{FilterPresetRow, NotificationRow, SourceComponentRow};
use crate::now_secs;

pub struct ServerMetaStore {
    pool: SqlitePool,
}

impl ServerMetaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub async fn add_notification(
        &self,
        message: &str,
        severity: &str,
        expires_at: Option<i64>,
    ) -> StoreResult<i64> {
        let id = sqlx::query(
            "INSERT INTO notifications (message, severity, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(message)
        .bind(severity)
        .bind(now_secs())
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Unexpired notifications, newest first.
    pub async fn list_notifications(&self) -> StoreResult<Vec<NotificationInfo>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, message, severity, created_at, expires_at FROM notifications
            WHERE expires_at IS NULL OR expires_at > ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(now_secs())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| NotificationInfo {
                id: r.id,
                message: r.message,
                severity: r.severity,
                created_at: r.created_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    pub async fn remove_notification(&self, id: i64) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // ========================================================================
    // Filter presets
    // ========================================================================

    pub async fn save_filter_preset(
        &self,
        owner: &str,
        product: Option<&str>,
        name: &str,
        value: &serde_json::Value,
    ) -> StoreResult<i64> {
        let value_json = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO filter_presets (owner, product_endpoint, name, value_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (owner, product_endpoint, name) DO UPDATE SET
                value_json = excluded.value_json
            "#,
        )
        .bind(owner)
        .bind(product)
        .bind(name)
        .bind(&value_json)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM filter_presets WHERE owner = ? AND product_endpoint IS ? AND name = ?",
        )
        .bind(owner)
        .bind(product)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_filter_presets(
        &self,
        owner: &str,
        product: Option<&str>,
    ) -> StoreResult<Vec<FilterPresetInfo>> {
        let rows = sqlx::query_as::<_, FilterPresetRow>(
            r#"
            SELECT id, owner, product_endpoint, name, value_json FROM filter_presets
            WHERE owner = ? AND product_endpoint IS ?
            ORDER BY name ASC
            "#,
        )
        .bind(owner)
        .bind(product)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let value = serde_json::from_str(&r.value_json)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok(FilterPresetInfo {
                    id: r.id,
                    name: r.name,
                    product: r.product_endpoint,
                    value,
                })
            })
            .collect()
    }

    /// Delete a preset, but only for its owner.
    pub async fn delete_filter_preset(&self, owner: &str, id: i64) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM filter_presets WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    // ========================================================================
    // Source components
    // ========================================================================

    pub async fn set_component(
        &self,
        product: &str,
        component: &SourceComponentInfo,
    ) -> StoreResult<()> {
        let patterns_json = serde_json::to_string(&component.patterns)?;
        sqlx::query(
            r#"
            INSERT INTO source_components (product_endpoint, name, description, patterns_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (product_endpoint, name) DO UPDATE SET
                description = excluded.description,
                patterns_json = excluded.patterns_json
            "#,
        )
        .bind(product)
        .bind(&component.name)
        .bind(&component.description)
        .bind(&patterns_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_components(&self, product: &str) -> StoreResult<Vec<SourceComponentInfo>> {
        let rows = sqlx::query_as::<_, SourceComponentRow>(
            r#"
            SELECT product_endpoint, name, description, patterns_json FROM source_components
            WHERE product_endpoint = ?
            ORDER BY name ASC
            "#,
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let patterns = serde_json::from_str(&r.patterns_json)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok(SourceComponentInfo {
                    name: r.name,
                    description: r.description,
                    patterns,
                })
            })
            .collect()
    }

    pub async fn remove_component(&self, product: &str, name: &str) -> StoreResult<bool> {
        let affected =
            sqlx::query("DELETE FROM source_components WHERE product_endpoint = ? AND name = ?")
                .bind(product)
                .bind(name)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected > 0)
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
    async fn test_notifications_expiry_filtering() {
        let store = setup().await;
        let meta = store.server_meta();

        meta.add_notification("maintenance tonight", "warning", None)
            .await
            .unwrap();
        meta.add_notification("old news", "info", Some(now_secs() - 10))
            .await
            .unwrap();

        let listed = meta.list_notifications().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message, "maintenance tonight");
    }

    #[tokio::test]
    async fn test_filter_preset_upsert_and_owner_scoping() {
        let store = setup().await;
        let meta = store.server_meta();
        let value = serde_json::json!({"severity": ["high"]});

        let id = meta
            .save_filter_preset("alice", None, "high-only", &value)
            .await
            .unwrap();
        let id2 = meta
            .save_filter_preset("alice", None, "high-only", &serde_json::json!({"severity": []}))
            .await
            .unwrap();
        assert_eq!(id, id2);

        assert_eq!(meta.list_filter_presets("alice", None).await.unwrap().len(), 1);
        assert!(meta.list_filter_presets("bob", None).await.unwrap().is_empty());

        // Only the owner can delete.
        assert!(!meta.delete_filter_preset("bob", id).await.unwrap());
        assert!(meta.delete_filter_preset("alice", id).await.unwrap());
    }

    #[tokio::test]
    async fn test_component_roundtrip() {
        let store = setup().await;
        let meta = store.server_meta();

        meta.set_component(
            "widgets",
            &SourceComponentInfo {
                name: "core".to_string(),
                description: Some("core sources".to_string()),
                patterns: vec!["src/core/*".to_string(), "-src/core/vendor/*".to_string()],
            },
        )
        .await
        .unwrap();

        let listed = meta.list_components("widgets").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].patterns.len(), 2);

        assert!(meta.remove_component("widgets", "core").await.unwrap());
        assert!(meta.list_components("widgets").await.unwrap().is_empty());
    }
}
