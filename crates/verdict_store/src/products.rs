//! Product rows in the configuration store.
//!
//! Only the row lives here; the result store behind it is opened and
//! closed by the product registry and is never deleted by this layer.

use sqlx::SqlitePool;
use tracing::info;
use verdict_protocol::{ConnectionSpec, ProductPatch, SchemaStatus};

use crate::error::{StoreError, StoreResult};
use crate::models::ProductRow;

const PRODUCT_COLUMNS: &str =
    "endpoint, display_name, description, connection_json, schema_status";

pub struct ProductStore {
    pool: SqlitePool,
}

impl ProductStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        endpoint: &str,
        display_name: &str,
        description: Option<&str>,
        connection: &ConnectionSpec,
    ) -> StoreResult<()> {
        let connection_json = serde_json::to_string(connection)?;
        let result = sqlx::query(
            r#"
            INSERT INTO products (endpoint, display_name, description, connection_json, schema_status)
            VALUES (?, ?, ?, ?, 'disconnected')
            "#,
        )
        .bind(endpoint)
        .bind(display_name)
        .bind(description)
        .bind(connection_json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Product '{}' registered", endpoint);
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict(
                format!("product '{endpoint}' already exists"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, endpoint: &str) -> StoreResult<Option<ProductRow>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE endpoint = ?"
        ))
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list(&self) -> StoreResult<Vec<ProductRow>> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY endpoint ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Apply an edit patch. Returns the updated row.
    pub async fn update(&self, endpoint: &str, patch: &ProductPatch) -> StoreResult<ProductRow> {
        let Some(row) = self.get(endpoint).await? else {
            return Err(StoreError::NotFound(format!("no such product: {endpoint}")));
        };

        let display_name = patch
            .display_name
            .clone()
            .unwrap_or_else(|| row.display_name.clone());
        let description = patch
            .description
            .clone()
            .or_else(|| row.description.clone());
        let connection_json = match &patch.connection {
            Some(spec) => serde_json::to_string(spec)?,
            None => row.connection_json.clone(),
        };

        sqlx::query(
            r#"
            UPDATE products
            SET display_name = ?, description = ?, connection_json = ?
            WHERE endpoint = ?
            "#,
        )
        .bind(&display_name)
        .bind(&description)
        .bind(&connection_json)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;

        self.get(endpoint)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no such product: {endpoint}")))
    }

    pub async fn set_schema_status(
        &self,
        endpoint: &str,
        status: SchemaStatus,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE products SET schema_status = ? WHERE endpoint = ?")
            .bind(status.as_str())
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the row. The result store itself is untouched.
    pub async fn delete(&self, endpoint: &str) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM products WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            info!("Product '{}' removed from configuration store", endpoint);
        }
        Ok(affected > 0)
    }
}
