//! Product registry.
//!
//! In-memory map from product endpoint to a live handle owning the
//! result-store connection pool. The map is consulted on every
//! product-scoped dispatch; mutations go through `add`/`remove`/`edit`
//! and always keep the configuration-store row authoritative.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use verdict_protocol::{
    validate_endpoint_name, ApiError, ConnectionSpec, ProductPatch, ProductSummary, SchemaStatus,
};
use verdict_store::{ConfigStore, ResultStore};

/// A mounted product: connection pool plus its last known schema status.
pub struct ProductHandle {
    pub endpoint: String,
    store: ResultStore,
    schema_status: RwLock<SchemaStatus>,
}

impl ProductHandle {
    pub fn result_store(&self) -> &ResultStore {
        &self.store
    }

    pub fn schema_status(&self) -> SchemaStatus {
        *self.schema_status.read().expect("schema status lock poisoned")
    }

    fn set_schema_status(&self, status: SchemaStatus) {
        *self.schema_status.write().expect("schema status lock poisoned") = status;
    }
}

pub struct ProductRegistry {
    store: ConfigStore,
    handles: RwLock<HashMap<String, Arc<ProductHandle>>>,
    /// How long `remove` waits for outstanding handle references.
    unmount_timeout: Duration,
}

impl ProductRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            handles: RwLock::new(HashMap::new()),
            unmount_timeout: Duration::from_secs(10),
        }
    }

    /// Mount every configured product at boot. Failures mark the row
    /// (`disconnected`/`needs_upgrade`/`broken`) without blocking the
    /// rest of the server.
    pub async fn mount_all(&self) -> Result<()> {
        let rows = self.store.products().list().await?;
        for row in rows {
            let endpoint = row.endpoint.clone();
            match self.mount(&endpoint).await {
                Ok(status) => info!("Mounted product '{}' ({})", endpoint, status),
                Err(err) => error!("Failed to mount product '{}': {}", endpoint, err),
            }
        }
        Ok(())
    }

    /// Open (or reopen) one product's result store and refresh its
    /// schema status.
    pub async fn mount(&self, endpoint: &str) -> Result<SchemaStatus, ApiError> {
        let products = self.store.products();
        let Some(row) = products.get(endpoint).await.map_err(ApiError::from)? else {
            return Err(ApiError::not_found(format!("no such product: {endpoint}")));
        };
        let spec = row.connection().map_err(ApiError::from)?;

        // Drop any previous handle before reconnecting.
        let previous = self
            .handles
            .write()
            .expect("registry lock poisoned")
            .remove(endpoint);
        if let Some(previous) = previous {
            self.wait_and_close(previous).await;
        }

        let status = match ResultStore::connect(&spec).await {
            Ok(result_store) => match result_store.ensure_schema().await {
                Ok(status) => {
                    if status != SchemaStatus::Broken {
                        let handle = Arc::new(ProductHandle {
                            endpoint: endpoint.to_string(),
                            store: result_store,
                            schema_status: RwLock::new(status),
                        });
                        self.handles
                            .write()
                            .expect("registry lock poisoned")
                            .insert(endpoint.to_string(), handle);
                    } else {
                        result_store.close().await;
                    }
                    status
                }
                Err(err) => {
                    warn!("Schema probe failed for '{}': {}", endpoint, err);
                    result_store.close().await;
                    SchemaStatus::Broken
                }
            },
            Err(err) => {
                warn!("Connection failed for '{}': {}", endpoint, err);
                SchemaStatus::Disconnected
            }
        };

        products
            .set_schema_status(endpoint, status)
            .await
            .map_err(ApiError::from)?;
        Ok(status)
    }

    /// Register a new product and attempt to mount it.
    pub async fn add(
        &self,
        endpoint: &str,
        display_name: &str,
        description: Option<&str>,
        connection: &ConnectionSpec,
    ) -> Result<SchemaStatus, ApiError> {
        validate_endpoint_name(endpoint).map_err(ApiError::input_malformed)?;
        self.store
            .products()
            .insert(endpoint, display_name, description, connection)
            .await
            .map_err(ApiError::from)?;
        self.mount(endpoint).await
    }

    /// Unmount and delete a product row. The underlying result store is
    /// never touched: its file and contents remain byte-identical.
    pub async fn remove(&self, endpoint: &str) -> Result<(), ApiError> {
        let handle = self
            .handles
            .write()
            .expect("registry lock poisoned")
            .remove(endpoint);
        let existed_row = self
            .store
            .products()
            .delete(endpoint)
            .await
            .map_err(ApiError::from)?;
        self.store
            .auth()
            .remove_grants_for_product(endpoint)
            .await
            .map_err(ApiError::from)?;

        if let Some(handle) = handle {
            self.wait_and_close(handle).await;
        } else if !existed_row {
            return Err(ApiError::not_found(format!("no such product: {endpoint}")));
        }
        Ok(())
    }

    /// Apply an edit patch; a connection change triggers a remount.
    pub async fn edit(
        &self,
        endpoint: &str,
        patch: &ProductPatch,
    ) -> Result<ProductSummary, ApiError> {
        let reconnect = patch.connection.is_some();
        let row = self
            .store
            .products()
            .update(endpoint, patch)
            .await
            .map_err(ApiError::from)?;
        if reconnect {
            self.mount(endpoint).await?;
        }
        let row = self
            .store
            .products()
            .get(endpoint)
            .await
            .map_err(ApiError::from)?
            .unwrap_or(row);
        row.to_summary().map_err(ApiError::from)
    }

    /// Reference-counted handle lookup.
    pub fn get(&self, endpoint: &str) -> Option<Arc<ProductHandle>> {
        self.handles
            .read()
            .expect("registry lock poisoned")
            .get(endpoint)
            .cloned()
    }

    /// Live connection probe, refreshing the cached status.
    pub async fn probe(&self, endpoint: &str) -> Result<SchemaStatus, ApiError> {
        let Some(handle) = self.get(endpoint) else {
            // Not mounted; report the stored status.
            let row = self
                .store
                .products()
                .get(endpoint)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::not_found(format!("no such product: {endpoint}")))?;
            return row.parsed_schema_status().map_err(ApiError::from);
        };

        let status = match handle.result_store().ping().await {
            Ok(()) => handle.schema_status(),
            Err(_) => SchemaStatus::Disconnected,
        };
        handle.set_schema_status(status);
        self.store
            .products()
            .set_schema_status(endpoint, status)
            .await
            .map_err(ApiError::from)?;
        Ok(status)
    }

    /// Wait for outstanding references to drain, then close the pool.
    async fn wait_and_close(&self, handle: Arc<ProductHandle>) {
        let deadline = Instant::now() + self.unmount_timeout;
        while Arc::strong_count(&handle) > 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if Arc::strong_count(&handle) > 1 {
            warn!(
                "Unmounting '{}' with {} outstanding references",
                handle.endpoint,
                Arc::strong_count(&handle) - 1
            );
        }
        handle.result_store().close().await;
        info!("Product '{}' unmounted", handle.endpoint);
    }

    pub async fn close_all(&self) {
        let handles: Vec<Arc<ProductHandle>> = {
            let mut map = self.handles.write().expect("registry lock poisoned");
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.result_store().close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ConfigStore, ProductRegistry) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        let registry = ProductRegistry::new(store.clone());
        (dir, store, registry)
    }

    fn sqlite_spec(dir: &TempDir, name: &str) -> ConnectionSpec {
        ConnectionSpec::Sqlite {
            path: dir.path().join(name).display().to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_mounts_and_initializes() {
        let (dir, _store, registry) = setup().await;
        let status = registry
            .add("widgets", "Widgets", None, &sqlite_spec(&dir, "w.sqlite"))
            .await
            .unwrap();
        assert_eq!(status, SchemaStatus::Ok);
        assert!(registry.get("widgets").is_some());
        assert!(dir.path().join("w.sqlite").exists());
    }

    #[tokio::test]
    async fn test_reserved_endpoint_rejected() {
        let (dir, _store, registry) = setup().await;
        let err = registry
            .add("products", "X", None, &sqlite_spec(&dir, "x.sqlite"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, verdict_protocol::ErrorKind::InputMalformed);
    }

    #[tokio::test]
    async fn test_remove_preserves_result_store_bytes() {
        let (dir, _store, registry) = setup().await;
        registry
            .add("widgets", "Widgets", None, &sqlite_spec(&dir, "w.sqlite"))
            .await
            .unwrap();

        // Write a report so the file has content worth preserving.
        let handle = registry.get("widgets").unwrap();
        handle
            .result_store()
            .store_report("h1", "run", "{}")
            .await
            .unwrap();
        drop(handle);

        registry.remove("widgets").await.unwrap();
        assert!(registry.get("widgets").is_none());

        // The file survives removal and still holds the report.
        let spec = sqlite_spec(&dir, "w.sqlite");
        let reopened = ResultStore::connect(&spec).await.unwrap();
        assert_eq!(reopened.ensure_schema().await.unwrap(), SchemaStatus::Ok);
        assert_eq!(reopened.report_count().await.unwrap(), 1);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_product() {
        let (_dir, _store, registry) = setup().await;
        let err = registry.remove("nope").await.unwrap_err();
        assert_eq!(err.kind, verdict_protocol::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mount_all_skips_unreachable() {
        let (dir, store, registry) = setup().await;
        store
            .products()
            .insert(
                "good",
                "Good",
                None,
                &sqlite_spec(&dir, "good.sqlite"),
            )
            .await
            .unwrap();
        store
            .products()
            .insert(
                "bad",
                "Bad",
                None,
                &ConnectionSpec::Postgres {
                    host: "127.0.0.1".to_string(),
                    port: 1, // nothing listens here
                    user: "u".to_string(),
                    password: "p".to_string(),
                    database: "d".to_string(),
                },
            )
            .await
            .unwrap();

        registry.mount_all().await.unwrap();
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());

        let bad = store.products().get("bad").await.unwrap().unwrap();
        assert_eq!(
            bad.parsed_schema_status().unwrap(),
            SchemaStatus::Disconnected
        );
    }
}
