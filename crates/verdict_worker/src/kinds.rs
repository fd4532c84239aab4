//! Task-kind implementations.
//!
//! One run function per kind, dispatched on the envelope's kind tag.
//! Implementations are cooperative: they check `should_cancel` on every
//! iteration of their outer loop and raise the cancellation sentinel
//! promptly.

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;
use verdict_protocol::{EchoParams, SchemaStatus, StoreResultsParams, TaskParams};
use verdict_store::ResultStore;

use crate::context::{TaskContext, TaskError, TaskResult};

/// Dispatch a decoded parameter record to its implementation.
pub async fn run_task(ctx: &TaskContext, params: &TaskParams) -> TaskResult {
    match params {
        TaskParams::Echo(p) => run_echo(ctx, p).await,
        TaskParams::StoreResults(p) => run_store_results(ctx, p).await,
    }
}

/// Diagnostic round-trip: sleep in small increments, honoring
/// cancellation, then optionally fail on request.
async fn run_echo(ctx: &TaskContext, params: &EchoParams) -> TaskResult {
    let interval = params.check_interval_ms.max(1);
    let mut elapsed = 0u64;

    while elapsed < params.delay_ms {
        if ctx.should_cancel().await? {
            return Err(TaskError::Cancelled);
        }
        ctx.heartbeat().await?;

        let step = interval.min(params.delay_ms - elapsed);
        tokio::time::sleep(Duration::from_millis(step)).await;
        elapsed += step;
    }

    if let Some(message) = &params.fail_with {
        return Err(TaskError::Failed(anyhow!("{message}")));
    }
    Ok(())
}

/// One report file entry as placed in the task data directory.
#[derive(Debug, Deserialize)]
struct ReportEntry {
    hash: String,
    body: serde_json::Value,
}

/// Ingest analyzer result files from the task data directory into the
/// product's result store.
///
/// The client stages a `reports.json` (array of `{hash, body}` objects)
/// in the data directory before pushing the task.
async fn run_store_results(ctx: &TaskContext, params: &StoreResultsParams) -> TaskResult {
    let product = ctx
        .product()
        .ok_or_else(|| anyhow!("store_results requires a product-scoped task"))?
        .to_string();
    let data_dir = ctx
        .data_dir()
        .ok_or_else(|| anyhow!("store_results requires a populated data directory"))?;

    let path = data_dir.join("reports.json");
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<ReportEntry> =
        serde_json::from_slice(&raw).context("reports.json is not a valid report array")?;

    let row = ctx
        .config_store()
        .products()
        .get(&product)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| anyhow!("product '{product}' no longer exists"))?;
    let spec = row.connection().map_err(anyhow::Error::from)?;

    let results = ResultStore::connect(&spec)
        .await
        .map_err(anyhow::Error::from)?;
    let schema_status = results
        .ensure_schema()
        .await
        .map_err(anyhow::Error::from)?;
    if schema_status != SchemaStatus::Ok {
        results.close().await;
        return Err(TaskError::Failed(anyhow!(
            "result store for '{product}' is {schema_status}"
        )));
    }

    let total = entries.len();
    for (index, entry) in entries.iter().enumerate() {
        if ctx.should_cancel().await? {
            results.close().await;
            return Err(TaskError::Cancelled);
        }
        results
            .store_report(&entry.hash, &params.run_name, &entry.body.to_string())
            .await
            .map_err(anyhow::Error::from)?;
        if index % 100 == 0 {
            ctx.heartbeat().await?;
        }
    }
    results.close().await;

    info!("Stored {} reports for run '{}'", total, params.run_name);
    ctx.add_comment(&format!(
        "stored {} reports for run '{}'",
        total, params.run_name
    ))
    .await?;
    Ok(())
}
