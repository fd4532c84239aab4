//! Endpoint implementations for every service on the RPC surface.
//!
//! The dispatcher has already resolved identity and product by the time
//! a call lands here; handlers only enforce their per-endpoint
//! permission rule and talk to the stores.

use std::sync::Arc;
use verdict_protocol::rpc::ServerInfoPayload;
use verdict_protocol::{
    ApiError, IdentityInfo, Permission, ProductSummary, RpcResponse, ServiceCall, TaskFilter,
    TaskInfo, TaskKind, TaskParams,
};

use crate::auth::Identity;
use crate::dispatcher::RequestContext;
use crate::metrics::METRICS;
use crate::server::ServerState;

pub async fn execute(
    state: &Arc<ServerState>,
    ctx: &RequestContext,
    call: &ServiceCall,
) -> Result<RpcResponse, ApiError> {
    match call {
        // --------------------------------------------------------------
        // Task service
        // --------------------------------------------------------------
        ServiceCall::GetTaskInfo { token } => {
            let info = state.tm.get(*token).await?;
            ensure_task_visible(state, &ctx.identity, &info).await?;
            Ok(RpcResponse::Task(info))
        }

        ServiceCall::GetTasks { filter } => {
            let filter = scoped_task_filter(state, &ctx.identity, filter.clone()).await?;
            Ok(RpcResponse::Tasks(state.tm.list(&filter).await?))
        }

        ServiceCall::CancelTask { token } => {
            require_superuser(state, &ctx.identity).await?;
            Ok(RpcResponse::Bool(state.tm.cancel(*token).await?))
        }

        ServiceCall::AwaitTaskTermination { token, consume } => {
            let info = state.tm.get(*token).await?;
            ensure_actor_or_superuser(state, &ctx.identity, &info).await?;
            let status = state.tm.await_terminal(*token, *consume).await?;
            Ok(RpcResponse::TerminalStatus(status))
        }

        ServiceCall::AddTaskComment { token, body } => {
            let info = state.tm.get(*token).await?;
            ensure_task_visible(state, &ctx.identity, &info).await?;
            state
                .tm
                .add_comment(*token, &ctx.identity.username, body)
                .await?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::AllocateTask { summary, params } => {
            authorize_submission(state, ctx, params).await?;
            let token = state
                .tm
                .allocate(
                    params,
                    summary,
                    Some(ctx.identity.username.as_str()),
                    ctx.product_endpoint.as_deref(),
                )
                .await?;
            Ok(RpcResponse::Token(token))
        }

        ServiceCall::CreateTaskDataDir { token } => {
            let info = state.tm.get(*token).await?;
            ensure_actor_or_superuser(state, &ctx.identity, &info).await?;
            let dir = state.tm.create_data_dir(*token).await?;
            Ok(RpcResponse::DataDir(dir.display().to_string()))
        }

        ServiceCall::PushTask { token, params } => {
            let info = state.tm.get(*token).await?;
            ensure_actor_or_superuser(state, &ctx.identity, &info).await?;
            if info.kind != params.kind().as_str() {
                return Err(ApiError::input_malformed(format!(
                    "token {} was allocated for kind '{}', not '{}'",
                    token,
                    info.kind,
                    params.kind()
                )));
            }
            state.tm.push(*token, params).await?;
            Ok(RpcResponse::Ok)
        }

        // --------------------------------------------------------------
        // Product service
        // --------------------------------------------------------------
        ServiceCall::ListProducts => {
            let rows = state.store.products().list().await.map_err(ApiError::from)?;
            let superuser = state.auth.is_superuser(&ctx.identity).await?;
            let mut summaries: Vec<ProductSummary> = Vec::new();
            for row in rows {
                let visible = superuser
                    || state
                        .auth
                        .has_permission(
                            &ctx.identity,
                            Permission::ProductView,
                            Some(row.endpoint.as_str()),
                        )
                        .await?;
                if visible {
                    summaries.push(row.to_summary().map_err(ApiError::from)?);
                }
            }
            Ok(RpcResponse::Products(summaries))
        }

        ServiceCall::AddProduct {
            endpoint,
            display_name,
            description,
            connection,
        } => {
            require_superuser(state, &ctx.identity).await?;
            state
                .registry
                .add(endpoint, display_name, description.as_deref(), connection)
                .await?;
            Ok(RpcResponse::Product(product_summary(state, endpoint).await?))
        }

        ServiceCall::RemoveProduct { endpoint } => {
            require_superuser(state, &ctx.identity).await?;
            state.registry.remove(endpoint).await?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::EditProduct { endpoint, patch } => {
            require_superuser(state, &ctx.identity).await?;
            Ok(RpcResponse::Product(state.registry.edit(endpoint, patch).await?))
        }

        ServiceCall::GetProductStatus { endpoint } => {
            require(state, &ctx.identity, Permission::ProductView, Some(endpoint)).await?;
            state.registry.probe(endpoint).await?;
            Ok(RpcResponse::Product(product_summary(state, endpoint).await?))
        }

        // --------------------------------------------------------------
        // Auth service
        // --------------------------------------------------------------
        ServiceCall::Login { username, password } => {
            let session = state.auth.login(username, password).await?;
            Ok(RpcResponse::SessionId(session))
        }

        ServiceCall::Logout => {
            let Some(session) = ctx.session.as_deref() else {
                return Err(ApiError::input_malformed("no session to log out"));
            };
            Ok(RpcResponse::Bool(state.auth.logout(session).await?))
        }

        ServiceCall::GetPermissions { product } => {
            let permissions = state
                .auth
                .permissions_for(&ctx.identity, product.as_deref())
                .await?;
            Ok(RpcResponse::Permissions(permissions))
        }

        ServiceCall::HasPermission {
            permission,
            product,
        } => {
            let held = state
                .auth
                .has_permission(&ctx.identity, *permission, product.as_deref())
                .await?;
            Ok(RpcResponse::Bool(held))
        }

        ServiceCall::Whoami => Ok(RpcResponse::Identity(IdentityInfo {
            username: ctx.identity.username.clone(),
            groups: ctx.identity.groups.clone(),
            expires_at: ctx.identity.expires_at,
        })),

        // --------------------------------------------------------------
        // Server service
        // --------------------------------------------------------------
        ServiceCall::Ping => Ok(RpcResponse::Pong),

        ServiceCall::ServerInfo => {
            let tasks = state.store.tasks().stats().await.map_err(ApiError::from)?;
            Ok(RpcResponse::ServerInfo(ServerInfoPayload {
                version: env!("CARGO_PKG_VERSION").to_string(),
                server_id: state.config.server_id.clone(),
                uptime_secs: state.started_at.elapsed().as_secs(),
                tasks,
                metrics: METRICS.snapshot(),
            }))
        }

        ServiceCall::ListNotifications => {
            let notifications = state
                .store
                .server_meta()
                .list_notifications()
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Notifications(notifications))
        }

        ServiceCall::AddNotification {
            message,
            severity,
            expires_at,
        } => {
            require_superuser(state, &ctx.identity).await?;
            state
                .store
                .server_meta()
                .add_notification(message, severity, *expires_at)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::RemoveNotification { id } => {
            require_superuser(state, &ctx.identity).await?;
            let removed = state
                .store
                .server_meta()
                .remove_notification(*id)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(removed))
        }

        ServiceCall::ListFilterPresets { product } => {
            let presets = state
                .store
                .server_meta()
                .list_filter_presets(&ctx.identity.username, product.as_deref())
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::FilterPresets(presets))
        }

        ServiceCall::SaveFilterPreset {
            name,
            product,
            value,
        } => {
            state
                .store
                .server_meta()
                .save_filter_preset(&ctx.identity.username, product.as_deref(), name, value)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::DeleteFilterPreset { id } => {
            let deleted = state
                .store
                .server_meta()
                .delete_filter_preset(&ctx.identity.username, *id)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(deleted))
        }

        // --------------------------------------------------------------
        // Cleanup-plan service (product-scoped)
        // --------------------------------------------------------------
        ServiceCall::ListCleanupPlans { include_closed } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductView).await?;
            let plans = handle
                .result_store()
                .list_plans(*include_closed)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Plans(plans))
        }

        ServiceCall::CreateCleanupPlan {
            name,
            description,
            due_date,
        } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let plan = handle
                .result_store()
                .create_plan(name, description.as_deref(), *due_date)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Plan(plan))
        }

        ServiceCall::UpdateCleanupPlan {
            id,
            name,
            description,
            due_date,
        } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let plan = handle
                .result_store()
                .update_plan(*id, name.as_deref(), description.as_deref(), *due_date)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Plan(plan))
        }

        ServiceCall::CloseCleanupPlan { id } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let closed = handle
                .result_store()
                .close_plan(*id)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(closed))
        }

        ServiceCall::ReopenCleanupPlan { id } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let reopened = handle
                .result_store()
                .reopen_plan(*id)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(reopened))
        }

        ServiceCall::DeleteCleanupPlan { id } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let deleted = handle
                .result_store()
                .delete_plan(*id)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(deleted))
        }

        ServiceCall::SetPlan { id, report_hashes } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            handle
                .result_store()
                .set_plan_reports(*id, report_hashes)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::UnsetPlan { id, report_hashes } => {
            let handle = product_handle(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            handle
                .result_store()
                .unset_plan_reports(*id, report_hashes)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Ok)
        }

        // --------------------------------------------------------------
        // Component service (product-scoped)
        // --------------------------------------------------------------
        ServiceCall::ListComponents => {
            let endpoint = product_endpoint(ctx)?;
            require_product(state, ctx, Permission::ProductView).await?;
            let components = state
                .store
                .server_meta()
                .list_components(endpoint)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Components(components))
        }

        ServiceCall::SetComponent { component } => {
            let endpoint = product_endpoint(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            state
                .store
                .server_meta()
                .set_component(endpoint, component)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Ok)
        }

        ServiceCall::RemoveComponent { name } => {
            let endpoint = product_endpoint(ctx)?;
            require_product(state, ctx, Permission::ProductAdmin).await?;
            let removed = state
                .store
                .server_meta()
                .remove_component(endpoint, name)
                .await
                .map_err(ApiError::from)?;
            Ok(RpcResponse::Bool(removed))
        }
    }
}

// ============================================================================
// Permission helpers
// ============================================================================

async fn require_superuser(state: &ServerState, identity: &Identity) -> Result<(), ApiError> {
    if state.auth.is_superuser(identity).await? {
        Ok(())
    } else {
        Err(ApiError::unauthorized("requires SUPERUSER"))
    }
}

async fn require(
    state: &ServerState,
    identity: &Identity,
    permission: Permission,
    product: Option<&str>,
) -> Result<(), ApiError> {
    if state.auth.has_permission(identity, permission, product).await? {
        Ok(())
    } else {
        Err(ApiError::unauthorized(format!("requires {permission}")))
    }
}

async fn require_product(
    state: &ServerState,
    ctx: &RequestContext,
    permission: Permission,
) -> Result<(), ApiError> {
    require(
        state,
        &ctx.identity,
        permission,
        ctx.product_endpoint.as_deref(),
    )
    .await
}

fn product_handle(ctx: &RequestContext) -> Result<&Arc<crate::registry::ProductHandle>, ApiError> {
    ctx.product
        .as_ref()
        .ok_or_else(|| ApiError::fatal("product-scoped call without a resolved product"))
}

fn product_endpoint(ctx: &RequestContext) -> Result<&str, ApiError> {
    ctx.product_endpoint
        .as_deref()
        .ok_or_else(|| ApiError::fatal("product-scoped call without a product path"))
}

/// Task records are readable by their actor, a product admin of the
/// task's product, or a superuser.
async fn ensure_task_visible(
    state: &ServerState,
    identity: &Identity,
    info: &TaskInfo,
) -> Result<(), ApiError> {
    if info.actor.as_deref() == Some(identity.username.as_str()) {
        return Ok(());
    }
    if state.auth.is_superuser(identity).await? {
        return Ok(());
    }
    if let Some(product) = &info.product {
        if state
            .auth
            .has_permission(identity, Permission::ProductAdmin, Some(product.as_str()))
            .await?
        {
            return Ok(());
        }
    }
    Err(ApiError::unauthorized("not your task"))
}

/// Long-poll and lifecycle operations are for the actor or a superuser.
async fn ensure_actor_or_superuser(
    state: &ServerState,
    identity: &Identity,
    info: &TaskInfo,
) -> Result<(), ApiError> {
    if info.actor.as_deref() == Some(identity.username.as_str()) {
        return Ok(());
    }
    if state.auth.is_superuser(identity).await? {
        return Ok(());
    }
    Err(ApiError::unauthorized("not your task"))
}

/// Non-superusers see exactly their own tasks, unless they administer
/// the product they are filtering on.
async fn scoped_task_filter(
    state: &ServerState,
    identity: &Identity,
    mut filter: TaskFilter,
) -> Result<TaskFilter, ApiError> {
    if state.auth.is_superuser(identity).await? {
        return Ok(filter);
    }
    if let Some(product) = &filter.product {
        if state
            .auth
            .has_permission(identity, Permission::ProductAdmin, Some(product.as_str()))
            .await?
        {
            return Ok(filter);
        }
    }
    filter.actor = Some(identity.username.clone());
    Ok(filter)
}

/// Which permission a submission needs, by kind.
async fn authorize_submission(
    state: &ServerState,
    ctx: &RequestContext,
    params: &TaskParams,
) -> Result<(), ApiError> {
    match params.kind() {
        TaskKind::Echo => {
            if ctx.product_endpoint.is_some() {
                return Err(ApiError::input_malformed(
                    "echo tasks are server-wide; submit via /tasks",
                ));
            }
            require_superuser(state, &ctx.identity).await
        }
        TaskKind::StoreResults => {
            if ctx.product_endpoint.is_none() {
                return Err(ApiError::input_malformed(
                    "store_results tasks must be submitted via /<product>/tasks",
                ));
            }
            require_product(state, ctx, Permission::ProductStore).await
        }
    }
}

async fn product_summary(
    state: &ServerState,
    endpoint: &str,
) -> Result<ProductSummary, ApiError> {
    let row = state
        .store
        .products()
        .get(endpoint)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no such product: {endpoint}")))?;
    row.to_summary().map_err(ApiError::from)
}
