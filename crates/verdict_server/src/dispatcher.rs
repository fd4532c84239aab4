//! Request dispatcher.
//!
//! Parses the addressed path, resolves the target product and the
//! caller's identity, and hands the call to its endpoint handler with a
//! per-call context. Every invocation gets a one-line log record with
//! the service, outcome, and duration.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use verdict_protocol::{ApiError, RpcRequest, RpcResponse, SchemaStatus, ServiceCall};

use crate::auth::Identity;
use crate::handlers;
use crate::metrics::METRICS;
use crate::registry::ProductHandle;
use crate::server::ServerState;

/// Everything an endpoint handler may rely on for one call.
pub struct RequestContext {
    pub identity: Identity,
    /// Live handle when the call was addressed through a product path.
    pub product: Option<Arc<ProductHandle>>,
    pub product_endpoint: Option<String>,
    /// Bearer session id of the call (for logout).
    pub session: Option<String>,
}

/// Entry point for one RPC invocation.
pub async fn dispatch(state: &Arc<ServerState>, request: RpcRequest) -> RpcResponse {
    let started = Instant::now();
    let service = request.call.service();

    let response = match dispatch_inner(state, &request).await {
        Ok(response) => {
            info!(
                "rpc {} service={} ok in {:?}",
                request.path,
                service,
                started.elapsed()
            );
            response
        }
        Err(err) => {
            METRICS.inc_rpc_errors();
            warn!(
                "rpc {} service={} {} ({}) in {:?}",
                request.path,
                service,
                err.kind,
                err.message,
                started.elapsed()
            );
            RpcResponse::error(err)
        }
    };
    METRICS.inc_rpc_served();
    response
}

async fn dispatch_inner(
    state: &Arc<ServerState>,
    request: &RpcRequest,
) -> Result<RpcResponse, ApiError> {
    let (product_endpoint, service) = parse_path(&request.path)?;

    if request.call.service() != service {
        return Err(ApiError::input_malformed(format!(
            "call belongs to service '{}' but the path addresses '{}'",
            request.call.service(),
            service
        )));
    }
    if request.call.product_scoped() && product_endpoint.is_none() {
        return Err(ApiError::input_malformed(format!(
            "service '{service}' requires a product path"
        )));
    }
    // Only the task service is reachable at both levels.
    if product_endpoint.is_some() && matches!(service, "products" | "auth" | "server") {
        return Err(ApiError::input_malformed(format!(
            "service '{service}' is server-wide"
        )));
    }

    // Unauthenticated calls: health checks and login itself.
    let identity = match &request.call {
        ServiceCall::Ping | ServiceCall::Login { .. } => Identity {
            username: String::new(),
            groups: Vec::new(),
            expires_at: None,
            synthetic: false,
        },
        _ => {
            state
                .auth
                .resolve_identity(request.session.as_deref())
                .await?
        }
    };

    // Resolve the product handle for product-scoped paths; a product
    // that is absent or not serving yields a typed error up front.
    let product = match &product_endpoint {
        None => None,
        Some(endpoint) => {
            let row = state
                .store
                .products()
                .get(endpoint)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::not_found(format!("no such product: {endpoint}")))?;
            match state.registry.get(endpoint) {
                Some(handle) if handle.schema_status() == SchemaStatus::Ok => Some(handle),
                Some(handle) => {
                    return Err(ApiError::transient(format!(
                        "product '{}' is not serving requests (status: {})",
                        endpoint,
                        handle.schema_status()
                    )));
                }
                None => {
                    let status = row.parsed_schema_status().map_err(ApiError::from)?;
                    return Err(ApiError::transient(format!(
                        "product '{endpoint}' is not serving requests (status: {status})"
                    )));
                }
            }
        }
    };

    let ctx = RequestContext {
        identity,
        product,
        product_endpoint,
        session: request.session.clone(),
    };
    handlers::execute(state, &ctx, &request.call).await
}

/// Split `/{service}` or `/{product_endpoint}/{service}`.
fn parse_path(path: &str) -> Result<(Option<String>, &str), ApiError> {
    let unroutable = || ApiError::input_malformed(format!("unroutable path: {path}"));

    let rest = path.strip_prefix('/').ok_or_else(unroutable)?;
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        [service] if !service.is_empty() => Ok((None, *service)),
        [product, service] if !product.is_empty() && !service.is_empty() => {
            Ok((Some((*product).to_string()), *service))
        }
        _ => Err(unroutable()),
    }
}
