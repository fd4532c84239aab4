//! RPC surface for the Verdict server.
//!
//! The server binds a ROUTER socket and serves JSON request/response
//! envelopes. Clients address a service through a URL-style path:
//! `/{service}` for server-wide services or
//! `/{product_endpoint}/{service}` for product-scoped ones. The
//! dispatcher checks that the call matches the addressed service before
//! resolving identity and permissions.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::types::{
    CleanupPlanInfo, ConnectionSpec, FilterPresetInfo, IdentityInfo, NotificationInfo, Permission,
    ProductPatch, ProductSummary, SourceComponentInfo, TaskFilter, TaskInfo, TaskParams,
    TaskStatus, TaskToken,
};

/// One RPC invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// `/{service}` or `/{product_endpoint}/{service}`.
    pub path: String,
    /// Bearer session id; absent for `login` and anonymous deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub call: ServiceCall,
}

/// Every method on the RPC surface, grouped by service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServiceCall {
    // ------------------------------------------------------------------
    // Task service (server-wide): /tasks
    // ------------------------------------------------------------------
    GetTaskInfo {
        token: TaskToken,
    },
    GetTasks {
        #[serde(default)]
        filter: TaskFilter,
    },
    CancelTask {
        token: TaskToken,
    },
    /// Long-poll until the task reaches a terminal status. With
    /// `consume`, the terminal record is marked consumed on return.
    AwaitTaskTermination {
        token: TaskToken,
        #[serde(default)]
        consume: bool,
    },
    AddTaskComment {
        token: TaskToken,
        body: String,
    },
    /// Reserve a token for a task. Diagnostic `echo` bodies are
    /// server-wide; product-scoped kinds take their product from the
    /// request path. The record stays ALLOCATED until `PushTask`.
    AllocateTask {
        summary: String,
        params: TaskParams,
    },
    /// Create (idempotently) the task's private data directory so a
    /// co-located client can stage bulk inputs before pushing.
    CreateTaskDataDir {
        token: TaskToken,
    },
    /// Serialize and enqueue the payload for an ALLOCATED token.
    PushTask {
        token: TaskToken,
        params: TaskParams,
    },

    // ------------------------------------------------------------------
    // Product service (server-wide): /products
    // ------------------------------------------------------------------
    ListProducts,
    AddProduct {
        endpoint: String,
        display_name: String,
        #[serde(default)]
        description: Option<String>,
        connection: ConnectionSpec,
    },
    RemoveProduct {
        endpoint: String,
    },
    EditProduct {
        endpoint: String,
        patch: ProductPatch,
    },
    GetProductStatus {
        endpoint: String,
    },

    // ------------------------------------------------------------------
    // Auth service (server-wide): /auth
    // ------------------------------------------------------------------
    Login {
        username: String,
        password: String,
    },
    Logout,
    GetPermissions {
        #[serde(default)]
        product: Option<String>,
    },
    HasPermission {
        permission: Permission,
        #[serde(default)]
        product: Option<String>,
    },
    Whoami,

    // ------------------------------------------------------------------
    // Server service (server-wide): /server
    // ------------------------------------------------------------------
    Ping,
    ServerInfo,
    ListNotifications,
    AddNotification {
        message: String,
        severity: String,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    RemoveNotification {
        id: i64,
    },
    ListFilterPresets {
        #[serde(default)]
        product: Option<String>,
    },
    SaveFilterPreset {
        name: String,
        #[serde(default)]
        product: Option<String>,
        value: serde_json::Value,
    },
    DeleteFilterPreset {
        id: i64,
    },

    // ------------------------------------------------------------------
    // Cleanup-plan service (product-scoped): /<product>/cleanup_plans
    // ------------------------------------------------------------------
    ListCleanupPlans {
        #[serde(default)]
        include_closed: bool,
    },
    CreateCleanupPlan {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        due_date: Option<i64>,
    },
    UpdateCleanupPlan {
        id: i64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        due_date: Option<i64>,
    },
    CloseCleanupPlan {
        id: i64,
    },
    ReopenCleanupPlan {
        id: i64,
    },
    DeleteCleanupPlan {
        id: i64,
    },
    SetPlan {
        id: i64,
        report_hashes: Vec<String>,
    },
    UnsetPlan {
        id: i64,
        report_hashes: Vec<String>,
    },

    // ------------------------------------------------------------------
    // Component service (product-scoped): /<product>/components
    // ------------------------------------------------------------------
    ListComponents,
    SetComponent {
        component: SourceComponentInfo,
    },
    RemoveComponent {
        name: String,
    },
}

impl ServiceCall {
    /// Service this call belongs to; must match the addressed path.
    pub fn service(&self) -> &'static str {
        use ServiceCall::*;
        match self {
            GetTaskInfo { .. } | GetTasks { .. } | CancelTask { .. }
            | AwaitTaskTermination { .. } | AddTaskComment { .. } | AllocateTask { .. }
            | CreateTaskDataDir { .. } | PushTask { .. } => "tasks",

            ListProducts | AddProduct { .. } | RemoveProduct { .. } | EditProduct { .. }
            | GetProductStatus { .. } => "products",

            Login { .. } | Logout | GetPermissions { .. } | HasPermission { .. } | Whoami => {
                "auth"
            }

            Ping | ServerInfo | ListNotifications | AddNotification { .. }
            | RemoveNotification { .. } | ListFilterPresets { .. } | SaveFilterPreset { .. }
            | DeleteFilterPreset { .. } => "server",

            ListCleanupPlans { .. } | CreateCleanupPlan { .. } | UpdateCleanupPlan { .. }
            | CloseCleanupPlan { .. } | ReopenCleanupPlan { .. } | DeleteCleanupPlan { .. }
            | SetPlan { .. } | UnsetPlan { .. } => "cleanup_plans",

            ListComponents | SetComponent { .. } | RemoveComponent { .. } => "components",
        }
    }

    /// Whether this call's service only exists under a product path.
    pub fn product_scoped(&self) -> bool {
        matches!(self.service(), "cleanup_plans" | "components")
    }
}

/// Counts of task records by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatsInfo {
    pub allocated: i64,
    pub enqueued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub dropped: i64,
    pub total: i64,
}

/// Snapshot of the server's in-memory counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_dropped: u64,
    pub rpc_served: u64,
    pub rpc_errors: u64,
    pub db_errors: u64,
}

/// `serverInfo` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfoPayload {
    pub version: String,
    pub server_id: String,
    pub uptime_secs: u64,
    pub tasks: TaskStatsInfo,
    pub metrics: MetricsSnapshot,
}

/// RPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RpcResponse {
    Ok,
    Bool(bool),
    Pong,
    Token(TaskToken),
    DataDir(String),
    Task(TaskInfo),
    Tasks(Vec<TaskInfo>),
    TerminalStatus(TaskStatus),
    Products(Vec<ProductSummary>),
    Product(ProductSummary),
    SessionId(String),
    Identity(IdentityInfo),
    Permissions(Vec<Permission>),
    Plan(CleanupPlanInfo),
    Plans(Vec<CleanupPlanInfo>),
    Notifications(Vec<NotificationInfo>),
    FilterPresets(Vec<FilterPresetInfo>),
    Components(Vec<SourceComponentInfo>),
    ServerInfo(ServerInfoPayload),
    Error(ApiError),
}

impl RpcResponse {
    pub fn error(err: ApiError) -> Self {
        Self::Error(err)
    }
}
