//! Canonical data types for tasks, products, and permissions.
//!
//! These are the wire-facing forms: the store keeps its own row structs
//! and converts at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::defaults;

// ============================================================================
// Task token
// ============================================================================

/// Opaque 128-bit random task identifier.
///
/// Rendered as 32 lowercase hex characters; the dashed UUID form is
/// never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskToken(Uuid);

impl TaskToken {
    /// Generate a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TaskToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for TaskToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Serialize for TaskToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Task status
// ============================================================================

/// Lifecycle status of a task record.
///
/// Transitions are forward-only; see [`TaskStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Allocated,
    Enqueued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Dropped,
}

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Allocated,
        TaskStatus::Enqueued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Dropped,
    ];

    pub const TERMINAL: &'static [TaskStatus] = &[
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Dropped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allocated => "ALLOCATED",
            Self::Enqueued => "ENQUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Dropped => "DROPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Dropped
        )
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// The reaper's demotions (`ALLOCATED -> DROPPED` for never-pushed
    /// records, `RUNNING -> DROPPED` for silent ones) are the only paths
    /// that skip the normal order.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Allocated => matches!(next, Self::Enqueued | Self::Dropped),
            Self::Enqueued => matches!(next, Self::Running),
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::Cancelled | Self::Dropped
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOCATED" => Ok(Self::Allocated),
            "ENQUEUED" => Ok(Self::Enqueued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "DROPPED" => Ok(Self::Dropped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ============================================================================
// Task kinds
// ============================================================================

/// The closed set of task kinds this deployment knows how to run.
///
/// Kind tags are code-defined, never user-supplied; they are the
/// dispatch key on the queue envelope and the filter/metrics dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Diagnostic round-trip task: sleeps, optionally fails on request.
    Echo,
    /// Ingest analyzer result files from the task data directory into a
    /// product's result store.
    StoreResults,
}

impl TaskKind {
    pub const ALL: &'static [TaskKind] = &[TaskKind::Echo, TaskKind::StoreResults];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::StoreResults => "store_results",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "echo" => Some(Self::Echo),
            "store_results" => Some(Self::StoreResults),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters for the `echo` diagnostic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoParams {
    /// Total time to spend before finishing.
    pub delay_ms: u64,
    /// Cancellation-check granularity.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// When set, the task raises this message as an error after the delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_with: Option<String>,
}

fn default_check_interval_ms() -> u64 {
    10
}

/// Parameters for the `store_results` ingestion task.
///
/// The analyzer result files themselves travel through the task data
/// directory; only the run metadata rides the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResultsParams {
    /// Name of the analysis run the reports belong to.
    pub run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema-validated task parameters, one variant per kind.
///
/// On the RPC surface this serializes internally tagged on `kind`; on
/// the queue envelope the kind travels in the header and only the bare
/// parameter record is encoded (see `to_payload`/`from_payload`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParams {
    Echo(EchoParams),
    StoreResults(StoreResultsParams),
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Echo(_) => TaskKind::Echo,
            Self::StoreResults(_) => TaskKind::StoreResults,
        }
    }

    /// Encode the parameter record for the queue envelope.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Echo(p) => serde_json::to_vec(p),
            Self::StoreResults(p) => serde_json::to_vec(p),
        }
    }

    /// Decode a parameter record dispatched on the kind tag.
    pub fn from_payload(kind: TaskKind, payload: &[u8]) -> serde_json::Result<Self> {
        match kind {
            TaskKind::Echo => serde_json::from_slice(payload).map(Self::Echo),
            TaskKind::StoreResults => serde_json::from_slice(payload).map(Self::StoreResults),
        }
    }
}

// ============================================================================
// Task wire forms
// ============================================================================

/// A single task comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskComment {
    pub actor: String,
    /// Epoch seconds, UTC. Server-assigned.
    pub timestamp: i64,
    pub body: String,
}

/// Full task record as returned by the task service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub token: TaskToken,
    pub kind: String,
    pub summary: String,
    pub actor: Option<String>,
    pub product: Option<String>,
    pub status: TaskStatus,
    pub created_at: i64,
    pub enqueued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested: bool,
    pub owning_server: Option<String>,
    pub consumed: bool,
    pub comments: Vec<TaskComment>,
}

/// Filter for task listings. All fields are conjunctive; `None` matches
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<TaskStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Inclusive lower bound on `created_at`, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<i64>,
    /// Exclusive upper bound on `created_at`, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

// ============================================================================
// Products
// ============================================================================

/// How a product's result store is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum ConnectionSpec {
    Sqlite {
        path: String,
    },
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    },
}

impl ConnectionSpec {
    pub fn engine_name(&self) -> &'static str {
        match self {
            Self::Sqlite { .. } => "sqlite",
            Self::Postgres { .. } => "postgresql",
        }
    }

    /// Location string safe to show to clients (no credentials).
    pub fn redacted_location(&self) -> String {
        match self {
            Self::Sqlite { path } => path.clone(),
            Self::Postgres {
                host,
                port,
                database,
                ..
            } => format!("{host}:{port}/{database}"),
        }
    }
}

/// Health of a mounted product's result-store schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaStatus {
    Ok,
    NeedsUpgrade,
    Broken,
    Disconnected,
}

impl SchemaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NeedsUpgrade => "needs_upgrade",
            Self::Broken => "broken",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SchemaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "needs_upgrade" => Ok(Self::NeedsUpgrade),
            "broken" => Ok(Self::Broken),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(format!("unknown schema status: {other}")),
        }
    }
}

/// Product row as shown to clients. Never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSummary {
    pub endpoint: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub engine: String,
    pub location: String,
    pub schema_status: SchemaStatus,
}

/// Mutable product fields for `editProduct`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSpec>,
}

/// Validate a product endpoint name for use as a URL path segment.
pub fn validate_endpoint_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 64 {
        return Err("endpoint name must be 1-64 characters".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("endpoint name may only contain [A-Za-z0-9_-]".to_string());
    }
    if defaults::RESERVED_ENDPOINTS.contains(&name) {
        return Err(format!("'{name}' is a reserved endpoint name"));
    }
    Ok(())
}

// ============================================================================
// Permissions
// ============================================================================

/// Closed set of permission names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Superuser,
    ProductAdmin,
    ProductAccess,
    ProductStore,
    ProductView,
}

impl Permission {
    pub const ALL: &'static [Permission] = &[
        Permission::Superuser,
        Permission::ProductAdmin,
        Permission::ProductAccess,
        Permission::ProductStore,
        Permission::ProductView,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superuser => "SUPERUSER",
            Self::ProductAdmin => "PRODUCT_ADMIN",
            Self::ProductAccess => "PRODUCT_ACCESS",
            Self::ProductStore => "PRODUCT_STORE",
            Self::ProductView => "PRODUCT_VIEW",
        }
    }

    /// Direct implication edges. The authorization engine takes the
    /// transitive closure over these.
    pub fn implied(self) -> &'static [Permission] {
        match self {
            Self::Superuser => &[
                Permission::ProductAdmin,
                Permission::ProductAccess,
                Permission::ProductStore,
                Permission::ProductView,
            ],
            Self::ProductAdmin => &[
                Permission::ProductAccess,
                Permission::ProductStore,
                Permission::ProductView,
            ],
            Self::ProductStore => &[Permission::ProductView],
            _ => &[],
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPERUSER" => Ok(Self::Superuser),
            "PRODUCT_ADMIN" => Ok(Self::ProductAdmin),
            "PRODUCT_ACCESS" => Ok(Self::ProductAccess),
            "PRODUCT_STORE" => Ok(Self::ProductStore),
            "PRODUCT_VIEW" => Ok(Self::ProductView),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Authenticated identity as reported by `whoami`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub username: String,
    pub groups: Vec<String>,
    /// Session expiry, epoch seconds. Absent for the synthetic identity
    /// used when authentication is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

// ============================================================================
// Cleanup plans
// ============================================================================

/// Product-scoped triage group of report hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPlanInfo {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    pub report_hashes: Vec<String>,
}

// ============================================================================
// Server-wide extras
// ============================================================================

/// Server-wide announcement shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationInfo {
    pub id: i64,
    pub message: String,
    pub severity: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Per-user saved filter blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPresetInfo {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    pub value: serde_json::Value,
}

/// Named path-glob group used to slice a product's reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceComponentInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Glob patterns; a leading `-` marks an exclusion.
    pub patterns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = TaskToken::new();
        let text = token.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));

        let parsed: TaskToken = text.parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_token_serde_as_string() {
        let token = TaskToken::new();
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{token}\""));

        let parsed: TaskToken = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_status_transitions_forward_only() {
        use TaskStatus::*;

        assert!(Allocated.can_transition_to(Enqueued));
        assert!(Allocated.can_transition_to(Dropped));
        assert!(Enqueued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Dropped));

        // No reverse or terminal-escaping transitions.
        assert!(!Enqueued.can_transition_to(Allocated));
        assert!(!Running.can_transition_to(Enqueued));
        for terminal in TaskStatus::TERMINAL {
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn test_status_str_roundtrip() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
        assert!("QUEUED".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_kind_tags() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::from_tag(kind.as_str()), Some(*kind));
        }
        assert_eq!(TaskKind::from_tag("mystery"), None);
    }

    #[test]
    fn test_params_roundtrip_by_kind() {
        let params = TaskParams::Echo(EchoParams {
            delay_ms: 50,
            check_interval_ms: 10,
            fail_with: None,
        });
        let payload = params.to_payload().unwrap();
        let back = TaskParams::from_payload(TaskKind::Echo, &payload).unwrap();
        assert_eq!(back, params);

        // The wrong kind tag must not silently decode.
        assert!(TaskParams::from_payload(TaskKind::StoreResults, &payload).is_err());
    }

    #[test]
    fn test_permission_implication_edges() {
        assert!(Permission::Superuser
            .implied()
            .contains(&Permission::ProductView));
        assert!(Permission::ProductAdmin
            .implied()
            .contains(&Permission::ProductStore));
        assert_eq!(Permission::ProductStore.implied(), &[Permission::ProductView]);
        assert!(Permission::ProductView.implied().is_empty());
    }

    #[test]
    fn test_endpoint_name_validation() {
        assert!(validate_endpoint_name("my-product_1").is_ok());
        assert!(validate_endpoint_name("products").is_err());
        assert!(validate_endpoint_name("tasks").is_err());
        assert!(validate_endpoint_name("").is_err());
        assert!(validate_endpoint_name("has space").is_err());
    }

    #[test]
    fn test_connection_spec_redaction() {
        let spec = ConnectionSpec::Postgres {
            host: "db.internal".to_string(),
            port: 5432,
            user: "verdict".to_string(),
            password: "hunter2".to_string(),
            database: "results".to_string(),
        };
        let shown = spec.redacted_location();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("db.internal:5432/results"));
    }
}
