//! Row structs for the configuration store.
//!
//! Statuses and connection specs are stored as text and parsed at the
//! boundary; a row that fails to parse is surfaced as `InvalidData`
//! rather than silently skipped.

use sqlx::FromRow;
use verdict_protocol::{
    ConnectionSpec, ProductSummary, SchemaStatus, TaskComment, TaskInfo, TaskStatus, TaskToken,
};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub token: String,
    pub kind: String,
    pub summary: String,
    pub actor: Option<String>,
    pub product_endpoint: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub enqueued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested: bool,
    pub owning_server: Option<String>,
    pub consumed: bool,
    pub data_dir: Option<String>,
    pub data_dir_removed: bool,
}

impl TaskRow {
    pub fn parsed_status(&self) -> StoreResult<TaskStatus> {
        self.status
            .parse()
            .map_err(|e: String| StoreError::InvalidData(e))
    }

    pub fn parsed_token(&self) -> StoreResult<TaskToken> {
        self.token
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("bad token in store: {e}")))
    }

    pub fn into_info(self, comments: Vec<TaskComment>) -> StoreResult<TaskInfo> {
        let status = self.parsed_status()?;
        let token = self.parsed_token()?;
        Ok(TaskInfo {
            token,
            kind: self.kind,
            summary: self.summary,
            actor: self.actor,
            product: self.product_endpoint,
            status,
            created_at: self.created_at,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            last_heartbeat_at: self.last_heartbeat_at,
            finished_at: self.finished_at,
            cancel_requested: self.cancel_requested,
            owning_server: self.owning_server,
            consumed: self.consumed,
            comments,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommentRow {
    pub actor: String,
    pub timestamp: i64,
    pub body: String,
}

impl From<CommentRow> for TaskComment {
    fn from(row: CommentRow) -> Self {
        TaskComment {
            actor: row.actor,
            timestamp: row.timestamp,
            body: row.body,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: i64,
    pub token: String,
    pub envelope: Vec<u8>,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProductRow {
    pub endpoint: String,
    pub display_name: String,
    pub description: Option<String>,
    pub connection_json: String,
    pub schema_status: String,
}

impl ProductRow {
    pub fn connection(&self) -> StoreResult<ConnectionSpec> {
        Ok(serde_json::from_str(&self.connection_json)?)
    }

    pub fn parsed_schema_status(&self) -> StoreResult<SchemaStatus> {
        self.schema_status
            .parse()
            .map_err(|e: String| StoreError::InvalidData(e))
    }

    pub fn to_summary(&self) -> StoreResult<ProductSummary> {
        let connection = self.connection()?;
        Ok(ProductSummary {
            endpoint: self.endpoint.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            engine: connection.engine_name().to_string(),
            location: connection.redacted_location(),
            schema_status: self.parsed_schema_status()?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub username: String,
    pub password_salt: String,
    pub password_digest: String,
    pub groups_json: String,
}

impl AccountRow {
    pub fn groups(&self) -> StoreResult<Vec<String>> {
        Ok(serde_json::from_str(&self.groups_json)?)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub session_id: String,
    pub username: String,
    pub issued_at: i64,
    pub last_used_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct GrantRow {
    pub permission: String,
    pub product_endpoint: Option<String>,
    pub grantee: String,
    pub is_group: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    pub message: String,
    pub severity: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FilterPresetRow {
    pub id: i64,
    pub owner: String,
    pub product_endpoint: Option<String>,
    pub name: String,
    pub value_json: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceComponentRow {
    pub product_endpoint: String,
    pub name: String,
    pub description: Option<String>,
    pub patterns_json: String,
}
