mod caster;
mod client;
mod manager;

pub use caster::*;
pub use client::*;
pub use manager::*;

#[cfg(test)]
mod caster_tests;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("client is not connected: {0}")]
    ClientGone(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no such subscription: {0}")]
    NoSubscription(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type WsResult<T> = std::result::Result<T, WsError>;

/// Generic WebSocket content container.
pub type WsC = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a subscription (or an outbound broadcast) is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WsSubType {
    #[serde(rename = "folder_subscribe")]
    Folder,
    #[serde(rename = "task_subscribe")]
    Task,
    #[serde(rename = "task_type_subscribe")]
    TaskType,
    #[serde(rename = "user_subscribe")]
    User,
    #[serde(rename = "server_event")]
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub sub_type: WsSubType,
    pub key: String,
    pub when: i64,
}

/// One outbound frame. `broadcast_type` picks the subscriber set;
/// `subscribe_key` selects within it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsResponseInfo {
    pub event_tag: String,
    pub subscribe_key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub content: WsC,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broadcast_type: Option<WsSubType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relay_source: Option<String>,
    #[serde(default)]
    pub sent_time: i64,
}

/// One inbound frame: an action plus its action-specific JSON content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsRequestInfo {
    pub action: String,
    #[serde(default)]
    pub sent_at: i64,
    #[serde(default)]
    pub content: String,
}

// Inbound action strings.
pub const FOLDER_SUBSCRIBE_ACTION: &str = "folder_subscribe";
pub const TASK_SUBSCRIBE_ACTION: &str = "task_subscribe";
pub const USER_SUBSCRIBE_ACTION: &str = "user_subscribe";
pub const UNSUBSCRIBE_ACTION: &str = "unsubscribe";
pub const SCAN_DIRECTORY_ACTION: &str = "scan_directory";
pub const CANCEL_TASK_ACTION: &str = "cancel_task";
pub const REPORT_ERROR_ACTION: &str = "show_web_error";

// Subscribe-key prefixes distinguishing one task from a whole task type.
pub const TASK_ID_PREFIX: &str = "TID#";
pub const TASK_TYPE_PREFIX: &str = "TT#";

// Broadcast event tags.
pub const STARTUP_PROGRESS_EVENT: &str = "startup_progress";
pub const BACKUP_COMPLETE_EVENT: &str = "backup_complete";
pub const BACKUP_PROGRESS_EVENT: &str = "backup_progress";
pub const COPY_FILE_COMPLETE_EVENT: &str = "copy_file_complete";
pub const FOLDER_SCAN_COMPLETE_EVENT: &str = "folder_scan_complete";
pub const FILE_SCAN_COMPLETE_EVENT: &str = "file_scan_complete";
pub const SCAN_DIRECTORY_PROGRESS_EVENT: &str = "scan_directory_progress";
pub const FILE_CREATED_EVENT: &str = "file_created";
pub const FILE_UPDATED_EVENT: &str = "file_updated";
pub const FILE_MOVED_EVENT: &str = "file_moved";
pub const FILE_DELETED_EVENT: &str = "file_deleted";
pub const ZIP_PROGRESS_EVENT: &str = "create_zip_progress";
pub const ZIP_COMPLETE_EVENT: &str = "zip_complete";
pub const SERVER_GOING_DOWN_EVENT: &str = "going_down";
pub const RESTORE_STARTED_EVENT: &str = "restore_started";
pub const WEBLENS_LOADED_EVENT: &str = "weblens_loaded";
pub const ERROR_EVENT: &str = "error";
pub const REMOTE_CONNECTION_CHANGED_EVENT: &str = "remote_connection_changed";
pub const SHARE_UPDATED_EVENT: &str = "share_updated";

/// The catch-all subscribe key for server-wide events.
pub const SYSTEM_SUB_KEY: &str = "WEBLENS";

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
