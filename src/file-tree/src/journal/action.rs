use crate::{ContentId, EventId, FileId, InstanceId};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One atomic mutation within a file's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "fileCreate")]
    Create,
    #[serde(rename = "fileMove")]
    Move,
    #[serde(rename = "fileDelete")]
    Delete,
    #[serde(rename = "fileSizeChange")]
    SizeChange,
    #[serde(rename = "fileRestore")]
    Restore,
}

impl ActionType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "fileCreate" => ActionType::Create,
            "fileMove" => ActionType::Move,
            "fileDelete" => ActionType::Delete,
            "fileSizeChange" => ActionType::SizeChange,
            "fileRestore" => ActionType::Restore,
            _ => ActionType::SizeChange,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "fileCreate",
            ActionType::Move => "fileMove",
            ActionType::Delete => "fileDelete",
            ActionType::SizeChange => "fileSizeChange",
            ActionType::Restore => "fileRestore",
        }
    }

    /// Create and Restore both open a new lifetime.
    pub fn opens_lifetime(&self) -> bool {
        matches!(self, ActionType::Create | ActionType::Restore)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ActionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ActionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str().unwrap_or("fileSizeChange");
        Ok(ActionType::from_str(s))
    }
}

/// An immutable journal entry. Origin and destination are portable path
/// strings; an empty destination means the file no longer exists, an empty
/// origin means it did not exist before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAction {
    pub life_id: FileId,
    pub event_id: EventId,
    pub timestamp: i64,
    pub action_type: ActionType,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub origin_path: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub destination_path: String,
    pub parent_id: FileId,
    pub size: i64,
    #[serde(skip_serializing_if = "ContentId::is_empty", default)]
    pub content_id: ContentId,
    pub server_id: InstanceId,
}

impl FileAction {
    pub fn is_size_change(&self) -> bool {
        self.action_type == ActionType::SizeChange
    }
}
