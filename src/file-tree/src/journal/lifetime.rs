use crate::journal::{ActionType, FileAction};
use crate::{ContentId, EventId, FileId, FsError, FsResult, InstanceId};
use serde::{Deserialize, Serialize};

/// The ordered history of one logical file across create, move, delete, and
/// restore. The lifetime id is the file id at the time of the opening action
/// and survives later renames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifetime {
    pub id: FileId,
    pub server_id: InstanceId,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub live_file_path: String,
    #[serde(skip_serializing_if = "ContentId::is_empty", default)]
    pub content_id: ContentId,
    pub actions: Vec<FileAction>,
}

impl Lifetime {
    pub fn new(opening: FileAction) -> FsResult<Self> {
        if !opening.action_type.opens_lifetime() {
            return Err(FsError::Internal(format!(
                "lifetime must open with a create or restore action, got {}",
                opening.action_type
            )));
        }

        Ok(Self {
            id: opening.life_id.clone(),
            server_id: opening.server_id.clone(),
            live_file_path: opening.destination_path.clone(),
            content_id: opening.content_id.clone(),
            actions: vec![opening],
        })
    }

    /// Append an action, keeping the live path current. The action's life id
    /// is overwritten with this lifetime's id.
    pub fn add(&mut self, mut action: FileAction) {
        action.life_id = self.id.clone();
        self.live_file_path = action.destination_path.clone();
        self.actions.push(action);
    }

    pub fn latest_action(&self) -> &FileAction {
        // A lifetime is never constructed empty.
        self.actions.last().unwrap()
    }

    pub fn latest_path(&self) -> &str {
        &self.live_file_path
    }

    /// A live lifetime still has a file on the real filesystem; the most
    /// recent action of a deleted file has no destination.
    pub fn is_live(&self) -> bool {
        !self.latest_action().destination_path.is_empty()
    }

    pub fn has_event(&self, event_id: &EventId) -> bool {
        self.actions.iter().any(|a| &a.event_id == event_id)
    }

    pub fn sort_actions(&mut self) {
        self.actions.sort_by_key(|a| a.timestamp);
        self.live_file_path = self.latest_action().destination_path.clone();
    }

    /// Merge actions from an incoming copy of this lifetime, used when a
    /// backup server replays core history. Only actions with unseen event
    /// ids are added; the result is re-sorted by timestamp. Returns whether
    /// anything changed.
    pub fn merge(&mut self, incoming: &Lifetime) -> bool {
        let mut changed = false;
        for action in &incoming.actions {
            if !self.has_event(&action.event_id) {
                self.actions.push(action.clone());
                changed = true;
            }
        }
        if changed {
            self.sort_actions();
            if self.content_id.is_empty() && !incoming.content_id.is_empty() {
                self.content_id = incoming.content_id.clone();
            }
        }
        changed
    }

    pub fn first_timestamp(&self) -> i64 {
        self.actions.first().map(|a| a.timestamp).unwrap_or(0)
    }

    pub fn latest_timestamp(&self) -> i64 {
        self.latest_action().timestamp
    }
}

#[cfg(test)]
mod lifetime_tests {
    use super::*;

    fn action(ty: ActionType, ts: i64, event: &str, dest: &str) -> FileAction {
        FileAction {
            life_id: FileId::new("life-1"),
            event_id: EventId::new(event),
            timestamp: ts,
            action_type: ty,
            origin_path: String::new(),
            destination_path: dest.to_string(),
            parent_id: FileId::new("parent"),
            size: 10,
            content_id: ContentId::default(),
            server_id: InstanceId::new("srv"),
        }
    }

    #[test]
    fn test_must_open_with_create_or_restore() {
        let bad = action(ActionType::Move, 1, "e1", "USERS:a/f.txt");
        assert!(Lifetime::new(bad).is_err());

        let create = action(ActionType::Create, 1, "e1", "USERS:a/f.txt");
        let lt = Lifetime::new(create).unwrap();
        assert!(lt.is_live());

        let restore = action(ActionType::Restore, 5, "e2", "USERS:a/f2.txt");
        assert!(Lifetime::new(restore).is_ok());
    }

    #[test]
    fn test_add_tracks_live_path() {
        let mut lt = Lifetime::new(action(ActionType::Create, 1, "e1", "USERS:a/f.txt")).unwrap();
        lt.add(action(ActionType::Move, 2, "e2", "USERS:b/f.txt"));
        assert_eq!(lt.latest_path(), "USERS:b/f.txt");

        lt.add(action(ActionType::Delete, 3, "e3", ""));
        assert!(!lt.is_live());
    }

    #[test]
    fn test_merge_skips_seen_events_and_resorts() {
        let mut local = Lifetime::new(action(ActionType::Create, 1, "e1", "USERS:a/f.txt")).unwrap();

        let mut incoming = local.clone();
        incoming.add(action(ActionType::Delete, 9, "e3", ""));
        incoming.add(action(ActionType::Move, 5, "e2", "USERS:b/f.txt"));

        assert!(local.merge(&incoming));
        let stamps: Vec<i64> = local.actions.iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps, vec![1, 5, 9]);
        assert!(!local.is_live());

        // Second merge of the same actions is a no-op.
        assert!(!local.merge(&incoming));
    }
}
