use crate::journal::{ActionType, FileAction};
use crate::{new_event_id, now_millis, ContentId, EventId, FileId, FileNode, InstanceId, PortablePath};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A batch of actions emitted atomically by one logical tree operation. A
/// single upload may create many actions; a directory move produces one
/// action per descendant.
///
/// Timestamps are taken at action construction and bumped to stay strictly
/// increasing within the event, so replay keeps the mutation order even when
/// two actions land on the same millisecond.
pub struct FileEvent {
    pub event_id: EventId,
    pub event_begin: i64,
    pub server_id: InstanceId,

    actions: Mutex<Vec<FileAction>>,
    last_stamp: AtomicI64,

    logged_tx: watch::Sender<bool>,
    logged_rx: watch::Receiver<bool>,
}

impl FileEvent {
    pub fn new(server_id: InstanceId) -> Arc<Self> {
        let (logged_tx, logged_rx) = watch::channel(false);
        let now = now_millis();
        Arc::new(Self {
            event_id: new_event_id(),
            event_begin: now,
            server_id,
            actions: Mutex::new(Vec::new()),
            last_stamp: AtomicI64::new(0),
            logged_tx,
            logged_rx,
        })
    }

    fn next_stamp(&self) -> i64 {
        let now = now_millis();
        let prev = self.last_stamp.load(Ordering::Acquire);
        let stamp = now.max(prev + 1);
        self.last_stamp.store(stamp, Ordering::Release);
        stamp
    }

    fn push(&self, action: FileAction) {
        self.actions.lock().unwrap().push(action);
    }

    pub fn new_create_action(&self, file: &Arc<FileNode>) {
        let parent_id = file
            .parent()
            .map(|p| p.life_id())
            .unwrap_or_else(|| file.parent_id());
        self.push(FileAction {
            life_id: file.life_id(),
            event_id: self.event_id.clone(),
            timestamp: self.next_stamp(),
            action_type: ActionType::Create,
            origin_path: String::new(),
            destination_path: file.portable_path().to_portable(),
            parent_id,
            size: file.size(),
            content_id: file.content_id(),
            server_id: self.server_id.clone(),
        });
    }

    pub fn new_move_action(
        &self,
        life_id: FileId,
        origin: &PortablePath,
        destination: &PortablePath,
        parent_id: FileId,
        size: i64,
    ) {
        self.push(FileAction {
            life_id,
            event_id: self.event_id.clone(),
            timestamp: self.next_stamp(),
            action_type: ActionType::Move,
            origin_path: origin.to_portable(),
            destination_path: destination.to_portable(),
            parent_id,
            size,
            content_id: ContentId::default(),
            server_id: self.server_id.clone(),
        });
    }

    pub fn new_delete_action(&self, life_id: FileId, origin: &PortablePath, size: i64) {
        self.push(FileAction {
            life_id,
            event_id: self.event_id.clone(),
            timestamp: self.next_stamp(),
            action_type: ActionType::Delete,
            origin_path: origin.to_portable(),
            destination_path: String::new(),
            parent_id: FileId::default(),
            size,
            content_id: ContentId::default(),
            server_id: self.server_id.clone(),
        });
    }

    pub fn new_size_change_action(&self, file: &Arc<FileNode>) {
        let portable = file.portable_path().to_portable();
        let parent_id = file
            .parent()
            .map(|p| p.life_id())
            .unwrap_or_else(|| file.parent_id());
        self.push(FileAction {
            life_id: file.life_id(),
            event_id: self.event_id.clone(),
            timestamp: self.next_stamp(),
            action_type: ActionType::SizeChange,
            origin_path: portable.clone(),
            destination_path: portable,
            parent_id,
            size: file.size(),
            content_id: ContentId::default(),
            server_id: self.server_id.clone(),
        });
    }

    /// A restore opens a fresh lifetime for the recovered file; the origin
    /// records the path the content was restored from.
    pub fn new_restore_action(&self, file: &Arc<FileNode>, origin: &PortablePath) {
        let parent_id = file
            .parent()
            .map(|p| p.life_id())
            .unwrap_or_else(|| file.parent_id());
        self.push(FileAction {
            life_id: file.life_id(),
            event_id: self.event_id.clone(),
            timestamp: self.next_stamp(),
            action_type: ActionType::Restore,
            origin_path: origin.to_portable(),
            destination_path: file.portable_path().to_portable(),
            parent_id,
            size: file.size(),
            content_id: file.content_id(),
            server_id: self.server_id.clone(),
        });
    }

    pub fn actions(&self) -> Vec<FileAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn action_count(&self) -> usize {
        self.actions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().unwrap().is_empty()
    }

    /// Close the logged fence. Called exactly once by the journal, even when
    /// the durable write failed, so waiters are never deadlocked.
    pub(crate) fn mark_logged(&self) {
        let _ = self.logged_tx.send(true);
    }

    /// Wait until the journal has durably handled this event. Returning from
    /// here happens-after the journal write, so state that depends on the
    /// event being persisted may be read safely.
    pub async fn wait_logged(&self) {
        let mut rx = self.logged_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod event_tests {
    use super::*;
    use crate::file_id_from_path;

    #[test]
    fn test_timestamps_strictly_increase() {
        let event = FileEvent::new(InstanceId::new("srv"));
        let root = FileNode::new(file_id_from_path("USERS:"), "USERS", None, true);
        for i in 0..32 {
            let f = FileNode::new(
                file_id_from_path(&format!("USERS:f{}", i)),
                &format!("f{}", i),
                Some(&root),
                false,
            );
            event.new_create_action(&f);
        }

        let actions = event.actions();
        for pair in actions.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_wait_logged_returns_after_mark() {
        let event = FileEvent::new(InstanceId::new("srv"));
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait_logged().await })
        };
        event.mark_logged();
        waiter.await.unwrap();
        // A second wait returns immediately.
        event.wait_logged().await;
    }
}
