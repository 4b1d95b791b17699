use crate::{
    ClientManager, WsC, WsResponseInfo, WsSubType, FILE_CREATED_EVENT, FILE_DELETED_EVENT,
    FILE_MOVED_EVENT, FILE_UPDATED_EVENT, SHARE_UPDATED_EVENT, SYSTEM_SUB_KEY,
};
use file_tree::FileSnapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task_pool::{TaskBroadcaster, TaskId, TaskResult};

const CASTER_QUEUE_DEPTH: usize = 100;
const AUTO_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// A single-producer fan-out queue bound to the client manager. Pushes are
/// cheap and non-blocking; one drainer task serializes all sends, so frames
/// from one caster reach the wire in enqueue order.
///
/// In buffered mode (uploads) frames coalesce in memory until a flush; an
/// auto-flusher drains the buffer on an interval once enabled. A closed
/// caster accepts one sentinel frame to wake its drainer, then exits.
pub struct Caster {
    enabled: AtomicBool,
    buffered: AtomicBool,
    tx: tokio::sync::mpsc::Sender<WsResponseInfo>,
    buffer: Mutex<Vec<WsResponseInfo>>,
}

impl Caster {
    pub fn new(manager: Arc<ClientManager>) -> Arc<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<WsResponseInfo>(CASTER_QUEUE_DEPTH);

        let caster = Arc::new(Self {
            enabled: AtomicBool::new(true),
            buffered: AtomicBool::new(false),
            tx,
            buffer: Mutex::new(Vec::new()),
        });

        let drainer = caster.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if !drainer.is_enabled() && msg.event_tag.is_empty() {
                    break;
                }
                manager.send(msg).await;
            }
            trace!("caster message worker exiting");
        });

        caster
    }

    /// A caster that starts in buffered mode with the auto-flusher running.
    pub fn new_buffered(manager: Arc<ClientManager>) -> Arc<Self> {
        let caster = Self::new(manager);
        caster.buffered.store(true, Ordering::Release);
        caster.clone().enable_auto_flush();
        caster
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered.load(Ordering::Acquire)
    }

    /// Hold frames in memory instead of sending. Used for the duration of
    /// an upload so folder watchers see coalesced updates.
    pub fn disable_auto_flush(&self) {
        self.buffered.store(true, Ordering::Release);
    }

    pub fn enable_auto_flush(self: Arc<Self>) {
        self.buffered.store(false, Ordering::Release);
        let caster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTO_FLUSH_INTERVAL);
            loop {
                ticker.tick().await;
                if !caster.is_enabled() {
                    break;
                }
                caster.flush();
            }
        });
    }

    /// Drain the coalescing buffer onto the outbound queue.
    pub fn flush(&self) {
        let pending: Vec<WsResponseInfo> = std::mem::take(&mut *self.buffer.lock().unwrap());
        for msg in pending {
            self.enqueue(msg);
        }
    }

    /// Flush, disable, and wake the drainer with a sentinel so it exits.
    pub fn close(&self) {
        if !self.is_enabled() {
            warn!("caster double close");
            return;
        }
        self.buffered.store(false, Ordering::Release);
        self.flush();
        self.disable();
        let _ = self.tx.try_send(WsResponseInfo::default());
    }

    fn enqueue(&self, msg: WsResponseInfo) {
        // Broadcast degradation must never stall the task that is pushing.
        if let Err(err) = self.tx.try_send(msg) {
            warn!("caster queue full, dropping frame: {}", err);
        }
    }

    fn push(&self, msg: WsResponseInfo) {
        if !self.is_enabled() {
            return;
        }
        if self.is_buffered() {
            self.buffer.lock().unwrap().push(msg);
            return;
        }
        self.enqueue(msg);
    }

    // ==================== Frame constructors ====================

    pub fn push_weblens_event(&self, event_tag: &str, content: WsC) {
        self.push(WsResponseInfo {
            event_tag: event_tag.to_string(),
            subscribe_key: SYSTEM_SUB_KEY.to_string(),
            content,
            broadcast_type: Some(WsSubType::System),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    pub fn push_file_create(&self, new_file: &FileSnapshot) {
        let mut content = WsC::new();
        content.insert("fileInfo".to_string(), serde_json::json!(new_file));
        self.push(WsResponseInfo {
            event_tag: FILE_CREATED_EVENT.to_string(),
            subscribe_key: new_file.parent_id.to_string(),
            content,
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    /// File updates go to watchers of the file itself and of its parent
    /// folder.
    pub fn push_file_update(&self, updated: &FileSnapshot, media: Option<serde_json::Value>) {
        let mut content = WsC::new();
        content.insert("fileInfo".to_string(), serde_json::json!(updated));
        if let Some(media) = media {
            content.insert("mediaData".to_string(), media);
        }

        self.push(WsResponseInfo {
            event_tag: FILE_UPDATED_EVENT.to_string(),
            subscribe_key: updated.id.to_string(),
            content: content.clone(),
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });

        if updated.parent_id.is_empty() {
            return;
        }
        self.push(WsResponseInfo {
            event_tag: FILE_UPDATED_EVENT.to_string(),
            subscribe_key: updated.parent_id.to_string(),
            content,
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    /// Both the old and the new parent's watchers hear about a move.
    pub fn push_file_move(&self, pre: &FileSnapshot, post: &FileSnapshot) {
        let mut content = WsC::new();
        content.insert("fileInfo".to_string(), serde_json::json!(post));

        self.push(WsResponseInfo {
            event_tag: FILE_MOVED_EVENT.to_string(),
            subscribe_key: pre.parent_id.to_string(),
            content: content.clone(),
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
        self.push(WsResponseInfo {
            event_tag: FILE_MOVED_EVENT.to_string(),
            subscribe_key: post.parent_id.to_string(),
            content,
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    pub fn push_file_delete(&self, deleted: &FileSnapshot) {
        let mut content = WsC::new();
        content.insert("fileId".to_string(), serde_json::json!(deleted.id));
        self.push(WsResponseInfo {
            event_tag: FILE_DELETED_EVENT.to_string(),
            subscribe_key: deleted.parent_id.to_string(),
            content,
            broadcast_type: Some(WsSubType::Folder),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    pub fn push_share_update(&self, username: &str, share_info: serde_json::Value) {
        let mut content = WsC::new();
        content.insert("newShareInfo".to_string(), share_info);
        self.push(WsResponseInfo {
            event_tag: SHARE_UPDATED_EVENT.to_string(),
            subscribe_key: username.to_string(),
            content,
            broadcast_type: Some(WsSubType::User),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    /// Re-broadcast a frame received from another instance, keeping its
    /// relay source intact.
    pub fn relay(&self, msg: WsResponseInfo) {
        if !self.is_enabled() {
            return;
        }
        self.enqueue(msg);
    }
}

impl TaskBroadcaster for Caster {
    fn push_task_update(&self, task_id: &TaskId, job_name: &str, event: &str, result: TaskResult) {
        if !self.is_enabled() {
            return;
        }
        let content: WsC = result
            .into_iter()
            .collect();
        self.push(WsResponseInfo {
            event_tag: event.to_string(),
            subscribe_key: task_id.to_string(),
            task_type: Some(job_name.to_string()),
            content,
            broadcast_type: Some(WsSubType::Task),
            sent_time: crate::now_unix(),
            ..Default::default()
        });
    }

    fn push_pool_update(&self, task_id: &TaskId, job_name: &str, event: &str, result: TaskResult) {
        self.push_task_update(task_id, job_name, event, result);
    }
}
