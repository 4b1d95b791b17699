use crate::{
    Caster, ClientIdentity, ClientManager, WsConn, WsResponseInfo, WsResult, WsSubType,
    FILE_CREATED_EVENT, WEBLENS_LOADED_EVENT,
};
use async_trait::async_trait;
use file_tree::{ContentId, FileId, FileSnapshot, InstanceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task_pool::{TaskBroadcaster, TaskId, TaskResult};

struct MockConn {
    frames: Mutex<Vec<WsResponseInfo>>,
    closed: AtomicBool,
}

impl MockConn {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn frames(&self) -> Vec<WsResponseInfo> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl WsConn for MockConn {
    async fn send_text(&self, frame: String) -> WsResult<()> {
        let parsed: WsResponseInfo = serde_json::from_str(&frame).unwrap();
        self.frames.lock().unwrap().push(parsed);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn snapshot(id: &str, parent: &str) -> FileSnapshot {
    FileSnapshot {
        id: FileId::new(id),
        portable_path: format!("USERS:{}", id),
        filename: id.to_string(),
        size: 1,
        is_dir: false,
        modify_timestamp: 1,
        content_id: ContentId::default(),
        parent_id: FileId::new(parent),
        children_ids: Vec::new(),
        past_file: false,
    }
}

async fn drain_until(conn: &Arc<MockConn>, count: usize) -> Vec<WsResponseInfo> {
    for _ in 0..100 {
        if conn.frames().len() >= count {
            return conn.frames();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} frames, got {:?}", count, conn.frames());
}

// ==================== Routing Tests ====================

#[tokio::test]
async fn test_folder_subscriber_receives_file_create() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "folder-1", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    caster.push_file_create(&snapshot("new-file", "folder-1"));

    let frames = drain_until(&conn, 1).await;
    assert_eq!(frames[0].event_tag, FILE_CREATED_EVENT);
    assert_eq!(frames[0].subscribe_key, "folder-1");
    assert!(frames[0].content.contains_key("fileInfo"));
}

#[tokio::test]
async fn test_unrelated_subscriber_hears_nothing() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "bob".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "other-folder", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    caster.push_file_create(&snapshot("new-file", "folder-1"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(conn.frames().is_empty());
}

#[tokio::test]
async fn test_frames_keep_enqueue_order() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "folder-1", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    for i in 0..20 {
        caster.push_file_create(&snapshot(&format!("f{}", i), "folder-1"));
    }

    let frames = drain_until(&conn, 20).await;
    for (i, frame) in frames.iter().enumerate() {
        let info = frame.content.get("fileInfo").unwrap();
        assert_eq!(info.get("filename").unwrap(), &format!("f{}", i));
    }
}

#[tokio::test]
async fn test_task_updates_route_by_task_key() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Task, "task-9", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    let mut result = TaskResult::new();
    result.insert("note".to_string(), serde_json::json!("done"));
    caster.push_task_update(&TaskId::new("task-9"), "scan_directory", "task_complete", result);

    let frames = drain_until(&conn, 1).await;
    assert_eq!(frames[0].task_type.as_deref(), Some("scan_directory"));
    assert_eq!(frames[0].content.get("note").unwrap(), "done");
}

#[tokio::test]
async fn test_disconnect_clears_subscriptions() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "folder-1", 0)
        .unwrap();
    assert_eq!(manager.get_subscribers(WsSubType::Folder, "folder-1").len(), 1);

    manager.client_disconnect(&client).await;
    assert!(manager.get_subscribers(WsSubType::Folder, "folder-1").is_empty());
    assert!(conn.closed.load(Ordering::Acquire));
    assert_eq!(manager.client_count(), 0);
}

// ==================== Relay Tests ====================

#[tokio::test]
async fn test_remote_clients_receive_relays_exactly_once() {
    let manager = ClientManager::new();
    manager.set_local_instance(InstanceId::new("core-1"));

    let remote_conn = MockConn::new();
    manager.client_connect(
        remote_conn.clone(),
        ClientIdentity::RemoteClient { instance_id: InstanceId::new("backup-1") },
    );

    let caster = Caster::new(manager.clone());
    caster.push_weblens_event(WEBLENS_LOADED_EVENT, crate::WsC::new());

    let frames = drain_until(&remote_conn, 1).await;
    assert_eq!(frames[0].relay_source.as_deref(), Some("core-1"));

    // A frame that already carries a relay source is not relayed again.
    let mut relayed = frames[0].clone();
    relayed.subscribe_key = "WEBLENS".to_string();
    caster.relay(relayed);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(remote_conn.frames().len(), 1);
}

// ==================== Buffered Mode Tests ====================

#[tokio::test]
async fn test_buffered_caster_holds_until_flush() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "folder-1", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    caster.disable_auto_flush();

    caster.push_file_create(&snapshot("held-1", "folder-1"));
    caster.push_file_create(&snapshot("held-2", "folder-1"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(conn.frames().is_empty());

    caster.flush();
    let frames = drain_until(&conn, 2).await;
    assert_eq!(frames.len(), 2);
}

#[tokio::test]
async fn test_close_flushes_then_drops_later_pushes() {
    let manager = ClientManager::new();
    let conn = MockConn::new();
    let client = manager.client_connect(
        conn.clone(),
        ClientIdentity::WebClient { username: "alice".to_string() },
    );
    manager
        .subscribe(&client, WsSubType::Folder, "folder-1", 0)
        .unwrap();

    let caster = Caster::new(manager.clone());
    caster.disable_auto_flush();
    caster.push_file_create(&snapshot("last-one", "folder-1"));
    caster.close();

    let frames = drain_until(&conn, 1).await;
    assert_eq!(frames.len(), 1);

    caster.push_file_create(&snapshot("too-late", "folder-1"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(conn.frames().len(), 1);
}
