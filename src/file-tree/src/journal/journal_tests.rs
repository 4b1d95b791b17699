use crate::journal::{ActionType, FileAction, Journal, JournalStore, Lifetime};
use crate::{ContentId, EventId, FileId, FileNode, InstanceId, PortablePath};
use std::sync::Arc;
use tempfile::TempDir;

const SERVER: &str = "test-server";

fn open_journal() -> Arc<Journal> {
    let store = JournalStore::open_in_memory().unwrap();
    Journal::open(store, InstanceId::new(SERVER), false).unwrap()
}

fn file_named(name: &str, parent: Option<&Arc<FileNode>>) -> Arc<FileNode> {
    let portable = match parent {
        Some(p) => p.portable_path().child(name, false).to_portable(),
        None => format!("USERS:{}", name),
    };
    FileNode::new(crate::file_id_from_path(&portable), name, parent, false)
}

fn foreign_lifetime(server: &str, ts: i64) -> Lifetime {
    Lifetime::new(FileAction {
        life_id: FileId::new("foreign-life"),
        event_id: EventId::new("e-f1"),
        timestamp: ts,
        action_type: ActionType::Create,
        origin_path: String::new(),
        destination_path: "USERS:foreign.txt".to_string(),
        parent_id: FileId::new("p"),
        size: 1,
        content_id: ContentId::default(),
        server_id: InstanceId::new(server),
    })
    .unwrap()
}

// ==================== Event Logging Tests ====================

#[tokio::test]
async fn test_log_event_persists_lifetime() {
    let journal = open_journal();
    let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);
    let file = file_named("logged.txt", Some(&root));

    let event = journal.new_event();
    event.new_create_action(&file);
    journal.log_event(&event).await;
    event.wait_logged().await;

    let lt = journal.get(&file.life_id()).unwrap();
    assert_eq!(lt.actions.len(), 1);
    assert_eq!(lt.server_id, InstanceId::new(SERVER));
}

#[tokio::test]
async fn test_empty_event_acks_without_writing() {
    let journal = open_journal();
    let event = journal.new_event();
    journal.log_event(&event).await;
    // Resolves immediately; nothing ever reaches the writer.
    event.wait_logged().await;
    assert!(journal.all_lifetimes().is_empty());
}

#[tokio::test]
async fn test_ignore_local_tracks_nothing() {
    let store = JournalStore::open_in_memory().unwrap();
    let journal = Journal::open(store, InstanceId::new(SERVER), true).unwrap();

    let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);
    let file = file_named("silent.txt", Some(&root));
    let event = journal.new_event();
    event.new_create_action(&file);
    journal.log_event(&event).await;
    event.wait_logged().await;

    assert!(journal.get(&file.life_id()).is_none());
}

#[tokio::test]
async fn test_flush_waits_for_stream_drain() {
    let journal = open_journal();
    let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);

    for i in 0..25 {
        let file = file_named(&format!("f{}.txt", i), Some(&root));
        let event = journal.new_event();
        event.new_create_action(&file);
        journal.log_event(&event).await;
    }

    journal.flush().await;
    assert_eq!(journal.all_lifetimes().len(), 25);
}

// ==================== Merge Tests ====================

#[tokio::test]
async fn test_add_rejects_foreign_server() {
    let journal = open_journal();
    let result = journal.add(vec![foreign_lifetime("other-server", 10)]);
    assert!(matches!(result, Err(crate::FsError::JournalServerMismatch(_))));
}

#[tokio::test]
async fn test_add_merges_only_unseen_events() {
    let journal = open_journal();
    let mut lt = foreign_lifetime(SERVER, 10);
    journal.add(vec![lt.clone()]).unwrap();

    lt.add(FileAction {
        life_id: lt.id.clone(),
        event_id: EventId::new("e-f2"),
        timestamp: 20,
        action_type: ActionType::Move,
        origin_path: "USERS:foreign.txt".to_string(),
        destination_path: "USERS:moved.txt".to_string(),
        parent_id: FileId::new("p"),
        size: 1,
        content_id: ContentId::default(),
        server_id: InstanceId::new(SERVER),
    });

    journal.add(vec![lt.clone()]).unwrap();
    journal.add(vec![lt.clone()]).unwrap();

    let merged = journal.get(&lt.id).unwrap();
    assert_eq!(merged.actions.len(), 2);
    assert_eq!(merged.latest_path(), "USERS:moved.txt");
}

// ==================== Query Tests ====================

#[tokio::test]
async fn test_latest_action_and_lifetimes_since() {
    let journal = open_journal();
    let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);

    let early = file_named("early.txt", Some(&root));
    let event = journal.new_event();
    event.new_create_action(&early);
    journal.log_event(&event).await;
    event.wait_logged().await;

    let cut = crate::now_millis();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let late = file_named("late.txt", Some(&root));
    let event = journal.new_event();
    event.new_create_action(&late);
    journal.log_event(&event).await;
    event.wait_logged().await;

    let latest = journal.get_latest_action().unwrap().unwrap();
    assert_eq!(latest.destination_path, "USERS:late.txt");

    let since = journal.get_lifetimes_since(cut).unwrap();
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].id, late.life_id());
}

#[tokio::test]
async fn test_actions_by_path_matches_direct_children_newest_first() {
    let journal = open_journal();
    let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);
    let dir = FileNode::new(crate::file_id_from_path("USERS:dir/"), "dir", Some(&root), true);
    root.add_child(&dir).unwrap();

    let event = journal.new_event();
    event.new_create_action(&dir);
    event.new_create_action(&file_named("one.txt", Some(&dir)));
    event.new_create_action(&file_named("two.txt", Some(&dir)));
    // A deeper file is not a direct child of dir/.
    let sub = FileNode::new(crate::file_id_from_path("USERS:dir/sub/"), "sub", Some(&dir), true);
    dir.add_child(&sub).unwrap();
    event.new_create_action(&file_named("deep.txt", Some(&sub)));
    journal.log_event(&event).await;
    event.wait_logged().await;

    let path = PortablePath::parse("USERS:dir/").unwrap();
    let actions = journal.get_actions_by_path(&path).unwrap();
    let dests: Vec<&str> = actions.iter().map(|a| a.destination_path.as_str()).collect();
    assert!(dests.contains(&"USERS:dir/one.txt"));
    assert!(dests.contains(&"USERS:dir/two.txt"));
    assert!(dests.contains(&"USERS:dir/sub/"));
    assert!(!dests.contains(&"USERS:dir/sub/deep.txt"));

    for pair in actions.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }
}

// ==================== Store Round-Trip Tests ====================

#[tokio::test]
async fn test_reopen_reloads_lifetimes() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("journal.db");

    let life_id;
    {
        let store = JournalStore::open(&db_path).unwrap();
        let journal = Journal::open(store, InstanceId::new(SERVER), false).unwrap();
        let root = FileNode::new(crate::file_id_from_path("USERS:"), "USERS", None, true);
        let file = file_named("durable.txt", Some(&root));
        life_id = file.life_id();

        let event = journal.new_event();
        event.new_create_action(&file);
        journal.log_event(&event).await;
        event.wait_logged().await;
        journal.close();
    }

    let store = JournalStore::open(&db_path).unwrap();
    let reopened = Journal::open(store, InstanceId::new(SERVER), false).unwrap();
    let lt = reopened.get(&life_id).unwrap();
    assert_eq!(lt.latest_path(), "USERS:durable.txt");
    assert!(lt.is_live());
}
