use crate::journal::{ActionType, Journal, JournalStore};
use crate::{FileTree, FsError, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_journal() -> Arc<Journal> {
    let store = JournalStore::open_in_memory().unwrap();
    Journal::open(store, InstanceId::new("test-server"), false).unwrap()
}

fn test_tree(tmp: &TempDir) -> FileTree {
    FileTree::new(tmp.path().join("users"), "USERS", test_journal()).unwrap()
}

async fn settle(tree: &FileTree) {
    tree.journal().flush().await;
}

// ==================== Create Tests ====================

#[tokio::test]
async fn test_touch_and_mkdir_land_on_disk_and_in_index() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let dir = tree.mkdir(&root, "docs", None).await.unwrap();
    let file = tree.touch(&dir, "a.txt", None).await.unwrap();

    assert!(dir.abs_path().is_dir());
    assert!(file.abs_path().is_file());

    // Index lookups return the same nodes.
    assert!(Arc::ptr_eq(&tree.get(&dir.id()).unwrap(), &dir));
    assert!(Arc::ptr_eq(&tree.get(&file.id()).unwrap(), &file));
    assert_eq!(file.portable_path().to_portable(), "USERS:docs/a.txt");
}

#[tokio::test]
async fn test_duplicate_path_rejected() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    tree.touch(&root, "same.txt", None).await.unwrap();
    assert!(matches!(
        tree.touch(&root, "same.txt", None).await,
        Err(FsError::FileAlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_create_records_lifetime() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let file = tree.touch(&root, "new.txt", None).await.unwrap();
    settle(&tree).await;

    let lt = tree.journal().get(&file.life_id()).unwrap();
    assert_eq!(lt.actions.len(), 1);
    assert_eq!(lt.actions[0].action_type, ActionType::Create);
    assert_eq!(lt.latest_path(), "USERS:new.txt");
    assert!(lt.is_live());
}

// ==================== Move Tests ====================

#[tokio::test]
async fn test_move_between_directories() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let dir1 = tree.mkdir(&root, "dir1", None).await.unwrap();
    let dir2 = tree.mkdir(&root, "dir2", None).await.unwrap();
    let file = tree.touch(&dir1, "file", None).await.unwrap();
    let life_id = file.life_id();
    let old_id = file.id();

    tree.move_file(&file, &dir2, "file", false, None).await.unwrap();
    settle(&tree).await;

    assert!(dir1.get_child("file").is_err());
    assert!(dir2.get_child("file").is_ok());
    assert!(file.abs_path().ends_with("dir2/file"));

    // The path-derived id changed, the lifetime id did not.
    assert_ne!(file.id(), old_id);
    assert_eq!(file.life_id(), life_id);
    assert!(tree.get(&old_id).is_none());
    assert!(Arc::ptr_eq(&tree.get(&file.id()).unwrap(), &file));

    let lt = tree.journal().get(&life_id).unwrap();
    let kinds: Vec<ActionType> = lt.actions.iter().map(|a| a.action_type).collect();
    assert_eq!(kinds[..2], [ActionType::Create, ActionType::Move]);
    assert_eq!(lt.latest_path(), "USERS:dir2/file");
}

#[tokio::test]
async fn test_move_rewrites_descendants() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let outer = tree.mkdir(&root, "outer", None).await.unwrap();
    let inner = tree.mkdir(&outer, "inner", None).await.unwrap();
    let deep = tree.touch(&inner, "deep.txt", None).await.unwrap();

    tree.move_file(&outer, &root, "renamed", false, None).await.unwrap();
    settle(&tree).await;

    assert_eq!(deep.portable_path().to_portable(), "USERS:renamed/inner/deep.txt");
    assert!(deep.abs_path().is_file());
    assert!(Arc::ptr_eq(&tree.get(&deep.id()).unwrap(), &deep));

    // One move action per descendant.
    let lt = tree.journal().get(&deep.life_id()).unwrap();
    assert_eq!(lt.latest_action().action_type, ActionType::Move);
    assert_eq!(lt.latest_path(), "USERS:renamed/inner/deep.txt");
}

#[tokio::test]
async fn test_move_overwrite_semantics() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let dir2 = tree.mkdir(&root, "dir2", None).await.unwrap();
    let src = tree.touch(&root, "file", None).await.unwrap();
    src.write(b"source bytes").await.unwrap();
    let blocker = tree.touch(&dir2, "file", None).await.unwrap();
    blocker.write(b"old target").await.unwrap();

    assert!(matches!(
        tree.move_file(&src, &dir2, "file", false, None).await,
        Err(FsError::FileAlreadyExists(_))
    ));

    tree.move_file(&src, &dir2, "file", true, None).await.unwrap();
    settle(&tree).await;

    let survivor = dir2.get_child("file").unwrap();
    assert_eq!(survivor.read_all().await.unwrap(), b"source bytes");
    assert!(tree.get(&blocker.id()).is_none() || Arc::ptr_eq(&tree.get(&blocker.id()).unwrap(), &src));
}

#[tokio::test]
async fn test_move_refuses_file_destination() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let file = tree.touch(&root, "plain.txt", None).await.unwrap();
    let victim = tree.touch(&root, "mover.txt", None).await.unwrap();

    assert!(matches!(
        tree.move_file(&victim, &file, "mover.txt", false, None).await,
        Err(FsError::DirectoryRequired(_))
    ));
}

// ==================== Delete Tests ====================

#[tokio::test]
async fn test_delete_removes_bottom_up_and_closes_lifetimes() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let dir = tree.mkdir(&root, "doomed", None).await.unwrap();
    let file = tree.touch(&dir, "inner.txt", None).await.unwrap();
    let dir_abs = dir.abs_path();

    tree.delete(&dir, None).await.unwrap();
    settle(&tree).await;

    assert!(!dir_abs.exists());
    assert!(tree.get(&dir.id()).is_none());
    assert!(tree.get(&file.id()).is_none());
    assert!(root.get_child("doomed").is_err());

    let lt = tree.journal().get(&file.life_id()).unwrap();
    assert_eq!(lt.latest_action().action_type, ActionType::Delete);
    assert!(!lt.is_live());
}

// ==================== Size Tests ====================

#[tokio::test]
async fn test_directory_size_is_sum_of_children() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let dir = tree.mkdir(&root, "sized", None).await.unwrap();
    let a = tree.touch(&dir, "a.bin", None).await.unwrap();
    let b = tree.touch(&dir, "b.bin", None).await.unwrap();
    a.write(&[0u8; 100]).await.unwrap();
    b.write(&[0u8; 23]).await.unwrap();

    tree.resize_up(&a, None).await.unwrap();
    settle(&tree).await;

    assert_eq!(dir.size(), 123);
    assert_eq!(root.size(), 123);
}

// ==================== Disk Load Tests ====================

#[tokio::test]
async fn test_load_from_disk_materializes_unknown_entries() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    std::fs::create_dir(tmp.path().join("users/found")).unwrap();
    std::fs::write(tmp.path().join("users/found.txt"), b"already here").unwrap();

    let found = tree.load_from_disk(&root, None).await.unwrap();
    settle(&tree).await;

    assert_eq!(found.len(), 2);
    // Directories sort first so callers can recurse.
    assert!(found[0].is_dir());
    assert_eq!(root.get_child("found.txt").unwrap().size(), 12);

    // A second pass finds nothing new.
    assert!(tree.load_from_disk(&root, None).await.unwrap().is_empty());
}

// ==================== Cross-Tree Tests ====================

#[tokio::test]
async fn test_move_to_tree_keeps_indexes_consistent() {
    let tmp = TempDir::new().unwrap();
    let journal = test_journal();
    let users = FileTree::new(tmp.path().join("users"), "USERS", journal.clone()).unwrap();
    let restore = FileTree::new(tmp.path().join("restore"), "RESTORE", journal).unwrap();

    let file = users.touch(&users.root(), "precious.txt", None).await.unwrap();
    file.write(b"bytes to keep").await.unwrap();

    users
        .move_to_tree(&file, &restore, &restore.root(), "content-xyz")
        .await
        .unwrap();

    assert!(users.get(&file.id()).is_none() || users.root().get_child("precious.txt").is_err());
    assert!(Arc::ptr_eq(&restore.get(&file.id()).unwrap(), &file));
    assert_eq!(file.portable_path().to_portable(), "RESTORE:content-xyz");
    assert_eq!(file.read_all().await.unwrap(), b"bytes to keep");
}

// ==================== Point-In-Time Tests ====================

#[tokio::test]
async fn test_past_folder_children_window() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();
    let journal = tree.journal();

    let f1 = tree.touch(&root, "f1", None).await.unwrap();
    settle(&tree).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    tree.touch(&root, "f2", None).await.unwrap();
    settle(&tree).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let t2 = crate::now_millis();
    tokio::time::sleep(Duration::from_millis(5)).await;

    tree.delete(&f1, None).await.unwrap();
    settle(&tree).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let t3 = crate::now_millis();

    let at_t2 = journal.get_past_folder_children(&root, t2).unwrap();
    let mut names: Vec<String> = at_t2
        .iter()
        .map(|c| c.portable_path().filename().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["f1", "f2"]);

    let at_t3 = journal.get_past_folder_children(&root, t3).unwrap();
    let names: Vec<String> = at_t3
        .iter()
        .map(|c| c.portable_path().filename().to_string())
        .collect();
    assert_eq!(names, vec!["f2"]);
}

#[tokio::test]
async fn test_past_file_reconstruction() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();
    let journal = tree.journal();

    let dir1 = tree.mkdir(&root, "dir1", None).await.unwrap();
    let dir2 = tree.mkdir(&root, "dir2", None).await.unwrap();
    let file = tree.touch(&dir1, "wanderer", None).await.unwrap();
    let life_id = file.life_id();
    settle(&tree).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let before_move = crate::now_millis();
    tokio::time::sleep(Duration::from_millis(5)).await;

    tree.move_file(&file, &dir2, "wanderer", false, None).await.unwrap();
    settle(&tree).await;

    let past = journal.get_past_file(&life_id, before_move).unwrap();
    assert!(past.is_past_file());
    assert_eq!(past.portable_path().to_portable(), "USERS:dir1/wanderer");

    let now = journal.get_past_file(&life_id, crate::now_millis()).unwrap();
    assert_eq!(now.portable_path().to_portable(), "USERS:dir2/wanderer");
}

// ==================== Event Fence Tests ====================

#[tokio::test]
async fn test_explicit_event_batches_actions() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();
    let journal = tree.journal();

    let event = journal.new_event();
    tree.mkdir(&root, "batch", None).await.unwrap();
    let dir = root.get_child("batch").unwrap();
    tree.touch(&dir, "one", Some(&event)).await.unwrap();
    tree.touch(&dir, "two", Some(&event)).await.unwrap();
    assert_eq!(event.action_count(), 2);

    journal.log_event(&event).await;
    event.wait_logged().await;

    // After the fence closes, both lifetimes are queryable.
    assert!(journal.get(&dir.get_child("one").unwrap().life_id()).is_some());
    assert!(journal.get(&dir.get_child("two").unwrap().life_id()).is_some());
}

#[tokio::test]
async fn test_nodes_match_parent_path_invariant() {
    let tmp = TempDir::new().unwrap();
    let tree = test_tree(&tmp);
    let root = tree.root();

    let a = tree.mkdir(&root, "a", None).await.unwrap();
    let b = tree.mkdir(&a, "b", None).await.unwrap();
    tree.touch(&b, "c.txt", None).await.unwrap();
    tree.move_file(&b, &root, "b2", false, None).await.unwrap();

    root.recursive_map(&mut |n| {
        if let Some(parent) = n.parent() {
            assert_eq!(
                n.portable_path(),
                parent.portable_path().child(&n.filename(), n.is_dir())
            );
            assert_eq!(n.parent_id(), parent.id());
        }
        assert!(Arc::ptr_eq(&tree.get(&n.id()).unwrap(), n));
        Ok(())
    })
    .unwrap();
}
