use crate::backup::{CoreClient, CoreClientFactory};
use crate::jobs::{self, JobMeta};
use crate::media::{
    DecodedImage, MediaCodec, MediaQuality, MediaService, VideoProbe,
};
use crate::{
    AccessService, FileService, Instance, InstanceService, RecordDb, ServerRole, ServiceBundle,
    ServiceResult, Services, ShareService, UploadService, User, UserService,
};
use async_trait::async_trait;
use file_tree::{
    content_id_from_bytes, ActionType, ContentId, FileAction, FileId, FileSnapshot, FileTree,
    InstanceId, Journal, JournalStore, Lifetime,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use task_pool::{TaskStatus, WorkerPool};
use tempfile::TempDir;
use ws_fabric::{Caster, ClientManager};

struct StubCodec;

#[async_trait]
impl MediaCodec for StubCodec {
    async fn decode(&self, _data: &[u8], _mime: &str) -> ServiceResult<DecodedImage> {
        Ok(DecodedImage { width: 800, height: 600, page_count: 1, rotation: 0 })
    }

    async fn encode_scaled(
        &self,
        _data: &[u8],
        _mime: &str,
        page: u32,
        max_side: u32,
    ) -> ServiceResult<Vec<u8>> {
        Ok(format!("webp-{}-{}", page, max_side).into_bytes())
    }

    async fn probe(&self, _path: &Path) -> ServiceResult<VideoProbe> {
        Ok(VideoProbe { width: 1920, height: 1080, duration_ms: 5000 })
    }

    async fn extract_frame(&self, _path: &Path, _frame_index: u32) -> ServiceResult<Vec<u8>> {
        Ok(b"jpeg-frame".to_vec())
    }

    fn parse_create_date(&self, _data: &[u8]) -> Option<i64> {
        None
    }
}

struct TestEnv {
    services: Services,
    _tmp: TempDir,
}

fn null_journal(server: &str) -> Arc<Journal> {
    Journal::open(JournalStore::open_in_memory().unwrap(), InstanceId::new(server), true).unwrap()
}

fn build_env(role: ServerRole) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let db = RecordDb::open_in_memory().unwrap();

    let journal = Journal::open(
        JournalStore::open_in_memory().unwrap(),
        InstanceId::new("local-server"),
        false,
    )
    .unwrap();

    let users_tree =
        Arc::new(FileTree::new(tmp.path().join("users"), "USERS", journal).unwrap());
    let caches_tree =
        Arc::new(FileTree::new(tmp.path().join("caches"), "CACHES", null_journal("local-server")).unwrap());
    let restore_tree =
        Arc::new(FileTree::new(tmp.path().join("restore"), "RESTORE", null_journal("local-server")).unwrap());

    let files = FileService::new(users_tree, caches_tree, restore_tree, db.clone()).unwrap();
    let users = UserService::new(db.clone()).unwrap();
    let instances = InstanceService::new(db.clone()).unwrap();
    instances.init_local("test-box", role).unwrap();
    let access = AccessService::new(db.clone()).unwrap();
    let shares = ShareService::new(db.clone()).unwrap();
    let media = MediaService::new(db, files.clone(), Arc::new(StubCodec), None).unwrap();

    let clients = ClientManager::new();
    let caster = Caster::new(clients.clone());
    let tasks: Arc<WorkerPool<JobMeta>> = WorkerPool::new(2);
    let uploads = UploadService::new();

    let services: Services = Arc::new(ServiceBundle {
        instances,
        users,
        files,
        media,
        access,
        shares,
        uploads,
        tasks: tasks.clone(),
        clients,
        caster,
    });

    jobs::register_jobs(&tasks, services.clone(), None);
    tasks.start();

    TestEnv { services, _tmp: tmp }
}

async fn user_with_home(env: &TestEnv, name: &str) -> User {
    let mut user = User::new(name, "hunter2", false, false);
    let (home, trash) = env.services.files.create_user_home(name).await.unwrap();
    user.home_id = home.id();
    user.trash_id = trash.id();
    env.services.users.add(user.clone()).unwrap();
    user
}

// ==================== Upload Pipeline Tests ====================

#[tokio::test]
async fn test_upload_chunks_assemble_and_attach() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "alice").await;
    let home = svc.files.get_file(&user.home_id).unwrap();

    let payload = b"hello world";
    let task = jobs::open_upload(svc, "up-1", home.id(), 6, payload.len() as i64).unwrap();

    let node = svc.files.new_upload_file(&home, "greeting.txt").unwrap();
    jobs::announce_upload_file(svc, "up-1", node.clone(), payload.len() as i64)
        .await
        .unwrap();

    svc.uploads
        .add_chunk_to_stream("up-1", node.id(), payload[..6].to_vec(), "0-5/11")
        .await
        .unwrap();
    svc.uploads
        .add_chunk_to_stream("up-1", node.id(), payload[6..].to_vec(), "6-10/11")
        .await
        .unwrap();

    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success);

    let attached = home.get_child("greeting.txt").unwrap();
    assert_eq!(attached.read_all().await.unwrap(), payload);
    assert_eq!(attached.content_id(), content_id_from_bytes(payload));
    assert!(attached.task_holds().is_empty());
    // The upload landed inside the tree, not in the temp dir.
    assert!(attached.abs_path().starts_with(env._tmp.path().join("users")));
}

#[tokio::test]
async fn test_upload_abort_sentinel_drops_file() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "bob").await;
    let home = svc.files.get_file(&user.home_id).unwrap();

    let task = jobs::open_upload(svc, "up-2", home.id(), 4, 20).unwrap();

    let keeper = svc.files.new_upload_file(&home, "keep.txt").unwrap();
    let goner = svc.files.new_upload_file(&home, "gone.txt").unwrap();
    jobs::announce_upload_file(svc, "up-2", keeper.clone(), 4).await.unwrap();
    jobs::announce_upload_file(svc, "up-2", goner.clone(), 16).await.unwrap();

    svc.uploads
        .cancel_file_in_stream("up-2", goner.id())
        .await
        .unwrap();
    svc.uploads
        .add_chunk_to_stream("up-2", keeper.id(), b"data".to_vec(), "0-3/4")
        .await
        .unwrap();

    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success);
    assert!(home.get_child("keep.txt").is_ok());
    assert!(home.get_child("gone.txt").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_upload_watchdog_aborts_stalled_stream() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "carol").await;
    let home = svc.files.get_file(&user.home_id).unwrap();

    let task = jobs::open_upload(svc, "up-3", home.id(), 8, 100).unwrap();
    let node = svc.files.new_upload_file(&home, "stalled.bin").unwrap();
    jobs::announce_upload_file(svc, "up-3", node, 100).await.unwrap();

    // No chunks ever arrive; the 10 second watchdog kills the task.
    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Error);
}

// ==================== Delete / Restore Tests ====================

#[tokio::test]
async fn test_delete_preserves_content_then_restore_relinks() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "dave").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let file = tree.touch(&home, "precious.txt", None).await.unwrap();
    file.write(b"one hundred bytes of important data").await.unwrap();
    let life_id = file.life_id();
    let cid = svc.files.ensure_content_id(&file).await.unwrap();
    tree.journal().flush().await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let before_delete = file_tree::now_millis();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let event = tree.journal().new_event();
    svc.files.delete_files(&[file.clone()], &event).await.unwrap();
    tree.journal().log_event(&event).await;
    event.wait_logged().await;

    // Content lives on in the restore pool, named by content id.
    let pooled = svc.files.restore_tree().root().get_child(cid.as_str()).unwrap();
    assert_eq!(pooled.read_all().await.unwrap(), b"one hundred bytes of important data");
    assert!(home.get_child("precious.txt").is_err());
    assert!(!tree.journal().get(&life_id).unwrap().is_live());

    // Restore produces a fresh file with identical bytes, hardlinked.
    let event = tree.journal().new_event();
    let restored = svc
        .files
        .restore_files(&[life_id.clone()], &home, before_delete, &event)
        .await
        .unwrap();
    tree.journal().log_event(&event).await;
    event.wait_logged().await;

    assert_eq!(restored.len(), 1);
    assert_eq!(
        restored[0].read_all().await.unwrap(),
        b"one hundred bytes of important data"
    );
    assert_ne!(restored[0].life_id(), life_id);
    let restored_lt = tree.journal().get(&restored[0].life_id()).unwrap();
    assert_eq!(restored_lt.actions[0].action_type, ActionType::Restore);
}

#[tokio::test]
async fn test_identical_deletes_share_one_restore_entry() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "erin").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let a = tree.touch(&home, "a.bin", None).await.unwrap();
    let b = tree.touch(&home, "b.bin", None).await.unwrap();
    a.write(b"same bytes").await.unwrap();
    b.write(b"same bytes").await.unwrap();

    let event = tree.journal().new_event();
    svc.files.delete_files(&[a, b], &event).await.unwrap();
    tree.journal().log_event(&event).await;
    event.wait_logged().await;

    let cid = content_id_from_bytes(b"same bytes");
    let restore_root = svc.files.restore_tree().root();
    assert!(restore_root.get_child(cid.as_str()).is_ok());
    assert_eq!(restore_root.child_count(), 1);
}

// ==================== Trash Tests ====================

#[tokio::test]
async fn test_trash_round_trip() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "frank").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let file = tree.touch(&home, "doc.txt", None).await.unwrap();
    file.write(b"trash me").await.unwrap();

    svc.files.move_file_to_trash(&file, None).await.unwrap();
    assert!(svc.files.is_file_in_trash(&file));
    assert!(home.get_child("doc.txt").is_err());

    svc.files.return_file_from_trash(&file, None).await.unwrap();
    assert!(!svc.files.is_file_in_trash(&file));
    assert_eq!(home.get_child("doc.txt").unwrap().read_all().await.unwrap(), b"trash me");
}

// ==================== Scan / Media Tests ====================

#[tokio::test]
async fn test_scan_directory_imports_media() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "grace").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let pics = tree.mkdir(&home, "pics", None).await.unwrap();
    let photo = tree.touch(&pics, "cat.jpg", None).await.unwrap();
    photo.write(b"jpeg bytes go here").await.unwrap();
    let skipped = tree.touch(&pics, "notes.txt", None).await.unwrap();
    skipped.write(b"not media").await.unwrap();

    let task = svc
        .tasks
        .dispatch_job(JobMeta::ScanDirectory { folder_id: pics.id() }, None, None)
        .unwrap();
    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success);

    let cid = content_id_from_bytes(b"jpeg bytes go here");
    let media = svc.media.get(&cid).expect("media imported by scan");
    assert_eq!(media.width, 800);
    assert_eq!(media.file_ids, vec![photo.id()]);

    // Cache artifacts follow the naming convention in CACHES/thumbs.
    let thumb_name = MediaService::cache_file_name(&cid, MediaQuality::Thumbnail, 0);
    let thumb = svc.files.get_media_cache_by_filename(&thumb_name).unwrap();
    assert_eq!(thumb.read_all().await.unwrap(), b"webp-0-500");

    let fetched = svc
        .media
        .fetch_cache_data(&cid, MediaQuality::Highres, 0)
        .await
        .unwrap();
    assert_eq!(fetched, b"webp-0-2500");
}

#[tokio::test]
async fn test_duplicate_scan_requests_share_one_task() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "heidi").await;
    let home = svc.files.get_file(&user.home_id).unwrap();

    let meta = JobMeta::ScanDirectory { folder_id: home.id() };
    let first = svc.tasks.dispatch_job(meta.clone(), None, None).unwrap();
    let second = svc.tasks.dispatch_job(meta, None, None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    first.wait().await;
    let _ = user;
}

#[tokio::test]
async fn test_identical_content_shares_one_media_entry() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "judy").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let dir_a = tree.mkdir(&home, "a", None).await.unwrap();
    let dir_b = tree.mkdir(&home, "b", None).await.unwrap();
    let one = tree.touch(&dir_a, "same.jpg", None).await.unwrap();
    let two = tree.touch(&dir_b, "same.jpg", None).await.unwrap();
    one.write(b"identical jpeg bytes").await.unwrap();
    two.write(b"identical jpeg bytes").await.unwrap();

    svc.media.load_media_from_file(&one, "judy").await.unwrap();
    let media = svc.media.load_media_from_file(&two, "judy").await.unwrap();

    // One media entry, both file ids attached.
    assert_eq!(svc.media.size(), 1);
    assert!(media.file_ids.contains(&one.id()));
    assert!(media.file_ids.contains(&two.id()));
}

#[tokio::test]
async fn test_folder_cover_round_trip() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "kent").await;
    let home = svc.files.get_file(&user.home_id).unwrap();

    let cid = ContentId::new("cover-content");
    assert!(svc.files.get_folder_cover(&home).unwrap().is_none());
    svc.files.set_folder_cover(&home, Some(&cid)).unwrap();
    assert_eq!(svc.files.get_folder_cover(&home).unwrap(), Some(cid));
    svc.files.set_folder_cover(&home, None).unwrap();
    assert!(svc.files.get_folder_cover(&home).unwrap().is_none());
}

// ==================== Zip Tests ====================

#[tokio::test]
async fn test_create_zip_is_cached_by_file_set() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let user = user_with_home(&env, "ivan").await;
    let home = svc.files.get_file(&user.home_id).unwrap();
    let tree = svc.files.users_tree();

    let file = tree.touch(&home, "takeout-me.txt", None).await.unwrap();
    file.write(b"zip this").await.unwrap();

    let meta = JobMeta::CreateZip {
        file_ids: vec![file.id()],
        username: "ivan".to_string(),
        share_id: String::new(),
    };
    let task = svc.tasks.dispatch_job(meta.clone(), None, None).unwrap();
    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success);

    let takeout_id = task.results()["takeoutId"].as_str().unwrap().to_string();
    let zip_node = svc.files.get_zip(&takeout_id).unwrap();
    assert!(zip_node.size() > 0);

    // The same file set resolves to the same (finished, persistent) task.
    let again = svc.tasks.dispatch_job(meta, None, None).unwrap();
    assert!(Arc::ptr_eq(&task, &again));
    assert_eq!(again.results()["takeoutId"].as_str().unwrap(), takeout_id);
}

// ==================== Access Tests ====================

#[tokio::test]
async fn test_file_access_resolution() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let owner = user_with_home(&env, "olivia").await;
    let guest = user_with_home(&env, "guest").await;
    let home = svc.files.get_file(&owner.home_id).unwrap();
    let tree = svc.files.users_tree();

    let shared_dir = tree.mkdir(&home, "shared", None).await.unwrap();
    let inner = tree.touch(&shared_dir, "inner.txt", None).await.unwrap();
    let private = tree.touch(&home, "private.txt", None).await.unwrap();

    let file_owner = svc.files.owner_of(&inner);
    assert_eq!(file_owner, "olivia");

    // Owner always passes, stranger never does without a share.
    assert!(svc.access.can_user_access_file(&owner, &inner, &file_owner, None, None));
    assert!(!svc.access.can_user_access_file(&guest, &inner, &file_owner, None, None));

    let share = crate::Share::new_file_share(
        &shared_dir.id(),
        "olivia",
        vec!["guest".to_string()],
        false,
    );
    svc.shares.add(share.clone()).unwrap();

    assert!(svc.access.can_user_access_file(
        &guest,
        &inner,
        &file_owner,
        Some(&share),
        Some(&shared_dir)
    ));
    // The share covers only the shared subtree.
    assert!(!svc.access.can_user_access_file(
        &guest,
        &private,
        &file_owner,
        Some(&share),
        Some(&shared_dir)
    ));

    // Disabled shares grant nothing.
    let mut disabled = share.clone();
    disabled.enabled = false;
    assert!(!svc.access.can_user_access_file(
        &guest,
        &inner,
        &file_owner,
        Some(&disabled),
        Some(&shared_dir)
    ));
}

#[tokio::test]
async fn test_api_key_single_assignment() {
    let env = build_env(ServerRole::Core);
    let svc = &env.services;
    let admin = User::new("root", "toor", true, true);
    svc.users.add(admin.clone()).unwrap();

    let key = svc.access.generate_api_key(&admin).unwrap();
    svc.access
        .set_key_used_by(&key.key, &InstanceId::new("backup-1"))
        .unwrap();
    // Same server is a no-op; a different one is refused.
    svc.access
        .set_key_used_by(&key.key, &InstanceId::new("backup-1"))
        .unwrap();
    assert!(matches!(
        svc.access.set_key_used_by(&key.key, &InstanceId::new("backup-2")),
        Err(crate::ServiceError::KeyInUse(_))
    ));

    let plain = User::new("pleb", "pw", false, false);
    svc.users.add(plain.clone()).unwrap();
    assert!(svc.access.generate_api_key(&plain).is_err());
}

// ==================== Backup Tests ====================

struct StubCore {
    users: Vec<User>,
    lifetimes: Vec<Lifetime>,
    files: HashMap<FileId, (FileSnapshot, Vec<u8>)>,
}

#[async_trait]
impl CoreClient for StubCore {
    async fn get_users(&self) -> ServiceResult<Vec<User>> {
        Ok(self.users.clone())
    }

    async fn get_lifetimes_since(&self, since: i64) -> ServiceResult<Vec<Lifetime>> {
        Ok(self
            .lifetimes
            .iter()
            .filter(|lt| lt.latest_timestamp() > since)
            .cloned()
            .collect())
    }

    async fn get_files(&self, ids: &[FileId]) -> ServiceResult<Vec<FileSnapshot>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.files.get(id).map(|(snap, _)| snap.clone()))
            .collect())
    }

    async fn read_file(&self, id: &FileId) -> ServiceResult<Vec<u8>> {
        self.files
            .get(id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| crate::ServiceError::RemoteError(format!("no file {}", id)))
    }
}

struct StubFactory(Arc<StubCore>);

impl CoreClientFactory for StubFactory {
    fn client_for(&self, _remote: &Instance) -> ServiceResult<Arc<dyn CoreClient>> {
        Ok(self.0.clone())
    }
}

fn core_action(
    life: &str,
    event: &str,
    ts: i64,
    ty: ActionType,
    dest: &str,
    parent: &str,
    size: i64,
    cid: ContentId,
) -> FileAction {
    FileAction {
        life_id: FileId::new(life),
        event_id: file_tree::EventId::new(event),
        timestamp: ts,
        action_type: ty,
        origin_path: String::new(),
        destination_path: dest.to_string(),
        parent_id: FileId::new(parent),
        size,
        content_id: cid,
        server_id: InstanceId::new("core-1"),
    }
}

#[tokio::test]
async fn test_backup_round_materializes_mirror() {
    let env = build_env(ServerRole::Backup);
    let svc = &env.services;

    let core_id = InstanceId::new("core-1");
    svc.instances
        .add_remote(Instance::new_remote(
            core_id.clone(),
            "main-core",
            ServerRole::Core,
            "http://core.local",
            "key-123",
        ))
        .unwrap();
    crate::backup::mount_mirror_tree(
        svc,
        env._tmp.path(),
        env._tmp.path().join("mirrors").as_path(),
        &core_id,
    )
    .unwrap();

    let payload = b"backed up bytes".to_vec();
    let cid = content_id_from_bytes(&payload);

    let dir_lt = Lifetime::new(core_action(
        "life-dir", "ev-1", 100, ActionType::Create, "USERS:alice/", "root", 0,
        ContentId::default(),
    ))
    .unwrap();
    let file_lt = Lifetime::new(core_action(
        "life-file", "ev-2", 200, ActionType::Create, "USERS:alice/pic.jpg", "life-dir", 15,
        cid.clone(),
    ))
    .unwrap();

    let mut files = HashMap::new();
    files.insert(
        FileId::new("life-dir"),
        (
            FileSnapshot {
                id: FileId::new("life-dir"),
                portable_path: "USERS:alice/".to_string(),
                filename: "alice".to_string(),
                size: 0,
                is_dir: true,
                modify_timestamp: 100,
                content_id: ContentId::default(),
                parent_id: FileId::default(),
                children_ids: vec![FileId::new("life-file")],
                past_file: false,
            },
            Vec::new(),
        ),
    );
    files.insert(
        FileId::new("life-file"),
        (
            FileSnapshot {
                id: FileId::new("life-file"),
                portable_path: "USERS:alice/pic.jpg".to_string(),
                filename: "pic.jpg".to_string(),
                size: payload.len() as i64,
                is_dir: false,
                modify_timestamp: 200,
                content_id: cid.clone(),
                parent_id: FileId::new("life-dir"),
                children_ids: Vec::new(),
                past_file: false,
            },
            payload.clone(),
        ),
    );

    let stub = Arc::new(StubCore {
        users: vec![User::remote("alice", "hash$abc", false)],
        lifetimes: vec![dir_lt, file_lt],
        files,
    });
    jobs::register_jobs(&svc.tasks, svc.clone(), Some(Arc::new(StubFactory(stub))));

    let task = svc
        .tasks
        .dispatch_job(JobMeta::Backup { core_id: core_id.clone() }, None, None)
        .unwrap();
    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success, "backup failed: {:?}", task.error());

    // Users mirrored, files materialized, content pooled by id.
    assert!(svc.users.get("alice").is_ok());
    let mirrored = svc
        .files
        .path_to_file(&file_tree::PortablePath::parse("core-1:alice/pic.jpg").unwrap())
        .unwrap();
    assert_eq!(mirrored.read_all().await.unwrap(), payload);
    assert!(svc
        .files
        .restore_tree()
        .root()
        .get_child(cid.as_str())
        .is_ok());

    // A second round finds nothing new.
    let again = svc
        .tasks
        .dispatch_job(JobMeta::Backup { core_id }, None, None)
        .unwrap();
    again.wait().await;
    assert_eq!(again.status(), TaskStatus::Success);
}
