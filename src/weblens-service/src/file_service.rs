use crate::{RecordDb, ServiceError, ServiceResult};
use file_tree::{
    content_id_from_hash, ContentId, FileEvent, FileId, FileNode, FileTree, FsError, Journal,
    PortablePath,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const USERS_TREE: &str = "USERS";
pub const CACHES_TREE: &str = "CACHES";
pub const RESTORE_TREE: &str = "RESTORE";

pub const USER_TRASH_DIR: &str = ".user_trash";
pub const THUMBS_DIR: &str = "thumbs";
pub const TAKEOUT_DIR: &str = "takeout";

const TRASH_TABLE: &str = "trash_entries";
const COVERS_TABLE: &str = "folder_covers";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrashEntry {
    life_id: FileId,
    orig_parent: FileId,
    orig_name: String,
}

/// The file layer above the raw trees: owns the USERS / CACHES / RESTORE
/// trees (plus per-core mirrors on backup servers), applies the
/// content-preserving delete policy, and answers content-id lookups.
pub struct FileService {
    trees: RwLock<HashMap<String, Arc<FileTree>>>,
    db: Arc<RecordDb>,
    content_index: RwLock<HashMap<ContentId, FileId>>,
}

impl FileService {
    pub fn new(
        users: Arc<FileTree>,
        caches: Arc<FileTree>,
        restore: Arc<FileTree>,
        db: Arc<RecordDb>,
    ) -> ServiceResult<Arc<Self>> {
        db.ensure_table(TRASH_TABLE)?;
        db.ensure_table(COVERS_TABLE)?;

        let mut trees = HashMap::new();
        trees.insert(users.alias(), users);
        trees.insert(caches.alias(), caches.clone());
        trees.insert(restore.alias(), restore);

        let service = Arc::new(Self {
            trees: RwLock::new(trees),
            db,
            content_index: RwLock::new(HashMap::new()),
        });

        // The media service expects its artifact directories in the caches
        // tree from the start.
        for sub in [THUMBS_DIR, TAKEOUT_DIR] {
            if caches.root().get_child(sub).is_ok() {
                continue;
            }
            let portable = caches.root().portable_path().child(sub, true);
            let node = FileNode::new(
                file_tree::file_id_from_path(&portable.to_portable()),
                sub,
                Some(&caches.root()),
                true,
            );
            caches.add(&node).map_err(ServiceError::Fs)?;
            if !node.abs_path().exists() {
                std::fs::create_dir_all(node.abs_path())
                    .map_err(|e| ServiceError::IoError(format!("create {}: {}", sub, e)))?;
            }
        }

        Ok(service)
    }

    // ==================== Trees ====================

    pub fn tree(&self, alias: &str) -> ServiceResult<Arc<FileTree>> {
        self.trees
            .read()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| ServiceError::Fs(FsError::NoFileTree(alias.to_string())))
    }

    pub fn users_tree(&self) -> Arc<FileTree> {
        self.tree(USERS_TREE).expect("users tree is always present")
    }

    pub fn caches_tree(&self) -> Arc<FileTree> {
        self.tree(CACHES_TREE).expect("caches tree is always present")
    }

    pub fn restore_tree(&self) -> Arc<FileTree> {
        self.tree(RESTORE_TREE).expect("restore tree is always present")
    }

    /// Mount an additional tree (a backup server's per-core mirror).
    pub fn add_tree(&self, tree: Arc<FileTree>) {
        self.trees.write().unwrap().insert(tree.alias(), tree);
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.users_tree().journal()
    }

    pub fn journal_for(&self, alias: &str) -> ServiceResult<Arc<Journal>> {
        Ok(self.tree(alias)?.journal())
    }

    pub fn size_of(&self, alias: &str) -> i64 {
        self.tree(alias).map(|t| t.size()).unwrap_or(0)
    }

    // ==================== Lookup ====================

    pub fn get_file(&self, id: &FileId) -> ServiceResult<Arc<FileNode>> {
        self.users_tree()
            .get(id)
            .ok_or_else(|| ServiceError::Fs(FsError::NoFile(id.to_string())))
    }

    pub fn get_file_by_tree(&self, id: &FileId, alias: &str) -> ServiceResult<Arc<FileNode>> {
        self.tree(alias)?
            .get(id)
            .ok_or_else(|| ServiceError::Fs(FsError::NoFile(id.to_string())))
    }

    /// Found files plus the ids that resolved nowhere.
    pub fn get_files(&self, ids: &[FileId]) -> (Vec<Arc<FileNode>>, Vec<FileId>) {
        let tree = self.users_tree();
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match tree.get(id) {
                Some(f) => found.push(f),
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    /// The owner of a users-tree file is the first path segment: every user
    /// home sits directly under the root.
    pub fn owner_of(&self, file: &Arc<FileNode>) -> String {
        let portable = file.portable_path();
        let rel = portable.relative_path();
        match rel.split('/').next() {
            Some(seg) if !seg.is_empty() => seg.to_string(),
            _ => crate::WEBLENS_USER.to_string(),
        }
    }

    /// Walk a portable path down from the tree root.
    pub fn path_to_file(&self, path: &PortablePath) -> ServiceResult<Arc<FileNode>> {
        let tree = self.tree(path.root_name())?;
        let mut current = tree.root();
        for segment in path.relative_path().split('/').filter(|s| !s.is_empty()) {
            current = current
                .get_child(segment)
                .map_err(ServiceError::Fs)?;
        }
        Ok(current)
    }

    pub fn get_file_by_content_id(&self, content_id: &ContentId) -> ServiceResult<Arc<FileNode>> {
        let id = self
            .content_index
            .read()
            .unwrap()
            .get(content_id)
            .cloned()
            .ok_or_else(|| ServiceError::Fs(FsError::NoFile(content_id.to_string())))?;
        self.get_file(&id)
    }

    // ==================== User scaffolding ====================

    /// Home directory plus trash for a fresh user; returns (home, trash).
    pub async fn create_user_home(
        &self,
        username: &str,
    ) -> ServiceResult<(Arc<FileNode>, Arc<FileNode>)> {
        let tree = self.users_tree();
        let root = tree.root();
        let home = match tree.mkdir(&root, username, None).await {
            Ok(home) => home,
            Err(FsError::DirAlreadyExists(_)) | Err(FsError::FileAlreadyExists(_)) => {
                root.get_child(username).map_err(ServiceError::Fs)?
            }
            Err(err) => return Err(err.into()),
        };
        let trash = match tree.mkdir(&home, USER_TRASH_DIR, None).await {
            Ok(trash) => trash,
            Err(FsError::DirAlreadyExists(_)) | Err(FsError::FileAlreadyExists(_)) => {
                home.get_child(USER_TRASH_DIR).map_err(ServiceError::Fs)?
            }
            Err(err) => return Err(err.into()),
        };
        Ok((home, trash))
    }

    pub fn is_file_in_trash(&self, file: &Arc<FileNode>) -> bool {
        file.portable_path()
            .relative_path()
            .split('/')
            .any(|seg| seg == USER_TRASH_DIR)
    }

    pub fn trash_of(&self, username: &str) -> ServiceResult<Arc<FileNode>> {
        let home = self
            .users_tree()
            .root()
            .get_child(username)
            .map_err(ServiceError::Fs)?;
        home.get_child(USER_TRASH_DIR).map_err(ServiceError::Fs)
    }

    // ==================== Trash ====================

    /// Rename into the owner's trash, remembering where the file came from.
    pub async fn move_file_to_trash(
        &self,
        file: &Arc<FileNode>,
        event: Option<&Arc<FileEvent>>,
    ) -> ServiceResult<()> {
        if self.is_file_in_trash(file) {
            return Ok(());
        }
        let owner = self.owner_of(file);
        let trash = self.trash_of(&owner)?;
        let orig_parent = file.parent().map(|p| p.id()).unwrap_or_default();
        let orig_name = file.filename();

        let trash_name = make_unique_child_name(&trash, &orig_name);
        self.users_tree()
            .move_file(file, &trash, &trash_name, false, event)
            .await?;

        let entry = TrashEntry {
            life_id: file.life_id(),
            orig_parent,
            orig_name,
        };
        self.db.upsert(TRASH_TABLE, entry.life_id.as_str(), &entry)?;
        Ok(())
    }

    /// Put a trashed file back where it came from; falls back to the
    /// owner's home when the original parent is gone.
    pub async fn return_file_from_trash(
        &self,
        file: &Arc<FileNode>,
        event: Option<&Arc<FileEvent>>,
    ) -> ServiceResult<()> {
        let entry: TrashEntry = self
            .db
            .find(TRASH_TABLE, file.life_id().as_str())?
            .ok_or_else(|| ServiceError::Fs(FsError::NoFile(file.life_id().to_string())))?;

        let tree = self.users_tree();
        let parent = match tree.get(&entry.orig_parent) {
            Some(parent) if parent.is_dir() => parent,
            _ => {
                let owner = self.owner_of(file);
                tree.root().get_child(&owner).map_err(ServiceError::Fs)?
            }
        };

        let name = make_unique_child_name(&parent, &entry.orig_name);
        tree.move_file(file, &parent, &name, false, event).await?;
        self.db.delete(TRASH_TABLE, entry.life_id.as_str())?;
        Ok(())
    }

    // ==================== Delete ====================

    /// Permanently delete from the users tree. Regular file content is
    /// preserved in the content-addressed restore pool: the on-disk object
    /// is renamed to `RESTORE/<contentId>` unless that copy already exists,
    /// in which case the users-tree object is simply removed. Directories
    /// fall away bottom-up once their files are handled.
    ///
    /// Returns the frozen snapshots of everything deleted, for broadcast.
    pub async fn delete_files(
        &self,
        files: &[Arc<FileNode>],
        event: &Arc<FileEvent>,
    ) -> ServiceResult<Vec<file_tree::FileSnapshot>> {
        let users = self.users_tree();
        let restore = self.restore_tree();
        let mut snapshots = Vec::new();

        for file in files {
            let mut doomed = Vec::new();
            file.leaf_map(&mut |n| {
                doomed.push(n.clone());
                Ok(())
            })
            .map_err(ServiceError::Fs)?;

            for node in doomed {
                snapshots.push(node.freeze());
                event.new_delete_action(node.life_id(), &node.portable_path(), node.size());
                self.db.delete(TRASH_TABLE, node.life_id().as_str())?;

                if node.is_dir() {
                    users.remove_node(&node);
                    if let Err(err) = std::fs::remove_dir(node.abs_path()) {
                        warn!("removing dir {}: {}", node.portable_path(), err);
                    }
                    continue;
                }

                let content_id = self.ensure_content_id(&node).await?;
                let pool_name = content_id.to_string();

                if restore.root().get_child(&pool_name).is_ok() {
                    // Identical bytes already preserved; drop this copy.
                    users.remove_node(&node);
                    if let Err(err) = std::fs::remove_file(node.abs_path()) {
                        warn!("removing file {}: {}", node.portable_path(), err);
                    }
                } else {
                    users
                        .move_to_tree(&node, &restore, &restore.root(), &pool_name)
                        .await
                        .map_err(ServiceError::Fs)?;
                    self.content_index
                        .write()
                        .unwrap()
                        .insert(content_id, node.id());
                }
            }
        }

        Ok(snapshots)
    }

    // ==================== Restore ====================

    /// Recreate files as they stood at `at`, under `new_parent`. Content
    /// comes back out of the restore pool by hardlink, so a restored file
    /// shares bytes with the preserved copy.
    pub async fn restore_files(
        &self,
        life_ids: &[FileId],
        new_parent: &Arc<FileNode>,
        at: i64,
        event: &Arc<FileEvent>,
    ) -> ServiceResult<Vec<Arc<FileNode>>> {
        let journal = self.journal();
        let mut restored = Vec::new();
        for life_id in life_ids {
            let node = self.restore_one(&journal, life_id, new_parent, at, event).await?;
            restored.push(node);
        }
        Ok(restored)
    }

    fn restore_one<'a>(
        &'a self,
        journal: &'a Arc<Journal>,
        life_id: &'a FileId,
        new_parent: &'a Arc<FileNode>,
        at: i64,
        event: &'a Arc<FileEvent>,
    ) -> futures::future::BoxFuture<'a, ServiceResult<Arc<FileNode>>> {
        Box::pin(async move {
            let past = journal.get_past_file(life_id, at).map_err(ServiceError::Fs)?;
            let lifetime = journal
                .get(life_id)
                .ok_or_else(|| ServiceError::Fs(FsError::NoLifetime(life_id.to_string())))?;

            let users = self.users_tree();
            let name = make_unique_child_name(new_parent, past.portable_path().filename());

            if past.is_dir() {
                let dir = users.mkdir(new_parent, &name, Some(event)).await?;
                for child in journal
                    .get_past_folder_children(&past, at)
                    .map_err(ServiceError::Fs)?
                {
                    self.restore_one(journal, &child.life_id(), &dir, at, event)
                        .await?;
                }
                return Ok(dir);
            }

            let content_id = if lifetime.content_id.is_empty() {
                past.content_id()
            } else {
                lifetime.content_id.clone()
            };
            if content_id.is_empty() {
                return Err(ServiceError::Fs(FsError::NoContentId(life_id.to_string())));
            }

            let restore = self.restore_tree();
            let pool_file = restore
                .root()
                .get_child(content_id.as_str())
                .map_err(|_| ServiceError::Fs(FsError::NoFile(content_id.to_string())))?;

            // Build the node without touching disk, then hardlink content in.
            let portable = new_parent.portable_path().child(&name, false);
            let node = FileNode::new(
                file_tree::file_id_from_path(&portable.to_portable()),
                &name,
                Some(new_parent),
                false,
            );
            users.add(&node).map_err(ServiceError::Fs)?;
            users
                .link_content(&node, &pool_file.abs_path())
                .map_err(ServiceError::Fs)?;
            node.load_stat().map_err(ServiceError::Fs)?;
            node.set_content_id(content_id);

            event.new_restore_action(&node, &past.portable_path());
            Ok(node)
        })
    }

    /// Merge a full set of lifetimes into the journal (restoring a core
    /// from a backup's history).
    pub fn restore_history(&self, lifetimes: Vec<file_tree::Lifetime>) -> ServiceResult<()> {
        self.journal().add(lifetimes).map_err(ServiceError::Fs)
    }

    // ==================== Content ids ====================

    /// Hash the file into its content id if it has none yet, and index it.
    pub async fn ensure_content_id(&self, file: &Arc<FileNode>) -> ServiceResult<ContentId> {
        if file.is_dir() {
            return Err(ServiceError::Fs(FsError::IsDir(
                file.portable_path().to_portable(),
            )));
        }

        let existing = file.content_id();
        if !existing.is_empty() {
            return Ok(existing);
        }

        let data = file.read_all().await.map_err(ServiceError::Fs)?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let content_id = content_id_from_hash(&hasher.finalize());

        file.set_content_id(content_id.clone());
        self.content_index
            .write()
            .unwrap()
            .insert(content_id.clone(), file.id());

        // The create event may still be in flight; drain it so the lifetime
        // exists before the content id lands on it.
        let journal = self.journal();
        journal.flush().await;
        if journal.get(&file.life_id()).is_some() {
            if let Err(err) = journal.set_lifetime_content(&file.life_id(), &content_id) {
                debug!("recording content id on lifetime: {}", err);
            }
        }
        Ok(content_id)
    }

    /// Walk the restore pool and users tree at startup to rebuild the
    /// content-id index.
    pub fn load_content_index(&self) -> ServiceResult<usize> {
        let mut index = self.content_index.write().unwrap();
        index.clear();
        for node in self.restore_tree().root().children() {
            index.insert(ContentId::new(node.filename()), node.id());
        }
        let count = index.len();
        drop(index);
        debug!("content index rebuilt with {} entries", count);
        Ok(count)
    }

    // ==================== Folder covers ====================

    /// Pin one media item as a folder's cover. Covers are keyed by the
    /// folder's lifetime id so they survive renames.
    pub fn set_folder_cover(
        &self,
        folder: &Arc<FileNode>,
        cover: Option<&ContentId>,
    ) -> ServiceResult<()> {
        if !folder.is_dir() {
            return Err(ServiceError::Fs(FsError::DirectoryRequired(
                folder.portable_path().to_portable(),
            )));
        }
        match cover {
            Some(content_id) => {
                self.db
                    .upsert(COVERS_TABLE, folder.life_id().as_str(), content_id)
            }
            None => {
                self.db.delete(COVERS_TABLE, folder.life_id().as_str())?;
                Ok(())
            }
        }
    }

    pub fn get_folder_cover(&self, folder: &Arc<FileNode>) -> ServiceResult<Option<ContentId>> {
        self.db.find(COVERS_TABLE, folder.life_id().as_str())
    }

    /// A file node destined for `parent` but backed by a temp location
    /// while its upload is in flight. [`file_tree::FileTree::attach`]
    /// promotes it once the bytes are complete.
    pub fn new_upload_file(
        &self,
        parent: &Arc<FileNode>,
        name: &str,
    ) -> ServiceResult<Arc<FileNode>> {
        let caches = self.caches_tree();
        let tmp_dir = caches
            .abs_path_of(&caches.root().portable_path())
            .join(".upload_tmp");
        if !tmp_dir.exists() {
            std::fs::create_dir_all(&tmp_dir)
                .map_err(|e| ServiceError::IoError(format!("create upload tmp: {}", e)))?;
        }

        let portable = parent.portable_path().child(name, false);
        let node = FileNode::new(
            file_tree::file_id_from_path(&portable.to_portable()),
            name,
            Some(parent),
            false,
        );

        let mut nonce = [0u8; 4];
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
        let tmp_name: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();
        node.set_abs_path(tmp_dir.join(format!("{}-{}", tmp_name, name)));
        node.create_self().map_err(ServiceError::Fs)?;
        Ok(node)
    }

    // ==================== Cache artifacts ====================

    fn thumbs_dir(&self) -> ServiceResult<Arc<FileNode>> {
        self.caches_tree()
            .root()
            .get_child(THUMBS_DIR)
            .map_err(ServiceError::Fs)
    }

    fn takeout_dir(&self) -> ServiceResult<Arc<FileNode>> {
        self.caches_tree()
            .root()
            .get_child(TAKEOUT_DIR)
            .map_err(ServiceError::Fs)
    }

    /// A new (empty) cache artifact under `CACHES/thumbs`.
    pub async fn new_cache_file(&self, cache_name: &str) -> ServiceResult<Arc<FileNode>> {
        let caches = self.caches_tree();
        let thumbs = self.thumbs_dir()?;
        match caches.touch(&thumbs, cache_name, None).await {
            Ok(node) => Ok(node),
            Err(FsError::FileAlreadyExists(_)) => {
                thumbs.get_child(cache_name).map_err(ServiceError::Fs)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_media_cache_by_filename(&self, cache_name: &str) -> ServiceResult<Arc<FileNode>> {
        self.thumbs_dir()?
            .get_child(cache_name)
            .map_err(|_| ServiceError::NoCache(cache_name.to_string()))
    }

    pub async fn delete_cache_file(&self, file: &Arc<FileNode>) -> ServiceResult<()> {
        self.caches_tree().delete(file, None).await.map_err(ServiceError::Fs)
    }

    /// A zip target under `CACHES/takeout`, keyed by takeout id.
    pub async fn new_zip(&self, takeout_id: &str) -> ServiceResult<Arc<FileNode>> {
        let caches = self.caches_tree();
        let takeout = self.takeout_dir()?;
        let name = format!("{}.zip", takeout_id);
        match caches.touch(&takeout, &name, None).await {
            Ok(node) => Ok(node),
            Err(FsError::FileAlreadyExists(_)) => {
                takeout.get_child(&name).map_err(ServiceError::Fs)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_zip(&self, takeout_id: &str) -> ServiceResult<Arc<FileNode>> {
        self.takeout_dir()?
            .get_child(&format!("{}.zip", takeout_id))
            .map_err(|_| ServiceError::NoCache(takeout_id.to_string()))
    }
}

/// Append " copy" (then " copy 2", ...) until the name is free in `parent`.
pub fn make_unique_child_name(parent: &Arc<FileNode>, base: &str) -> String {
    if parent.get_child(base).is_err() {
        return base.to_string();
    }

    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
        _ => (base.to_string(), String::new()),
    };

    let mut n = 1;
    loop {
        let candidate = if n == 1 {
            format!("{} copy{}", stem, ext)
        } else {
            format!("{} copy {}{}", stem, n, ext)
        };
        if parent.get_child(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}
