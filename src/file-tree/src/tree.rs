use crate::journal::{FileEvent, Journal};
use crate::{file_id_from_path, FileId, FileNode, FsError, FsResult, PortablePath};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

/// A versioned, in-memory directory tree pinned to one root alias. The tree
/// owns every node through its id index; structural mutations are serialized
/// here and recorded as journal events.
///
/// File ids are derived from portable paths, so inserting the same path
/// twice collides and is rejected. Lifetime ids ride along on the nodes and
/// survive the id rewrites a move performs.
pub struct FileTree {
    root: Arc<FileNode>,
    abs_root: PathBuf,
    index: RwLock<HashMap<FileId, Arc<FileNode>>>,
    journal: Arc<Journal>,
}

impl FileTree {
    /// Pin a tree to `abs_root` on disk under the given alias, creating the
    /// directory when missing.
    pub fn new(abs_root: impl Into<PathBuf>, alias: &str, journal: Arc<Journal>) -> FsResult<Self> {
        let abs_root = abs_root.into();
        if !abs_root.exists() {
            debug!("FileTree: creating root dir {}", abs_root.display());
            std::fs::create_dir_all(&abs_root)
                .map_err(|e| FsError::IoError(format!("create tree root: {}", e)))?;
        }

        let root_portable = PortablePath::root_of(alias);
        let root = FileNode::new(file_id_from_path(&root_portable.to_portable()), alias, None, true);
        root.set_abs_path(&abs_root);

        let mut index = HashMap::new();
        index.insert(root.id(), root.clone());

        Ok(Self {
            root,
            abs_root,
            index: RwLock::new(index),
            journal,
        })
    }

    pub fn root(&self) -> Arc<FileNode> {
        self.root.clone()
    }

    pub fn alias(&self) -> String {
        self.root.filename()
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }

    pub fn size(&self) -> i64 {
        self.root.size()
    }

    pub fn get(&self, id: &FileId) -> Option<Arc<FileNode>> {
        self.index.read().unwrap().get(id).cloned()
    }

    pub fn get_by_portable(&self, path: &PortablePath) -> Option<Arc<FileNode>> {
        self.get(&file_id_from_path(&path.to_portable()))
    }

    pub fn node_count(&self) -> usize {
        self.index.read().unwrap().len()
    }

    /// Absolute on-disk location for a portable path under this tree's root.
    pub fn abs_path_of(&self, portable: &PortablePath) -> PathBuf {
        self.abs_root.join(portable.relative_path())
    }

    /// Insert an already-built node under its parent. No disk mutation and
    /// no journal event; used by imports and replay.
    pub fn add(&self, node: &Arc<FileNode>) -> FsResult<()> {
        let parent = node
            .parent()
            .ok_or_else(|| FsError::NoFile(format!("parent of {}", node.portable_path())))?;

        {
            let mut index = self.index.write().unwrap();
            if index.contains_key(&node.id()) {
                return Err(FsError::FileAlreadyExists(node.portable_path().to_portable()));
            }
            index.insert(node.id(), node.clone());
        }

        if let Err(err) = parent.add_child(node) {
            self.index.write().unwrap().remove(&node.id());
            return Err(err);
        }

        node.set_abs_path(self.abs_path_of(&node.portable_path()));
        Ok(())
    }

    /// Create a new regular file under `parent`, on disk and in the tree.
    pub async fn touch(
        &self,
        parent: &Arc<FileNode>,
        name: &str,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<Arc<FileNode>> {
        self.create_node(parent, name, false, event).await
    }

    /// Create a new directory under `parent`.
    pub async fn mkdir(
        &self,
        parent: &Arc<FileNode>,
        name: &str,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<Arc<FileNode>> {
        self.create_node(parent, name, true, event).await
    }

    async fn create_node(
        &self,
        parent: &Arc<FileNode>,
        name: &str,
        is_dir: bool,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<Arc<FileNode>> {
        if !parent.is_dir() {
            return Err(FsError::DirectoryRequired(parent.portable_path().to_portable()));
        }

        let portable = parent.portable_path().child(name, is_dir);
        let node = FileNode::new(file_id_from_path(&portable.to_portable()), name, Some(parent), is_dir);
        node.set_abs_path(self.abs_path_of(&portable));

        node.create_self().map_err(|e| match e {
            FsError::FileAlreadyExists(p) if is_dir => FsError::DirAlreadyExists(p),
            other => other,
        })?;

        if let Err(err) = self.add(&node) {
            // Disk create succeeded but the tree refused; roll the disk back.
            let _ = std::fs::remove_file(node.abs_path());
            return Err(err);
        }

        self.with_event(event, |e| e.new_create_action(&node)).await;
        Ok(node)
    }

    /// Attach a file that was written outside the tree (an upload landing in
    /// the temp directory) under its final parent.
    pub async fn attach(
        &self,
        node: &Arc<FileNode>,
        parent: &Arc<FileNode>,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<()> {
        if !parent.is_dir() {
            return Err(FsError::DirectoryRequired(parent.portable_path().to_portable()));
        }

        let portable = parent.portable_path().child(&node.filename(), node.is_dir());
        let dest_abs = self.abs_path_of(&portable);
        let src_abs = node.abs_path();

        if src_abs != dest_abs {
            fs::rename(&src_abs, &dest_abs)
                .await
                .map_err(|e| FsError::IoError(format!("attach {}: {}", portable, e)))?;
        }

        node.set_parent(parent);
        node.set_portable_path(portable.clone());
        node.set_id(file_id_from_path(&portable.to_portable()));
        node.set_life_id(node.id());
        node.set_abs_path(dest_abs);

        {
            let mut index = self.index.write().unwrap();
            if index.contains_key(&node.id()) {
                return Err(FsError::FileAlreadyExists(portable.to_portable()));
            }
            index.insert(node.id(), node.clone());
        }
        parent.add_child(node)?;

        self.with_event(event, |e| e.new_create_action(node)).await;
        Ok(())
    }

    /// Move or rename a file, rewriting cached paths and tree ids for every
    /// descendant and appending one move action per descendant.
    ///
    /// The on-disk rename happens first; the index rewrite holds the write
    /// lock only for the id swaps.
    pub async fn move_file(
        &self,
        node: &Arc<FileNode>,
        new_parent: &Arc<FileNode>,
        new_name: &str,
        overwrite: bool,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<()> {
        if !new_parent.is_dir() {
            return Err(FsError::DirectoryRequired(new_parent.portable_path().to_portable()));
        }
        if node.parent().is_none() {
            return Err(FsError::Internal("cannot move a tree root".to_string()));
        }

        if let Ok(existing) = new_parent.get_child(new_name) {
            if !overwrite {
                return Err(FsError::FileAlreadyExists(existing.portable_path().to_portable()));
            }
            if existing.id() != node.id() {
                self.delete(&existing, event).await?;
            }
        }

        let old_parent = node.parent().unwrap();
        let old_abs = node.abs_path();
        let new_portable = new_parent.portable_path().child(new_name, node.is_dir());
        let new_abs = self.abs_path_of(&new_portable);

        fs::rename(&old_abs, &new_abs)
            .await
            .map_err(|e| FsError::IoError(format!("rename {}: {}", node.portable_path(), e)))?;

        old_parent.remove_child(&node.filename())?;
        node.set_filename(new_name);
        node.set_parent(new_parent);
        new_parent.add_child(node)?;

        // Rewrite paths and ids top-down so every node sees its parent's new
        // portable path.
        let mut moved: Vec<(Arc<FileNode>, PortablePath, PortablePath)> = Vec::new();
        node.recursive_map(&mut |n| {
            let old_portable = n.portable_path();
            let new_portable = match n.parent() {
                Some(p) if n.id() != node.id() => p.portable_path().child(&n.filename(), n.is_dir()),
                _ => new_portable.clone(),
            };
            n.set_portable_path(new_portable.clone());
            n.set_abs_path(self.abs_path_of(&new_portable));
            moved.push((n.clone(), old_portable, new_portable));
            Ok(())
        })?;

        {
            let mut index = self.index.write().unwrap();
            for (n, _, new_portable) in &moved {
                index.remove(&n.id());
                n.set_id(file_id_from_path(&new_portable.to_portable()));
                index.insert(n.id(), n.clone());
            }
        }

        // Cached parent ids went stale with the id rewrite above.
        for (n, _, _) in &moved {
            if let Some(p) = n.parent() {
                n.set_parent(&p);
            }
        }

        self.with_event(event, |e| {
            for (n, old_portable, new_portable) in &moved {
                e.new_move_action(
                    n.life_id(),
                    old_portable,
                    new_portable,
                    n.parent().map(|p| p.life_id()).unwrap_or_default(),
                    n.size(),
                );
            }
        })
        .await;

        self.resize_after_move(&old_parent, new_parent, event).await;
        Ok(())
    }

    /// Remove a subtree from disk and the tree, bottom-up, with one delete
    /// action per node.
    pub async fn delete(&self, node: &Arc<FileNode>, event: Option<&Arc<FileEvent>>) -> FsResult<()> {
        let mut doomed = Vec::new();
        node.leaf_map(&mut |n| {
            doomed.push(n.clone());
            Ok(())
        })?;

        self.with_event(event, |e| {
            for n in &doomed {
                let abs = n.abs_path();
                let result = if n.is_dir() {
                    std::fs::remove_dir(&abs)
                } else {
                    std::fs::remove_file(&abs)
                };
                if let Err(err) = result {
                    warn!("FileTree: removing {} from disk: {}", n.portable_path(), err);
                }

                self.detach(n);
                e.new_delete_action(n.life_id(), &n.portable_path(), n.size());
            }
        })
        .await;

        Ok(())
    }

    /// Detach a node from the index and its parent without touching disk or
    /// the journal. Callers that relocated the content elsewhere use this.
    pub fn remove_node(&self, node: &Arc<FileNode>) {
        self.detach(node);
    }

    fn detach(&self, node: &Arc<FileNode>) {
        self.index.write().unwrap().remove(&node.id());
        if let Some(parent) = node.parent() {
            let _ = parent.remove_child(&node.filename());
        }
    }

    /// Move a node into a different tree, keeping both indexes consistent.
    /// No event is produced; the surrounding operation owns the journal
    /// record (a delete that preserves content, typically).
    pub async fn move_to_tree(
        &self,
        node: &Arc<FileNode>,
        dest_tree: &FileTree,
        dest_parent: &Arc<FileNode>,
        new_name: &str,
    ) -> FsResult<()> {
        if !dest_parent.is_dir() {
            return Err(FsError::DirectoryRequired(dest_parent.portable_path().to_portable()));
        }

        let dest_portable = dest_parent.portable_path().child(new_name, node.is_dir());
        let dest_abs = dest_tree.abs_path_of(&dest_portable);

        fs::rename(node.abs_path(), &dest_abs)
            .await
            .map_err(|e| FsError::IoError(format!("move to tree {}: {}", dest_portable, e)))?;

        self.detach(node);

        node.set_filename(new_name);
        node.set_parent(dest_parent);
        node.set_portable_path(dest_portable.clone());
        node.set_id(file_id_from_path(&dest_portable.to_portable()));
        node.set_abs_path(dest_abs);

        {
            let mut index = dest_tree.index.write().unwrap();
            if index.contains_key(&node.id()) {
                return Err(FsError::FileAlreadyExists(dest_portable.to_portable()));
            }
            index.insert(node.id(), node.clone());
        }
        dest_parent.add_child(node)?;
        Ok(())
    }

    /// Recompute sizes from `node` up to the root, appending a size-change
    /// action for every directory whose size moved.
    pub async fn resize_up(&self, node: &Arc<FileNode>, event: Option<&Arc<FileEvent>>) -> FsResult<()> {
        self.with_event(event, |e| {
            let _ = node.bubble_map(&mut |n| {
                if n.load_stat()? != -1 && n.is_dir() {
                    e.new_size_change_action(n);
                }
                Ok(())
            });
        })
        .await;
        Ok(())
    }

    /// Recompute sizes for a whole subtree, leaves first.
    pub async fn resize_down(&self, node: &Arc<FileNode>, event: Option<&Arc<FileEvent>>) -> FsResult<()> {
        self.with_event(event, |e| {
            let _ = node.leaf_map(&mut |n| {
                if n.load_stat()? != -1 && n.is_dir() {
                    e.new_size_change_action(n);
                }
                Ok(())
            });
        })
        .await;
        Ok(())
    }

    // After a move both the old and the new parent need new sizes. When one
    // contains the other, resizing from the lower one covers both.
    async fn resize_after_move(
        &self,
        old_parent: &Arc<FileNode>,
        new_parent: &Arc<FileNode>,
        event: Option<&Arc<FileEvent>>,
    ) {
        if old_parent.is_parent_of(new_parent) {
            let _ = self.resize_up(new_parent, event).await;
        } else if new_parent.is_parent_of(old_parent) {
            let _ = self.resize_up(old_parent, event).await;
        } else {
            let _ = self.resize_up(old_parent, event).await;
            let _ = self.resize_up(new_parent, event).await;
        }
    }

    /// Run `fill` against the given event, or against a transient one that is
    /// logged (and flushed to its fence by the journal worker) before return.
    async fn with_event<F: FnOnce(&Arc<FileEvent>)>(&self, event: Option<&Arc<FileEvent>>, fill: F) {
        match event {
            Some(e) => fill(e),
            None => {
                let transient = self.journal.new_event();
                fill(&transient);
                self.journal.log_event(&transient).await;
            }
        }
    }

    /// Materialize nodes for disk entries below `parent` that the tree does
    /// not know yet, appending create actions for each. Returns the new
    /// nodes, directories first so callers can recurse.
    pub async fn load_from_disk(
        &self,
        parent: &Arc<FileNode>,
        event: Option<&Arc<FileEvent>>,
    ) -> FsResult<Vec<Arc<FileNode>>> {
        if !parent.is_dir() {
            return Err(FsError::DirectoryRequired(parent.portable_path().to_portable()));
        }

        let mut entries = fs::read_dir(parent.abs_path())
            .await
            .map_err(|e| FsError::IoError(format!("read_dir {}: {}", parent.portable_path(), e)))?;

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if parent.get_child(&name).is_ok() {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FsError::IoError(e.to_string()))?;

            let portable = parent.portable_path().child(&name, meta.is_dir());
            let node = FileNode::new(
                file_id_from_path(&portable.to_portable()),
                &name,
                Some(parent),
                meta.is_dir(),
            );
            node.set_abs_path(self.abs_path_of(&portable));
            if !meta.is_dir() {
                node.set_size(meta.len() as i64);
            }
            self.add(&node)?;
            found.push(node);
        }

        found.sort_by_key(|n| !n.is_dir());
        self.with_event(event, |e| {
            for n in &found {
                e.new_create_action(n);
            }
        })
        .await;

        Ok(found)
    }

    /// Link or copy `content_abs` to the node's location. Hardlinks preserve
    /// the inode shared with the restore pool; a copy is the fallback across
    /// filesystems.
    pub fn link_content(&self, node: &Arc<FileNode>, content_abs: &Path) -> FsResult<()> {
        match std::fs::hard_link(content_abs, node.abs_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FsError::FileAlreadyExists(node.portable_path().to_portable()))
            }
            Err(_) => {
                std::fs::copy(content_abs, node.abs_path())
                    .map_err(|e| FsError::IoError(format!("link content: {}", e)))?;
                Ok(())
            }
        }
    }
}
