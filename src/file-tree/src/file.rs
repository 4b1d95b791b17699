use crate::{ContentId, FileId, FsError, FsResult, PortablePath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File as StdFile;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::fs;

/// Land a whole chunk at a byte offset, retrying short writes. Unix writes
/// at the offset directly; windows seeks as part of each write.
fn write_full_chunk(file: &StdFile, data: &[u8], mut offset: u64) -> std::io::Result<()> {
    let mut remaining = data;
    while !remaining.is_empty() {
        #[cfg(unix)]
        let written = std::os::unix::fs::FileExt::write_at(file, remaining, offset)?;
        #[cfg(windows)]
        let written = std::os::windows::fs::FileExt::seek_write(file, remaining, offset)?;

        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("no progress writing chunk at offset {}", offset),
            ));
        }
        remaining = &remaining[written..];
        offset += written as u64;
    }
    Ok(())
}

/// In-memory descriptor of one file or directory in a [`crate::FileTree`].
///
/// The tree's id index holds the only strong references; a node reaches its
/// parent through a `Weak` pointer plus `parent_id`, which keeps the graph
/// acyclic at the data level. All mutable state sits behind its own lock so
/// sibling reads never contend.
pub struct FileNode {
    id: RwLock<FileId>,

    // The lifetime id never changes after create, even as moves rewrite the
    // path-derived file id.
    life_id: RwLock<FileId>,

    abs_path: RwLock<PathBuf>,
    portable: RwLock<PortablePath>,
    filename: RwLock<String>,

    size: AtomicI64,
    is_dir: bool,
    mod_time: AtomicI64,

    content_id: RwLock<ContentId>,

    parent_id: RwLock<FileId>,
    parent: RwLock<Weak<FileNode>>,

    children: RwLock<HashMap<String, Arc<FileNode>>>,

    read_only: bool,
    past_file: bool,

    // The node's content right now, for past files whose live copy moved.
    current_id: RwLock<FileId>,

    mem_only: bool,
    buffer: RwLock<Vec<u8>>,

    // Ids of tasks currently claiming this file. Moves and deletes cancel and
    // wait on these before touching the node.
    task_holds: Mutex<Vec<String>>,
}

impl FileNode {
    pub fn new(id: FileId, filename: &str, parent: Option<&Arc<FileNode>>, is_dir: bool) -> Arc<Self> {
        Self::build(id, filename, parent, is_dir, false)
    }

    /// A file whose content lives only in its in-memory buffer. Children of a
    /// mem-only directory inherit the flag.
    pub fn new_mem_only(id: FileId, filename: &str, is_dir: bool) -> Arc<Self> {
        Self::build(id, filename, None, is_dir, true)
    }

    fn build(
        id: FileId,
        filename: &str,
        parent: Option<&Arc<FileNode>>,
        is_dir: bool,
        mem_only: bool,
    ) -> Arc<Self> {
        let (portable, parent_id, parent_weak, mem_only) = match parent {
            Some(p) => (
                p.portable_path().child(filename, is_dir),
                p.id(),
                Arc::downgrade(p),
                p.mem_only || mem_only,
            ),
            None => (
                PortablePath::root_of(filename),
                FileId::default(),
                Weak::new(),
                mem_only,
            ),
        };

        Arc::new(Self {
            life_id: RwLock::new(id.clone()),
            id: RwLock::new(id),
            abs_path: RwLock::new(PathBuf::new()),
            portable: RwLock::new(portable),
            filename: RwLock::new(filename.to_string()),
            size: AtomicI64::new(0),
            is_dir,
            mod_time: AtomicI64::new(0),
            content_id: RwLock::new(ContentId::default()),
            parent_id: RwLock::new(parent_id),
            parent: RwLock::new(parent_weak),
            children: RwLock::new(HashMap::new()),
            read_only: false,
            past_file: false,
            current_id: RwLock::new(FileId::default()),
            mem_only,
            buffer: RwLock::new(Vec::new()),
            task_holds: Mutex::new(Vec::new()),
        })
    }

    /// A descriptor for a file as it existed at some past time, reconstructed
    /// from the journal rather than the live filesystem.
    pub fn new_past(
        life_id: FileId,
        portable: PortablePath,
        parent_id: FileId,
        size: i64,
        mod_time: i64,
        content_id: ContentId,
    ) -> Arc<Self> {
        let is_dir = portable.is_dir();
        Arc::new(Self {
            id: RwLock::new(life_id.clone()),
            life_id: RwLock::new(life_id),
            abs_path: RwLock::new(PathBuf::new()),
            filename: RwLock::new(portable.filename().to_string()),
            portable: RwLock::new(portable),
            size: AtomicI64::new(size),
            is_dir,
            mod_time: AtomicI64::new(mod_time),
            content_id: RwLock::new(content_id),
            parent_id: RwLock::new(parent_id),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(HashMap::new()),
            read_only: true,
            past_file: true,
            current_id: RwLock::new(FileId::default()),
            mem_only: false,
            buffer: RwLock::new(Vec::new()),
            task_holds: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> FileId {
        self.id.read().unwrap().clone()
    }

    pub fn life_id(&self) -> FileId {
        self.life_id.read().unwrap().clone()
    }

    pub(crate) fn set_id(&self, id: FileId) {
        *self.id.write().unwrap() = id;
    }

    pub fn set_life_id(&self, id: FileId) {
        *self.life_id.write().unwrap() = id;
    }

    pub fn filename(&self) -> String {
        self.filename.read().unwrap().clone()
    }

    pub(crate) fn set_filename(&self, name: &str) {
        *self.filename.write().unwrap() = name.to_string();
    }

    pub fn abs_path(&self) -> PathBuf {
        self.abs_path.read().unwrap().clone()
    }

    pub fn set_abs_path(&self, p: impl Into<PathBuf>) {
        *self.abs_path.write().unwrap() = p.into();
    }

    pub fn portable_path(&self) -> PortablePath {
        self.portable.read().unwrap().clone()
    }

    pub(crate) fn set_portable_path(&self, p: PortablePath) {
        *self.portable.write().unwrap() = p;
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_past_file(&self) -> bool {
        self.past_file
    }

    pub fn is_mem_only(&self) -> bool {
        self.mem_only
    }

    pub fn current_id(&self) -> FileId {
        self.current_id.read().unwrap().clone()
    }

    pub fn set_current_id(&self, id: FileId) {
        *self.current_id.write().unwrap() = id;
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: i64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn mod_time(&self) -> i64 {
        self.mod_time.load(Ordering::Acquire)
    }

    pub fn set_mod_time(&self, millis: i64) {
        self.mod_time.store(millis, Ordering::Release);
    }

    pub fn modified_now(&self) {
        self.set_mod_time(crate::now_millis());
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id.read().unwrap().clone()
    }

    pub fn set_content_id(&self, cid: ContentId) {
        *self.content_id.write().unwrap() = cid;
    }

    pub fn parent_id(&self) -> FileId {
        self.parent_id.read().unwrap().clone()
    }

    pub fn parent(&self) -> Option<Arc<FileNode>> {
        self.parent.read().unwrap().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<FileNode>) {
        *self.parent_id.write().unwrap() = parent.id();
        *self.parent.write().unwrap() = Arc::downgrade(parent);
    }

    pub fn exists(&self) -> bool {
        if self.mem_only {
            return true;
        }
        std::fs::metadata(self.abs_path()).is_ok()
    }

    // ==================== Children ====================

    pub fn get_child(&self, name: &str) -> FsResult<Arc<FileNode>> {
        if name.is_empty() {
            return Err(FsError::NoFile(format!(
                "empty child name under {}",
                self.portable_path()
            )));
        }
        self.children
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoFile(format!("{} in {}", name, self.portable_path())))
    }

    pub fn children(&self) -> Vec<Arc<FileNode>> {
        if !self.is_dir {
            return Vec::new();
        }
        self.children.read().unwrap().values().cloned().collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().unwrap().len()
    }

    pub fn has_children(&self) -> bool {
        self.is_dir && !self.children.read().unwrap().is_empty()
    }

    pub fn add_child(self: &Arc<Self>, child: &Arc<FileNode>) -> FsResult<()> {
        if !self.is_dir {
            return Err(FsError::DirectoryRequired(self.portable_path().to_portable()));
        }

        let mut children = self.children.write().unwrap();
        let name = child.filename();
        if children.contains_key(&name) {
            return Err(FsError::FileAlreadyExists(format!(
                "{} in {}",
                name,
                self.portable_path()
            )));
        }
        child.set_parent(self);
        children.insert(name, child.clone());
        Ok(())
    }

    pub(crate) fn remove_child(&self, name: &str) -> FsResult<Arc<FileNode>> {
        let mut children = self.children.write().unwrap();
        if children.is_empty() {
            return Err(FsError::NoChildren(self.portable_path().to_portable()));
        }
        let removed = children
            .remove(name)
            .ok_or_else(|| FsError::NoFile(format!("{} in {}", name, self.portable_path())))?;
        drop(children);

        self.modified_now();
        Ok(removed)
    }

    // ==================== Content I/O ====================

    pub async fn read_all(&self) -> FsResult<Vec<u8>> {
        if self.is_dir {
            return Err(FsError::IsDir(self.portable_path().to_portable()));
        }

        if self.mem_only {
            return Ok(self.buffer.read().unwrap().clone());
        }

        let data = fs::read(self.abs_path())
            .await
            .map_err(|e| FsError::IoError(format!("read {}: {}", self.portable_path(), e)))?;

        let expect = self.size();
        if expect > 0 && data.len() as i64 != expect {
            return Err(FsError::BadReadCount(format!(
                "{}: read {} of {} bytes",
                self.portable_path(),
                data.len(),
                expect
            )));
        }
        Ok(data)
    }

    /// Replace the file's content. Updates size and mod time on success.
    pub async fn write(&self, data: &[u8]) -> FsResult<()> {
        if self.is_dir {
            return Err(FsError::IsDir(self.portable_path().to_portable()));
        }

        if self.mem_only {
            *self.buffer.write().unwrap() = data.to_vec();
            self.set_size(data.len() as i64);
            self.modified_now();
            return Ok(());
        }

        fs::write(self.abs_path(), data)
            .await
            .map_err(|e| FsError::IoError(format!("write {}: {}", self.portable_path(), e)))?;
        self.set_size(data.len() as i64);
        self.modified_now();
        Ok(())
    }

    /// Positional write used by the chunked upload pipeline. The size counter
    /// grows by the chunk length; the upload task owns total accounting.
    pub fn write_at(&self, data: &[u8], offset: i64) -> FsResult<()> {
        if self.is_dir {
            return Err(FsError::IsDir(self.portable_path().to_portable()));
        }
        if self.mem_only {
            return Err(FsError::NotImplemented("mem-only file write_at".to_string()));
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.abs_path())
            .map_err(|e| FsError::IoError(format!("open {}: {}", self.portable_path(), e)))?;
        write_full_chunk(&file, data, offset as u64)
            .map_err(|e| FsError::IoError(format!("write_at {}: {}", self.portable_path(), e)))?;

        self.size.fetch_add(data.len() as i64, Ordering::AcqRel);
        self.modified_now();
        Ok(())
    }

    pub async fn append(&self, data: &[u8]) -> FsResult<()> {
        if self.is_dir {
            return Err(FsError::IsDir(self.portable_path().to_portable()));
        }

        if self.mem_only {
            self.buffer.write().unwrap().extend_from_slice(data);
            self.size.fetch_add(data.len() as i64, Ordering::AcqRel);
            self.modified_now();
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.abs_path())
            .await
            .map_err(|e| FsError::IoError(format!("open {}: {}", self.portable_path(), e)))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data)
            .await
            .map_err(|e| FsError::IoError(format!("append {}: {}", self.portable_path(), e)))?;

        self.size.fetch_add(data.len() as i64, Ordering::AcqRel);
        self.modified_now();
        Ok(())
    }

    /// Create the backing directory or empty file on disk.
    pub fn create_self(&self) -> FsResult<()> {
        if self.mem_only {
            return Ok(());
        }
        let path = self.abs_path();
        let result = if self.is_dir {
            std::fs::create_dir(&path)
        } else {
            StdFile::create_new(&path).map(|_| ())
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FsError::FileAlreadyExists(self.portable_path().to_portable()))
            }
            Err(e) => Err(FsError::IoError(format!("create {}: {}", self.portable_path(), e))),
        }
    }

    /// Recompute size (and mod time for regular files) from the filesystem.
    /// Directory size is the sum of its children. Returns the new size when
    /// it changed, or -1 when it did not.
    pub fn load_stat(&self) -> FsResult<i64> {
        if self.abs_path.read().unwrap().as_os_str().is_empty() {
            return Ok(-1);
        }

        let orig = self.size();
        let new_size;

        if self.is_dir {
            new_size = self.children().iter().map(|c| c.size()).sum();
        } else {
            if orig > 0 {
                return Ok(-1);
            }
            let stat = std::fs::metadata(self.abs_path())
                .map_err(|e| FsError::IoError(format!("stat {}: {}", self.portable_path(), e)))?;
            if let Ok(modified) = stat.modified() {
                let millis = modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as i64;
                self.set_mod_time(millis);
            }
            new_size = stat.len() as i64;
        }

        if new_size != orig {
            self.set_size(new_size);
            return Ok(new_size);
        }
        Ok(-1)
    }

    // ==================== Traversal ====================

    /// Pre-order DFS over self and all descendants. Stops on the first error.
    pub fn recursive_map(
        self: &Arc<Self>,
        f: &mut dyn FnMut(&Arc<FileNode>) -> FsResult<()>,
    ) -> FsResult<()> {
        f(self)?;
        if !self.is_dir {
            return Ok(());
        }
        for child in self.children() {
            child.recursive_map(f)?;
        }
        Ok(())
    }

    /// Post-order DFS: leaves first, then their parents, finishing with the
    /// caller itself.
    pub fn leaf_map(
        self: &Arc<Self>,
        f: &mut dyn FnMut(&Arc<FileNode>) -> FsResult<()>,
    ) -> FsResult<()> {
        if self.is_dir {
            for child in self.children() {
                child.leaf_map(f)?;
            }
        }
        f(self)
    }

    /// Walk self, then each ancestor, until the root.
    pub fn bubble_map(
        self: &Arc<Self>,
        f: &mut dyn FnMut(&Arc<FileNode>) -> FsResult<()>,
    ) -> FsResult<()> {
        f(self)?;
        match self.parent() {
            Some(parent) => parent.bubble_map(f),
            None => Ok(()),
        }
    }

    pub fn is_parent_of(&self, other: &FileNode) -> bool {
        other.portable_path().starts_with(&self.portable_path())
    }

    // ==================== Task holds ====================

    pub fn add_task(&self, task_id: &str) -> FsResult<()> {
        let mut holds = self.task_holds.lock().unwrap();
        if holds.iter().any(|t| t == task_id) {
            return Err(FsError::FileAlreadyHasTask(format!(
                "{} on {}",
                task_id,
                self.portable_path()
            )));
        }
        holds.push(task_id.to_string());
        Ok(())
    }

    pub fn remove_task(&self, task_id: &str) -> FsResult<()> {
        let mut holds = self.task_holds.lock().unwrap();
        let before = holds.len();
        holds.retain(|t| t != task_id);
        if holds.len() == before {
            return Err(FsError::FileNoTask(format!(
                "{} on {}",
                task_id,
                self.portable_path()
            )));
        }
        Ok(())
    }

    pub fn task_holds(&self) -> Vec<String> {
        self.task_holds.lock().unwrap().clone()
    }

    /// A value snapshot for broadcast and comparison. Carries no locks and no
    /// references back into the tree.
    pub fn freeze(&self) -> FileSnapshot {
        FileSnapshot {
            id: self.id(),
            portable_path: self.portable_path().to_portable(),
            filename: self.filename(),
            size: self.size(),
            is_dir: self.is_dir,
            modify_timestamp: self.mod_time(),
            content_id: self.content_id(),
            parent_id: self.parent_id(),
            children_ids: self.children().iter().map(|c| c.id()).collect(),
            past_file: self.past_file,
        }
    }
}

/// The broadcast/compare form of a [`FileNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub id: FileId,
    pub portable_path: String,
    pub filename: String,
    pub size: i64,
    pub is_dir: bool,
    pub modify_timestamp: i64,
    #[serde(skip_serializing_if = "ContentId::is_empty", default)]
    pub content_id: ContentId,
    pub parent_id: FileId,
    pub children_ids: Vec<FileId>,
    #[serde(default)]
    pub past_file: bool,
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use crate::file_id_from_path;
    use tempfile::TempDir;

    fn node_on_disk(tmp: &TempDir, name: &str, is_dir: bool) -> Arc<FileNode> {
        let node = FileNode::new(file_id_from_path(name), name, None, is_dir);
        node.set_abs_path(tmp.path().join(name));
        node
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let file = node_on_disk(&tmp, "notes.txt", false);
        file.create_self().unwrap();

        file.write(b"hello weblens").await.unwrap();
        assert_eq!(file.size(), 13);
        assert_eq!(file.read_all().await.unwrap(), b"hello weblens");
    }

    #[tokio::test]
    async fn test_directory_rejects_content_ops() {
        let tmp = TempDir::new().unwrap();
        let dir = node_on_disk(&tmp, "photos", true);
        dir.create_self().unwrap();

        assert!(matches!(dir.read_all().await, Err(FsError::IsDir(_))));
        assert!(matches!(dir.write(b"x").await, Err(FsError::IsDir(_))));
        assert!(matches!(dir.write_at(b"x", 0), Err(FsError::IsDir(_))));
    }

    #[tokio::test]
    async fn test_mem_only_reads_from_buffer() {
        let file = FileNode::new_mem_only(FileId::new("mem"), "mem.bin", false);
        file.write(b"in memory only").await.unwrap();
        assert_eq!(file.read_all().await.unwrap(), b"in memory only");
        assert!(matches!(
            file.write_at(b"x", 0),
            Err(FsError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_write_at_fills_ranges() {
        let tmp = TempDir::new().unwrap();
        let file = node_on_disk(&tmp, "chunked.bin", false);
        file.create_self().unwrap();

        file.write_at(b"world", 6).unwrap();
        file.write_at(b"hello ", 0).unwrap();
        let data = std::fs::read(file.abs_path()).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_add_child_enforces_uniqueness() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        let a = FileNode::new(FileId::new("a"), "alice", Some(&root), true);
        root.add_child(&a).unwrap();

        let dup = FileNode::new(FileId::new("a2"), "alice", Some(&root), true);
        assert!(matches!(
            root.add_child(&dup),
            Err(FsError::FileAlreadyExists(_))
        ));

        let leaf = FileNode::new(FileId::new("f"), "cat.jpg", Some(&a), false);
        assert!(matches!(
            leaf.add_child(&dup),
            Err(FsError::DirectoryRequired(_))
        ));
    }

    #[test]
    fn test_portable_path_tracks_parent() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        let home = FileNode::new(FileId::new("h"), "alice", Some(&root), true);
        root.add_child(&home).unwrap();
        let pic = FileNode::new(FileId::new("p"), "cat.jpg", Some(&home), false);
        home.add_child(&pic).unwrap();

        assert_eq!(
            pic.portable_path(),
            home.portable_path().child(&pic.filename(), false)
        );
        assert_eq!(pic.portable_path().to_portable(), "USERS:alice/cat.jpg");
    }

    #[test]
    fn test_leaf_map_visits_leaves_first_and_caller_last() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        let dir = FileNode::new(FileId::new("d"), "docs", Some(&root), true);
        root.add_child(&dir).unwrap();
        let leaf = FileNode::new(FileId::new("l"), "a.txt", Some(&dir), false);
        dir.add_child(&leaf).unwrap();

        let mut order = Vec::new();
        root.leaf_map(&mut |f| {
            order.push(f.filename());
            Ok(())
        })
        .unwrap();
        assert_eq!(order, vec!["a.txt", "docs", "USERS"]);
    }

    #[test]
    fn test_bubble_map_walks_ancestors() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        let dir = FileNode::new(FileId::new("d"), "docs", Some(&root), true);
        root.add_child(&dir).unwrap();
        let leaf = FileNode::new(FileId::new("l"), "a.txt", Some(&dir), false);
        dir.add_child(&leaf).unwrap();

        let mut order = Vec::new();
        leaf.bubble_map(&mut |f| {
            order.push(f.filename());
            Ok(())
        })
        .unwrap();
        assert_eq!(order, vec!["a.txt", "docs", "USERS"]);
    }

    #[test]
    fn test_load_stat_sums_directory_children() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        root.set_abs_path("/nonexistent-but-unused");
        let a = FileNode::new(FileId::new("a"), "a.bin", Some(&root), false);
        a.set_size(100);
        let b = FileNode::new(FileId::new("b"), "b.bin", Some(&root), false);
        b.set_size(23);
        root.add_child(&a).unwrap();
        root.add_child(&b).unwrap();

        assert_eq!(root.load_stat().unwrap(), 123);
        // Unchanged on the second pass.
        assert_eq!(root.load_stat().unwrap(), -1);
    }

    #[test]
    fn test_task_holds() {
        let node = FileNode::new(FileId::new("n"), "claimed.txt", None, false);
        node.add_task("t1").unwrap();
        assert!(matches!(
            node.add_task("t1"),
            Err(FsError::FileAlreadyHasTask(_))
        ));
        node.remove_task("t1").unwrap();
        assert!(matches!(node.remove_task("t1"), Err(FsError::FileNoTask(_))));
    }

    #[test]
    fn test_freeze_is_detached() {
        let root = FileNode::new(FileId::new("r"), "USERS", None, true);
        let file = FileNode::new(FileId::new("f"), "cat.jpg", Some(&root), false);
        root.add_child(&file).unwrap();
        file.set_size(42);

        let snap = file.freeze();
        file.set_size(1000);
        assert_eq!(snap.size, 42);
        assert_eq!(snap.parent_id, root.id());
    }
}
