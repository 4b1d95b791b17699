use crate::jobs::JobMeta;
use crate::{Instance, ServerRole, ServiceResult, Services, User};
use async_trait::async_trait;
use file_tree::{FileId, FileSnapshot, FileTree, InstanceId, Journal, JournalStore, Lifetime};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What a backup server needs from its core. The daemon backs this with an
/// HTTP client against the core's api; tests stub it.
#[async_trait]
pub trait CoreClient: Send + Sync {
    async fn get_users(&self) -> ServiceResult<Vec<User>>;

    /// All lifetimes with any action after `since` (millis).
    async fn get_lifetimes_since(&self, since: i64) -> ServiceResult<Vec<Lifetime>>;

    /// Descriptors for the given file ids, in the core's trees.
    async fn get_files(&self, ids: &[FileId]) -> ServiceResult<Vec<FileSnapshot>>;

    /// The raw bytes of one file.
    async fn read_file(&self, id: &FileId) -> ServiceResult<Vec<u8>>;
}

pub trait CoreClientFactory: Send + Sync {
    fn client_for(&self, remote: &Instance) -> ServiceResult<Arc<dyn CoreClient>>;
}

/// Stand up the mirror tree for one remote core on a backup server: a tree
/// rooted at `<serverId>/` whose journal carries the core's server id and
/// ignores local actions (only merged core history is recorded).
pub fn mount_mirror_tree(
    services: &Services,
    db_dir: &Path,
    trees_root: &Path,
    core_id: &InstanceId,
) -> ServiceResult<Arc<FileTree>> {
    if let Ok(existing) = services.files.tree(core_id.as_str()) {
        return Ok(existing);
    }

    let store = JournalStore::open(&db_dir.join(format!("journal-{}.db", core_id)))?;
    let journal = Journal::open(store, core_id.clone(), true)?;
    let tree = Arc::new(FileTree::new(
        trees_root.join(core_id.as_str()),
        core_id.as_str(),
        journal,
    )?);
    services.files.add_tree(tree.clone());
    info!("mounted mirror tree for core [{}]", core_id);
    Ok(tree)
}

/// The backup daemon loop: dispatch one backup job per remote core, then
/// sleep until the next wall-clock-aligned interval boundary.
pub async fn backup_d(interval: Duration, services: Services) {
    if services.instances.local_role() != ServerRole::Backup {
        error!("backup daemon cannot run on a non-backup instance");
        return;
    }

    loop {
        for remote in services.instances.remotes() {
            if remote.role != ServerRole::Core {
                continue;
            }
            let meta = JobMeta::Backup { core_id: remote.id.clone() };
            if let Err(err) = services.tasks.dispatch_job(meta, Some(services.caster.clone()), None) {
                error!("dispatching backup of [{}]: {}", remote.name, err);
            }
        }

        let now_ms = file_tree::now_millis() as u64;
        let interval_ms = interval.as_millis().max(1) as u64;
        let sleep_for = interval_ms - (now_ms % interval_ms);
        debug!("backup daemon sleeping for {}ms", sleep_for);
        tokio::time::sleep(Duration::from_millis(sleep_for)).await;
    }
}
