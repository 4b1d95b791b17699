use crate::backup::CoreClientFactory;
use crate::jobs::JobMeta;
use crate::{ServerRole, ServiceError, Services};
use file_tree::{FileId, FileSnapshot, PortablePath};
use std::sync::Arc;
use task_pool::{JobResult, Task, TaskError, TaskResult};

/// One sync round against a remote core: pull users, merge journal history
/// since our latest action, then materialize every file the mirror is
/// missing through child copy tasks.
pub(crate) async fn do_backup(
    task: Arc<Task<JobMeta>>,
    services: Services,
    factory: Option<Arc<dyn CoreClientFactory>>,
) -> JobResult {
    let JobMeta::Backup { core_id } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for do_backup".to_string()));
    };
    let factory =
        factory.ok_or_else(|| TaskError::Internal("no core client factory".to_string()))?;

    match services.instances.local_role() {
        ServerRole::Backup => {}
        ServerRole::Init => {
            return Err(TaskError::JobFailed("server not initialized".to_string()))
        }
        ServerRole::Core => {
            return Err(TaskError::JobFailed("backup job on a core server".to_string()))
        }
    }

    let remote = services
        .instances
        .get_remote(&core_id)
        .map_err(TaskError::from)?;
    let client = factory.client_for(&remote).map_err(TaskError::from)?;
    debug!("starting backup of [{}]", remote.name);

    // 1. The core's users become local records.
    for user in client.get_users().await.map_err(TaskError::from)? {
        services.users.ensure(user).map_err(TaskError::from)?;
    }

    let mirror = services
        .files
        .tree(core_id.as_str())
        .map_err(TaskError::from)?;
    let journal = mirror.journal();

    // 2. History since our latest known action.
    let since = journal
        .get_latest_action()
        .map_err(|e| TaskError::from(ServiceError::from(e)))?
        .map(|a| a.timestamp)
        .unwrap_or(0);
    trace!("backup since-cursor is {}", since);

    let mut lifetimes = client
        .get_lifetimes_since(since)
        .await
        .map_err(TaskError::from)?;
    trace!("backup got {} updated lifetimes", lifetimes.len());

    // 3. Parents sort before children by destination path length.
    lifetimes.sort_by_key(|lt| lt.latest_path().len());

    // 4. Merge, collecting lifetimes we have never materialized.
    let mut new_ids: Vec<FileId> = Vec::new();
    for lt in lifetimes {
        let unseen = journal.get(&lt.id).is_none();
        journal
            .add(vec![lt.clone()])
            .map_err(|e| TaskError::from(ServiceError::from(e)))?;
        if unseen && lt.is_live() {
            new_ids.push(lt.id);
        }
    }

    // 5. Active lifetimes whose backing file has gone missing locally.
    for lt in journal.active_lifetimes() {
        let portable = PortablePath::parse(lt.latest_path())
            .map(|p| p.overwrite_root(core_id.as_str()))
            .ok();
        let missing = match portable {
            Some(p) => services.files.path_to_file(&p).is_err(),
            None => true,
        };
        if missing && !new_ids.contains(&lt.id) {
            new_ids.push(lt.id);
        }
    }
    new_ids.sort();
    new_ids.dedup();
    trace!("backup found {} files to materialize", new_ids.len());

    if new_ids.is_empty() {
        return Ok(());
    }

    // 6. Fetch descriptors, parents first by path length.
    let mut descriptors = client.get_files(&new_ids).await.map_err(TaskError::from)?;
    descriptors.sort_by_key(|d| d.portable_path.len());

    let wp = services.tasks.clone();
    let pool = wp.new_task_pool(true, Some(task.clone()));
    task.set_child_pool(pool.clone());

    // 7. Directories inline; file contents through child copy tasks.
    for desc in descriptors {
        task.check_exit()?;
        if let Err(err) = stage_descriptor(&services, &core_id, &desc, &wp, &pool, &task).await {
            warn!("staging {} from core: {}", desc.portable_path, err);
            return Err(err);
        }
    }

    // 8. Wait out the copies; any error fails the whole round.
    pool.signal_all_queued();
    pool.wait(true).await;

    let errors = pool.errors();
    if !errors.is_empty() {
        return Err(TaskError::JobFailed(format!(
            "{} backup file copies have failed",
            errors.len()
        )));
    }

    if let Some(caster) = task.caster() {
        let mut result = TaskResult::new();
        result.insert("coreId".to_string(), serde_json::json!(core_id));
        caster.push_task_update(
            task.id(),
            task.job_name(),
            ws_fabric::BACKUP_COMPLETE_EVENT,
            result,
        );
    }
    Ok(())
}

async fn stage_descriptor(
    services: &Services,
    core_id: &file_tree::InstanceId,
    desc: &FileSnapshot,
    wp: &Arc<task_pool::WorkerPool<JobMeta>>,
    pool: &Arc<task_pool::TaskPool<JobMeta>>,
    task: &Arc<Task<JobMeta>>,
) -> JobResult {
    let mirror = services
        .files
        .tree(core_id.as_str())
        .map_err(TaskError::from)?;

    let core_path = PortablePath::parse(&desc.portable_path)
        .map_err(|e| TaskError::JobFailed(e.to_string()))?;
    let local_path = core_path.overwrite_root(core_id.as_str());

    if services.files.path_to_file(&local_path).is_ok() {
        return Ok(());
    }

    let parent = match local_path.parent() {
        Some(parent_path) => services
            .files
            .path_to_file(&parent_path)
            .map_err(|e| TaskError::JobFailed(format!("missing parent {}: {}", parent_path, e)))?,
        None => mirror.root(),
    };

    if desc.is_dir {
        let dir = mirror
            .mkdir(&parent, &desc.filename, None)
            .await
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;
        dir.set_life_id(desc.id.clone());
        return Ok(());
    }

    // Build the node now so the copy task has a destination; content
    // arrives from the core later.
    let node = mirror
        .touch(&parent, &desc.filename, None)
        .await
        .map_err(|e| TaskError::JobFailed(e.to_string()))?;
    node.set_life_id(desc.id.clone());
    node.set_content_id(desc.content_id.clone());

    let meta = JobMeta::CopyFileFromCore {
        core_id: core_id.clone(),
        local_id: node.id(),
        core_file_id: desc.id.clone(),
        content_id: desc.content_id.clone(),
    };
    wp.dispatch_job(meta, task.caster(), Some(pool.clone()))?;
    Ok(())
}

/// Stream one file's bytes down from the core. Content lands in the
/// restore pool keyed by content id and is hardlinked into the mirror, so
/// identical files across cores share storage.
pub(crate) async fn copy_file_from_core(
    task: Arc<Task<JobMeta>>,
    services: Services,
    factory: Option<Arc<dyn CoreClientFactory>>,
) -> JobResult {
    let JobMeta::CopyFileFromCore { core_id, local_id, core_file_id, content_id } =
        task.metadata().clone()
    else {
        return Err(TaskError::Internal("wrong metadata for copy_file_from_core".to_string()));
    };
    let factory =
        factory.ok_or_else(|| TaskError::Internal("no core client factory".to_string()))?;

    let remote = services
        .instances
        .get_remote(&core_id)
        .map_err(TaskError::from)?;
    let client = factory.client_for(&remote).map_err(TaskError::from)?;

    let node = services
        .files
        .get_file_by_tree(&local_id, core_id.as_str())
        .map_err(TaskError::from)?;

    task.check_exit()?;

    let restore = services.files.restore_tree();
    let pool_name = content_id.to_string();
    let mirror = services
        .files
        .tree(core_id.as_str())
        .map_err(TaskError::from)?;

    if !content_id.is_empty() {
        if let Ok(pooled) = restore.root().get_child(&pool_name) {
            // Already preserved from a previous round; relink instead of
            // pulling the bytes again.
            let _ = std::fs::remove_file(node.abs_path());
            mirror
                .link_content(&node, &pooled.abs_path())
                .map_err(|e| TaskError::JobFailed(e.to_string()))?;
            node.load_stat().ok();
            return Ok(());
        }
    }

    let data = client.read_file(&core_file_id).await.map_err(|err| {
        let _ = std::fs::remove_file(node.abs_path());
        TaskError::from(err)
    })?;

    node.write(&data)
        .await
        .map_err(|e| TaskError::JobFailed(e.to_string()))?;

    if !content_id.is_empty() && restore.root().get_child(&pool_name).is_err() {
        let pooled = restore
            .touch(&restore.root(), &pool_name, None)
            .await
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;
        let _ = std::fs::remove_file(pooled.abs_path());
        std::fs::hard_link(node.abs_path(), pooled.abs_path())
            .map_err(|e| TaskError::JobFailed(format!("pooling backup content: {}", e)))?;
        pooled.load_stat().ok();
        pooled.set_content_id(content_id.clone());
    }

    if let Some(caster) = task.caster() {
        let mut result = TaskResult::new();
        result.insert("filename".to_string(), serde_json::json!(node.filename()));
        caster.push_task_update(
            task.id(),
            task.job_name(),
            ws_fabric::COPY_FILE_COMPLETE_EVENT,
            result,
        );
    }
    Ok(())
}
