mod backup_job;
mod write_file;
mod zip_job;

pub use backup_job::*;
pub use write_file::*;
pub use zip_job::*;

use crate::backup::CoreClientFactory;
use crate::media::media_type_by_extension;
use crate::upload::UploadStreams;
use crate::{ServiceResult, Services};
use file_tree::{ContentId, FileId, FileNode, InstanceId};
use futures::FutureExt;
use std::sync::Arc;
use task_pool::{JobMetadata, JobResult, Task, TaskError, WorkerPool};
use ws_fabric::Caster;

pub const SCAN_DIRECTORY_JOB: &str = "scan_directory";
pub const SCAN_FILE_JOB: &str = "scan_file";
pub const WRITE_FILE_JOB: &str = "write_file";
pub const CREATE_ZIP_JOB: &str = "create_zip";
pub const GATHER_FS_STATS_JOB: &str = "gather_fs_stats";
pub const BACKUP_JOB: &str = "do_backup";
pub const HASH_FILE_JOB: &str = "hash_file";
pub const COPY_FILE_FROM_CORE_JOB: &str = "copy_file_from_core";

/// One variant per job kind, with its typed payload. Stream handles and
/// casters ride along for jobs that own live client state; only the
/// identifying fields land in the meta string, which is what the task id
/// dedupes on.
#[derive(Clone)]
pub enum JobMeta {
    ScanDirectory {
        folder_id: FileId,
    },
    ScanFile {
        file_id: FileId,
    },
    WriteFile {
        upload_id: String,
        root_folder_id: FileId,
        chunk_size: i64,
        total_size: i64,
        streams: Arc<UploadStreams>,
        caster: Arc<Caster>,
    },
    CreateZip {
        file_ids: Vec<FileId>,
        username: String,
        share_id: String,
    },
    GatherFsStats {
        root_id: FileId,
    },
    Backup {
        core_id: InstanceId,
    },
    HashFile {
        file_id: FileId,
    },
    CopyFileFromCore {
        core_id: InstanceId,
        local_id: FileId,
        core_file_id: FileId,
        content_id: ContentId,
    },
}

impl JobMetadata for JobMeta {
    fn job_name(&self) -> &'static str {
        match self {
            JobMeta::ScanDirectory { .. } => SCAN_DIRECTORY_JOB,
            JobMeta::ScanFile { .. } => SCAN_FILE_JOB,
            JobMeta::WriteFile { .. } => WRITE_FILE_JOB,
            JobMeta::CreateZip { .. } => CREATE_ZIP_JOB,
            JobMeta::GatherFsStats { .. } => GATHER_FS_STATS_JOB,
            JobMeta::Backup { .. } => BACKUP_JOB,
            JobMeta::HashFile { .. } => HASH_FILE_JOB,
            JobMeta::CopyFileFromCore { .. } => COPY_FILE_FROM_CORE_JOB,
        }
    }

    fn meta_string(&self) -> String {
        match self {
            JobMeta::ScanDirectory { folder_id } => folder_id.to_string(),
            JobMeta::ScanFile { file_id } => file_id.to_string(),
            JobMeta::WriteFile { upload_id, .. } => upload_id.clone(),
            JobMeta::CreateZip { file_ids, username, share_id } => {
                let mut ids: Vec<&str> = file_ids.iter().map(|id| id.as_str()).collect();
                ids.sort_unstable();
                format!("{}:{}:{}", ids.join(","), username, share_id)
            }
            JobMeta::GatherFsStats { root_id } => root_id.to_string(),
            JobMeta::Backup { core_id } => core_id.to_string(),
            JobMeta::HashFile { file_id } => file_id.to_string(),
            JobMeta::CopyFileFromCore { core_id, local_id, .. } => {
                format!("{}:{}", core_id, local_id)
            }
        }
    }

    fn always_resets(&self) -> bool {
        matches!(self, JobMeta::WriteFile { .. })
    }
}

/// Wire every job body to the worker pool. The service bundle and the core
/// client factory are captured by the handlers; tests pass stubs.
pub fn register_jobs(
    wp: &Arc<WorkerPool<JobMeta>>,
    services: Services,
    core_factory: Option<Arc<dyn CoreClientFactory>>,
) {
    let svc = services.clone();
    wp.register_job(SCAN_DIRECTORY_JOB, move |task| {
        let svc = svc.clone();
        async move { scan_directory(task, svc).await }.boxed()
    });

    let svc = services.clone();
    wp.register_job(SCAN_FILE_JOB, move |task| {
        let svc = svc.clone();
        async move { scan_file(task, svc).await }.boxed()
    });

    let svc = services.clone();
    wp.register_job(WRITE_FILE_JOB, move |task| {
        let svc = svc.clone();
        async move { write_file(task, svc).await }.boxed()
    });

    let svc = services.clone();
    wp.register_job(CREATE_ZIP_JOB, move |task| {
        let svc = svc.clone();
        async move { create_zip(task, svc).await }.boxed()
    });

    let svc = services.clone();
    wp.register_job(GATHER_FS_STATS_JOB, move |task| {
        let svc = svc.clone();
        async move { gather_fs_stats(task, svc).await }.boxed()
    });

    let svc = services.clone();
    wp.register_job(HASH_FILE_JOB, move |task| {
        let svc = svc.clone();
        async move { hash_file(task, svc).await }.boxed()
    });

    let svc = services.clone();
    let factory = core_factory.clone();
    wp.register_job(BACKUP_JOB, move |task| {
        let svc = svc.clone();
        let factory = factory.clone();
        async move { do_backup(task, svc, factory).await }.boxed()
    });

    let svc = services;
    let factory = core_factory;
    wp.register_job(COPY_FILE_FROM_CORE_JOB, move |task| {
        let svc = svc.clone();
        let factory = factory.clone();
        async move { copy_file_from_core(task, svc, factory).await }.boxed()
    });
}

/// Open an upload: build its chunk streams and writer task, and register
/// both with the upload service. The task is NOT queued here; it enters the
/// queue when the first file announcement arrives.
pub fn open_upload(
    services: &Services,
    upload_id: &str,
    root_folder_id: FileId,
    chunk_size: i64,
    total_size: i64,
) -> ServiceResult<Arc<Task<JobMeta>>> {
    let streams = UploadStreams::new(total_size, chunk_size);
    let caster = Caster::new(services.clients.clone());

    let meta = JobMeta::WriteFile {
        upload_id: upload_id.to_string(),
        root_folder_id: root_folder_id.clone(),
        chunk_size,
        total_size,
        streams: streams.clone(),
        caster: caster.clone(),
    };
    let task = services.tasks.new_task(meta, Some(caster))?;
    services
        .uploads
        .register(upload_id, root_folder_id, streams, task.id().clone());
    Ok(task)
}

/// Announce one new file on an upload stream, queueing the writer task the
/// first time.
pub async fn announce_upload_file(
    services: &Services,
    upload_id: &str,
    file: Arc<FileNode>,
    file_size: i64,
) -> ServiceResult<()> {
    let first = services
        .uploads
        .new_file_in_stream(upload_id, file, file_size)
        .await?;
    if first {
        let task_id = services.uploads.task_of(upload_id)?;
        if let Some(task) = services.tasks.get_task(&task_id) {
            services.tasks.global_pool().queue_task(&task)?;
        }
    }
    Ok(())
}

/// Cancel and wait out every task currently claiming `file` or one of its
/// descendants. Moves and deletes call this before touching the nodes.
pub async fn release_file_claims(services: &Services, file: &Arc<FileNode>) -> ServiceResult<()> {
    let mut held: Vec<String> = Vec::new();
    file.recursive_map(&mut |n| {
        held.extend(n.task_holds());
        Ok(())
    })?;

    for task_id in held {
        if let Some(task) = services.tasks.get_task(&task_pool::TaskId::new(task_id)) {
            task.cancel();
            task.wait().await;
        }
    }
    Ok(())
}

// ==================== Scan jobs ====================

/// Walk a directory: pick up anything new on disk, then fan a per-file scan
/// out for every displayable file without media, and wait for the children.
async fn scan_directory(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::ScanDirectory { folder_id } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for scan_directory".to_string()));
    };

    let folder = services
        .files
        .get_file(&folder_id)
        .map_err(TaskError::from)?;
    if !folder.is_dir() {
        return Err(TaskError::JobFailed(format!("{} is not a directory", folder_id)));
    }

    folder.add_task(task.id().as_str()).ok();
    let guard_file = folder.clone();
    let guard_id = task.id().clone();
    task.set_error_cleanup(move || {
        let _ = guard_file.remove_task(guard_id.as_str());
    });

    let tree = services.files.users_tree();

    // Materialize disk entries the tree has not seen, top-down.
    let mut frontier = vec![folder.clone()];
    while let Some(dir) = frontier.pop() {
        task.check_exit()?;
        tree.load_from_disk(&dir, None)
            .await
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;
        for node in dir.children() {
            if node.is_dir() && !node.filename().starts_with('.') {
                frontier.push(node);
            }
        }
    }

    // One child scan per displayable file that has no media yet.
    let wp = services.tasks.clone();
    let pool = wp.new_task_pool(true, Some(task.clone()));
    task.set_child_pool(pool.clone());

    let mut candidates = Vec::new();
    folder.recursive_map(&mut |n| {
        if n.is_dir() {
            return Ok(());
        }
        let name = n.filename();
        let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        if media_type_by_extension(ext).is_none() {
            return Ok(());
        }
        let cid = n.content_id();
        if !cid.is_empty() && services.media.get(&cid).is_some() {
            return Ok(());
        }
        candidates.push(n.clone());
        Ok(())
    })
    .map_err(|e| TaskError::JobFailed(e.to_string()))?;

    for file in &candidates {
        let meta = JobMeta::ScanFile { file_id: file.id() };
        if let Err(err) = wp.dispatch_job(meta, task.caster(), Some(pool.clone())) {
            warn!("dispatching file scan under {}: {}", folder_id, err);
        }
    }

    pool.signal_all_queued();
    pool.wait(true).await;
    task.check_exit()?;

    tree.resize_up(&folder, None)
        .await
        .map_err(|e| TaskError::JobFailed(e.to_string()))?;

    let errors = pool.errors();
    task.set_result("filesScanned", serde_json::json!(candidates.len()));
    task.set_result("errors", serde_json::json!(errors.len()));
    let _ = folder.remove_task(task.id().as_str());

    services.caster.push_weblens_event(
        ws_fabric::FOLDER_SCAN_COMPLETE_EVENT,
        folder_scan_content(&folder, candidates.len()),
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TaskError::JobFailed(format!(
            "{} file scans failed under {}",
            errors.len(),
            folder.portable_path()
        )))
    }
}

fn folder_scan_content(folder: &Arc<FileNode>, scanned: usize) -> ws_fabric::WsC {
    let mut content = ws_fabric::WsC::new();
    content.insert("folderId".to_string(), serde_json::json!(folder.id()));
    content.insert("filename".to_string(), serde_json::json!(folder.filename()));
    content.insert("filesScanned".to_string(), serde_json::json!(scanned));
    content
}

async fn scan_file(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::ScanFile { file_id } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for scan_file".to_string()));
    };

    let file = services.files.get_file(&file_id).map_err(TaskError::from)?;
    task.check_exit()?;

    let owner = services.files.owner_of(&file);
    let media = services
        .media
        .load_media_from_file(&file, &owner)
        .await
        .map_err(TaskError::from)?;

    task.set_result("contentId", serde_json::json!(media.content_id));
    task.set_result("filename", serde_json::json!(file.filename()));
    services
        .caster
        .push_file_update(&file.freeze(), Some(serde_json::json!(media)));
    Ok(())
}

// ==================== Hash job ====================

async fn hash_file(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::HashFile { file_id } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for hash_file".to_string()));
    };

    let file = services.files.get_file(&file_id).map_err(TaskError::from)?;
    if file.is_dir() {
        return Err(TaskError::JobFailed(format!("cannot hash directory {}", file_id)));
    }

    let content_id = services
        .files
        .ensure_content_id(&file)
        .await
        .map_err(TaskError::from)?;
    task.set_result("contentId", serde_json::json!(content_id));
    Ok(())
}

// ==================== Stats job ====================

/// Cumulative size per file extension under a directory.
async fn gather_fs_stats(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::GatherFsStats { root_id } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for gather_fs_stats".to_string()));
    };

    let root = services.files.get_file(&root_id).map_err(TaskError::from)?;

    let mut by_ext: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    root.recursive_map(&mut |n| {
        if n.is_dir() {
            return Ok(());
        }
        let name = n.filename();
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_else(|| "none".to_string());
        *by_ext.entry(ext).or_insert(0) += n.size();
        Ok(())
    })
    .map_err(|e| TaskError::JobFailed(e.to_string()))?;

    let mut sizes: Vec<serde_json::Value> = by_ext
        .into_iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();
    sizes.sort_by_key(|v| -v.get("value").and_then(|v| v.as_i64()).unwrap_or(0));

    task.set_result("sizesByExtension", serde_json::Value::Array(sizes));
    Ok(())
}
