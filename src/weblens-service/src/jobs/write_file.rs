use crate::jobs::{JobMeta, SCAN_DIRECTORY_JOB};
use crate::upload::parse_range_header;
use crate::Services;
use file_tree::{FileId, FileNode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task_pool::{JobResult, Task, TaskError};

/// An upload with no chunk for this long is dead.
const CHUNK_STARVATION_TIMEOUT: Duration = Duration::from_secs(10);

struct UploadProgress {
    file: Arc<FileNode>,
    bytes_written: i64,
    total: i64,
}

/// The bottom half of the upload pipeline: drain range-addressed chunks off
/// the stream and into their files, finalize each file with its content id,
/// and promote it from the temp directory into the tree.
///
/// The per-file byte counters live entirely on this task, so they need no
/// synchronization. The caster runs buffered for the duration and is
/// flushed closed at the end.
pub(crate) async fn write_file(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::WriteFile { upload_id, root_folder_id, streams, caster, .. } =
        task.metadata().clone()
    else {
        return Err(TaskError::Internal("wrong metadata for write_file".to_string()));
    };

    let root_file = services
        .files
        .get_file(&root_folder_id)
        .map_err(|_| TaskError::JobFailed(format!("no root folder {} in upload", root_folder_id)))?;

    let mut rx = streams
        .take_receiver()
        .await
        .map_err(|e| TaskError::Internal(e.to_string()))?;

    caster.disable_auto_flush();

    let mut file_map: HashMap<FileId, UploadProgress> = HashMap::new();
    let mut top_levels: Vec<Arc<FileNode>> = Vec::new();

    // Shared with the error-cleanup hook so claims are released even when
    // the task dies mid-stream.
    let using: Arc<Mutex<Vec<Arc<FileNode>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let using = using.clone();
        let task_id = task.id().clone();
        let caster = caster.clone();
        task.set_error_cleanup(move || {
            for file in using.lock().unwrap().drain(..) {
                let _ = file.remove_task(task_id.as_str());
            }
            caster.close();
        });
    }

    let tree = services.files.users_tree();
    let journal = tree.journal();
    let event = journal.new_event();

    loop {
        let chunk = tokio::select! {
            _ = task.cancelled() => return Err(TaskError::Cancelled),
            received = tokio::time::timeout(CHUNK_STARVATION_TIMEOUT, rx.recv()) => {
                match received {
                    Err(_) => {
                        warn!("upload [{}] starved for chunks, aborting", upload_id);
                        return Err(TaskError::JobFailed("upload stalled".to_string()));
                    }
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk,
                }
            }
        };

        let (low, high, total) = parse_range_header(&chunk.content_range)
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;

        if let Some(new_file) = chunk.new_file {
            // Remember which immediate child of the upload root this file
            // arrived under; those are the scan targets at the end.
            let mut top = new_file.clone();
            while let Some(parent) = top.parent() {
                if parent.id() == root_file.id() {
                    break;
                }
                top = parent;
            }
            if !top_levels.iter().any(|f| f.id() == top.id()) {
                top_levels.push(top);
            }

            new_file.add_task(task.id().as_str()).ok();
            using.lock().unwrap().push(new_file.clone());
            file_map.insert(
                new_file.id(),
                UploadProgress { file: new_file, bytes_written: 0, total },
            );
            continue;
        }

        // `0-0/-1` is the client telling us to forget one file.
        if total == -1 {
            if let Some(dropped) = file_map.remove(&chunk.file_id) {
                let _ = dropped.file.remove_task(task.id().as_str());
                using.lock().unwrap().retain(|f| f.id() != dropped.file.id());
            }
            continue;
        }

        let progress = file_map.get_mut(&chunk.file_id).ok_or_else(|| {
            TaskError::JobFailed(format!("chunk for unknown file {}", chunk.file_id))
        })?;

        // A range of 0-1 carries two bytes; the counter tracks the
        // inclusive width.
        progress.bytes_written += (high - low) + 1;
        progress
            .file
            .write_at(&chunk.chunk, low)
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;

        if progress.bytes_written >= progress.total {
            // Hash before attaching, so the journal never sees the create
            // action without its content id.
            let finished = file_map.remove(&chunk.file_id).unwrap();
            services
                .files
                .ensure_content_id(&finished.file)
                .await
                .map_err(|e| TaskError::JobFailed(e.to_string()))?;

            let parent = finished
                .file
                .parent()
                .ok_or_else(|| TaskError::Internal("upload file has no parent".to_string()))?;
            tree.attach(&finished.file, &parent, Some(&event))
                .await
                .map_err(|e| TaskError::JobFailed(e.to_string()))?;

            let _ = finished.file.remove_task(task.id().as_str());
            using.lock().unwrap().retain(|f| f.id() != finished.file.id());
            caster.push_file_create(&finished.file.freeze());
        }

        if file_map.is_empty() && rx.is_empty() {
            break;
        }
        task.check_exit()?;
    }

    journal.log_event(&event).await;
    event.wait_logged().await;
    task.check_exit()?;

    // Each uploaded top level gets its sizes refreshed and a scan; bare
    // files at the root share a single scan of the root itself.
    let mut doing_root_scan = false;
    for top in &top_levels {
        tree.resize_up(top, None)
            .await
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;

        if top.is_dir() {
            caster.push_file_update(&top.freeze(), None);
            let meta = JobMeta::ScanDirectory { folder_id: top.id() };
            if let Err(err) = services.tasks.dispatch_job(meta, task.caster(), task.pool()) {
                warn!("dispatching {} after upload: {}", SCAN_DIRECTORY_JOB, err);
            }
        } else if !doing_root_scan {
            let meta = JobMeta::ScanDirectory { folder_id: root_file.id() };
            if let Err(err) = services.tasks.dispatch_job(meta, task.caster(), task.pool()) {
                warn!("dispatching root scan after upload: {}", err);
            }
            doing_root_scan = true;
        }
    }

    caster.close();
    services.uploads.close_upload(&upload_id);
    task.set_result("filesUploaded", serde_json::json!(top_levels.len()));
    Ok(())
}
