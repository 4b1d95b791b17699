use crate::jobs::JobMeta;
use crate::Services;
use file_tree::FileNode;
use std::io::Write;
use std::sync::Arc;
use task_pool::{JobResult, Task, TaskError, TaskResult};
use zip::write::SimpleFileOptions;

/// Broadcast zip progress roughly this often, by bytes written.
const ZIP_PROGRESS_CHUNK: i64 = 10 * 1024 * 1024;

/// Build a takeout archive for a set of files. The takeout id is the task
/// id, and the task is persistent: asking for the same file set again
/// returns the finished archive immediately instead of rebuilding it.
pub(crate) async fn create_zip(task: Arc<Task<JobMeta>>, services: Services) -> JobResult {
    let JobMeta::CreateZip { file_ids, username, .. } = task.metadata().clone() else {
        return Err(TaskError::Internal("wrong metadata for create_zip".to_string()));
    };

    task.set_persistent(true);
    let takeout_id = task.id().to_string();

    if let Ok(existing) = services.files.get_zip(&takeout_id) {
        if existing.size() > 0 {
            task.set_result("takeoutId", serde_json::json!(takeout_id));
            task.set_result("filename", serde_json::json!(existing.filename()));
            return Ok(());
        }
    }

    let (targets, missing) = services.files.get_files(&file_ids);
    if !missing.is_empty() {
        return Err(TaskError::JobFailed(format!(
            "{} of {} requested files do not exist",
            missing.len(),
            file_ids.len()
        )));
    }

    // Flatten the selection into (archive path, node) pairs and total the
    // bytes up front so progress has a denominator.
    let mut entries: Vec<(String, Arc<FileNode>)> = Vec::new();
    let mut total_bytes = 0i64;
    for target in &targets {
        let base = target
            .parent()
            .map(|p| p.portable_path().relative_path().to_string())
            .unwrap_or_default();
        target
            .recursive_map(&mut |n| {
                let rel = n.portable_path().relative_path()[base.len()..].to_string();
                if !n.is_dir() {
                    total_bytes += n.size();
                }
                entries.push((rel, n.clone()));
                Ok(())
            })
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;
    }

    let zip_node = services
        .files
        .new_zip(&takeout_id)
        .await
        .map_err(|e| TaskError::JobFailed(e.to_string()))?;

    let out = std::fs::File::create(zip_node.abs_path())
        .map_err(|e| TaskError::JobFailed(format!("create zip: {}", e)))?;
    let mut writer = zip::ZipWriter::new(out);
    let options = SimpleFileOptions::default();

    let mut bytes_written = 0i64;
    let mut last_progress = 0i64;
    for (rel, node) in &entries {
        task.check_exit()?;

        if node.is_dir() {
            writer
                .add_directory(rel.trim_end_matches('/'), options)
                .map_err(|e| TaskError::JobFailed(format!("zip dir {}: {}", rel, e)))?;
            continue;
        }

        let data = node
            .read_all()
            .await
            .map_err(|e| TaskError::JobFailed(e.to_string()))?;
        writer
            .start_file(rel.as_str(), options)
            .map_err(|e| TaskError::JobFailed(format!("zip entry {}: {}", rel, e)))?;
        writer
            .write_all(&data)
            .map_err(|e| TaskError::JobFailed(format!("zip write {}: {}", rel, e)))?;

        bytes_written += data.len() as i64;
        if bytes_written - last_progress >= ZIP_PROGRESS_CHUNK {
            last_progress = bytes_written;
            push_zip_progress(&task, bytes_written, total_bytes);
        }
    }

    writer
        .finish()
        .map_err(|e| TaskError::JobFailed(format!("finish zip: {}", e)))?;
    zip_node.load_stat().ok();

    task.set_result("takeoutId", serde_json::json!(takeout_id));
    task.set_result("filename", serde_json::json!(zip_node.filename()));
    task.set_result("requester", serde_json::json!(username));

    if let Some(caster) = task.caster() {
        let mut result = TaskResult::new();
        result.insert("takeoutId".to_string(), serde_json::json!(takeout_id));
        result.insert("filename".to_string(), serde_json::json!(zip_node.filename()));
        caster.push_task_update(task.id(), task.job_name(), ws_fabric::ZIP_COMPLETE_EVENT, result);
    }
    Ok(())
}

fn push_zip_progress(task: &Arc<Task<JobMeta>>, done: i64, total: i64) {
    let Some(caster) = task.caster() else { return };
    let mut result = TaskResult::new();
    result.insert("bytesSoFar".to_string(), serde_json::json!(done));
    result.insert("bytesTotal".to_string(), serde_json::json!(total));
    caster.push_task_update(task.id(), task.job_name(), ws_fabric::ZIP_PROGRESS_EVENT, result);
}
