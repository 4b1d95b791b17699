use crate::{ServiceError, ServiceResult};
use file_tree::{FileId, FileNode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Floor for the chunk buffer, so tiny uploads still overlap client reads
/// with disk writes.
const MIN_CHUNK_BUFFER: usize = 10;

/// One range-addressed piece of an upload. A chunk carrying `new_file`
/// announces that file to the writer; a chunk with total `-1` aborts one.
pub struct FileChunk {
    pub file_id: FileId,
    pub content_range: String,
    pub chunk: Vec<u8>,
    pub new_file: Option<Arc<FileNode>>,
}

/// The channel pair feeding one upload task. The receiver is taken once by
/// the write-file job; senders live on the HTTP handlers.
pub struct UploadStreams {
    tx: mpsc::Sender<FileChunk>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<FileChunk>>>,
}

impl UploadStreams {
    pub fn new(total_size: i64, chunk_size: i64) -> Arc<Self> {
        let depth = if chunk_size > 0 {
            ((total_size / chunk_size) as usize).max(MIN_CHUNK_BUFFER)
        } else {
            MIN_CHUNK_BUFFER
        };
        let (tx, rx) = mpsc::channel(depth);
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
        })
    }

    pub async fn send(&self, chunk: FileChunk) -> ServiceResult<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| ServiceError::NoUpload("upload writer is gone".to_string()))
    }

    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Hand the receiver to the writer task. Single-consumer: the second
    /// take fails.
    pub async fn take_receiver(&self) -> ServiceResult<mpsc::Receiver<FileChunk>> {
        self.rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::Internal("upload stream already claimed".to_string()))
    }
}

/// Parse a `Content-Range`-style `lo-hi/total` header. The sentinels are
/// `0-0/<size>` announcing a new file and `0-0/-1` aborting one.
pub fn parse_range_header(content_range: &str) -> ServiceResult<(i64, i64, i64)> {
    let (range, total) = content_range
        .split_once('/')
        .ok_or_else(|| ServiceError::BadRange(content_range.to_string()))?;
    let (low, high) = range
        .split_once('-')
        .ok_or_else(|| ServiceError::BadRange(content_range.to_string()))?;

    let low = low
        .parse::<i64>()
        .map_err(|_| ServiceError::BadRange(content_range.to_string()))?;
    let high = high
        .parse::<i64>()
        .map_err(|_| ServiceError::BadRange(content_range.to_string()))?;
    let total = total
        .parse::<i64>()
        .map_err(|_| ServiceError::BadRange(content_range.to_string()))?;

    if total != -1 && (low > high || high >= total.max(1)) && !(low == 0 && high == 0) {
        return Err(ServiceError::BadRange(content_range.to_string()));
    }
    Ok((low, high, total))
}

struct Upload {
    root_folder_id: FileId,
    streams: Arc<UploadStreams>,
    task_id: task_pool::TaskId,
    announced: std::sync::atomic::AtomicBool,
}

/// Open uploads by id. The HTTP layer opens an upload, then feeds
/// range-addressed chunks at it; the write-file task drains them.
pub struct UploadService {
    uploads: RwLock<HashMap<String, Upload>>,
}

impl UploadService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(
        &self,
        upload_id: &str,
        root_folder_id: FileId,
        streams: Arc<UploadStreams>,
        task_id: task_pool::TaskId,
    ) {
        self.uploads.write().unwrap().insert(
            upload_id.to_string(),
            Upload {
                root_folder_id,
                streams,
                task_id,
                announced: std::sync::atomic::AtomicBool::new(false),
            },
        );
    }

    pub fn root_folder_of(&self, upload_id: &str) -> ServiceResult<FileId> {
        let uploads = self.uploads.read().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| ServiceError::NoUpload(upload_id.to_string()))?;
        Ok(upload.root_folder_id.clone())
    }

    pub fn task_of(&self, upload_id: &str) -> ServiceResult<task_pool::TaskId> {
        let uploads = self.uploads.read().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| ServiceError::NoUpload(upload_id.to_string()))?;
        Ok(upload.task_id.clone())
    }

    fn streams_of(&self, upload_id: &str) -> ServiceResult<Arc<UploadStreams>> {
        let uploads = self.uploads.read().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| ServiceError::NoUpload(upload_id.to_string()))?;
        Ok(upload.streams.clone())
    }

    /// Announce a new file in the upload. Returns true when this is the
    /// upload's first file, which is the moment the writer task must be
    /// queued.
    pub async fn new_file_in_stream(
        &self,
        upload_id: &str,
        file: Arc<FileNode>,
        file_size: i64,
    ) -> ServiceResult<bool> {
        let streams = self.streams_of(upload_id)?;
        streams
            .send(FileChunk {
                file_id: file.id(),
                content_range: format!("0-0/{}", file_size),
                chunk: Vec::new(),
                new_file: Some(file),
            })
            .await?;

        let uploads = self.uploads.read().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| ServiceError::NoUpload(upload_id.to_string()))?;
        Ok(!upload
            .announced
            .swap(true, std::sync::atomic::Ordering::AcqRel))
    }

    pub async fn add_chunk_to_stream(
        &self,
        upload_id: &str,
        file_id: FileId,
        chunk: Vec<u8>,
        content_range: &str,
    ) -> ServiceResult<()> {
        parse_range_header(content_range)?;
        let streams = self.streams_of(upload_id)?;
        streams
            .send(FileChunk {
                file_id,
                content_range: content_range.to_string(),
                chunk,
                new_file: None,
            })
            .await
    }

    /// Tell the writer to drop one file from the upload.
    pub async fn cancel_file_in_stream(&self, upload_id: &str, file_id: FileId) -> ServiceResult<()> {
        let streams = self.streams_of(upload_id)?;
        streams
            .send(FileChunk {
                file_id,
                content_range: "0-0/-1".to_string(),
                chunk: Vec::new(),
                new_file: None,
            })
            .await
    }

    pub fn close_upload(&self, upload_id: &str) {
        self.uploads.write().unwrap().remove(upload_id);
    }
}

#[cfg(test)]
mod range_tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("0-1023/4096").unwrap(), (0, 1023, 4096));
        assert_eq!(parse_range_header("0-0/100").unwrap(), (0, 0, 100));
        assert_eq!(parse_range_header("0-0/-1").unwrap(), (0, 0, -1));
        assert!(parse_range_header("1024/4096").is_err());
        assert!(parse_range_header("10-5/4096").is_err());
        assert!(parse_range_header("abc-5/4096").is_err());
        assert!(parse_range_header("0-5000/4096").is_err());
    }
}
