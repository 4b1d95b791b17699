mod cache;

use crate::{FileService, RecordDb, ServiceError, ServiceResult};
use async_trait::async_trait;
use cache::ByteCache;
use file_tree::{ContentId, FileId, FileNode};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const MEDIA_TABLE: &str = "media";

/// Thumbnails top out at 500px on the long side, high-res pages at 2500px.
pub const LOWRES_MAX_SIDE: u32 = 500;
pub const HIGHRES_MAX_SIDE: u32 = 2500;
/// The frame sampled for a video's poster thumbnail.
pub const VIDEO_THUMB_FRAME: u32 = 10;

const BYTE_CACHE_CAPACITY: usize = 1500;
const BYTE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const RECOGNITION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaQuality {
    Thumbnail,
    Highres,
}

impl MediaQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaQuality::Thumbnail => "thumbnail",
            MediaQuality::Highres => "highres",
        }
    }
}

/// What the server knows how to display, keyed by extension.
#[derive(Debug, Clone)]
pub struct MediaType {
    pub mime: &'static str,
    pub extensions: &'static [&'static str],
    pub displayable: bool,
    pub raw: bool,
    pub video: bool,
    pub multi_page: bool,
}

static MEDIA_TYPES: Lazy<Vec<MediaType>> = Lazy::new(|| {
    vec![
        MediaType { mime: "image/jpeg", extensions: &["jpg", "jpeg"], displayable: true, raw: false, video: false, multi_page: false },
        MediaType { mime: "image/png", extensions: &["png"], displayable: true, raw: false, video: false, multi_page: false },
        MediaType { mime: "image/webp", extensions: &["webp"], displayable: true, raw: false, video: false, multi_page: false },
        MediaType { mime: "image/gif", extensions: &["gif"], displayable: true, raw: false, video: false, multi_page: false },
        MediaType { mime: "image/heic", extensions: &["heic", "heif"], displayable: true, raw: false, video: false, multi_page: false },
        MediaType { mime: "image/x-nikon-nef", extensions: &["nef"], displayable: true, raw: true, video: false, multi_page: false },
        MediaType { mime: "image/x-canon-cr2", extensions: &["cr2"], displayable: true, raw: true, video: false, multi_page: false },
        MediaType { mime: "image/x-adobe-dng", extensions: &["dng"], displayable: true, raw: true, video: false, multi_page: false },
        MediaType { mime: "application/pdf", extensions: &["pdf"], displayable: true, raw: false, video: false, multi_page: true },
        MediaType { mime: "video/mp4", extensions: &["mp4"], displayable: true, raw: false, video: true, multi_page: false },
        MediaType { mime: "video/quicktime", extensions: &["mov"], displayable: true, raw: false, video: true, multi_page: false },
        MediaType { mime: "video/webm", extensions: &["webm"], displayable: true, raw: false, video: true, multi_page: false },
    ]
});

pub fn media_type_by_mime(mime: &str) -> Option<&'static MediaType> {
    MEDIA_TYPES.iter().find(|t| t.mime == mime)
}

pub fn media_type_by_extension(ext: &str) -> Option<&'static MediaType> {
    let ext = ext.to_ascii_lowercase();
    MEDIA_TYPES
        .iter()
        .find(|t| t.extensions.contains(&ext.as_str()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub content_id: ContentId,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    pub create_date: i64,
    pub width: u32,
    pub height: u32,
    /// Milliseconds; nonzero exactly when the media is a video.
    #[serde(default)]
    pub duration: i64,
    #[serde(default = "one_page")]
    pub page_count: u32,
    pub mime: String,
    pub owner: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub recognition_tags: Vec<String>,
    #[serde(default)]
    pub rotation: i32,
}

fn one_page() -> u32 {
    1
}

impl Media {
    pub fn is_video(&self) -> bool {
        media_type_by_mime(&self.mime).map(|t| t.video).unwrap_or(false)
    }

    pub fn is_imported(&self) -> bool {
        !self.file_ids.is_empty()
    }

    fn validate(&self) -> ServiceResult<()> {
        if self.content_id.is_empty() {
            return Err(ServiceError::MediaNoId);
        }
        if self.page_count == 0 {
            return Err(ServiceError::MediaNoPages(self.content_id.to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ServiceError::MediaNoDimensions(self.content_id.to_string()));
        }
        if self.is_video() && self.duration <= 0 {
            return Err(ServiceError::MediaNoDuration(self.content_id.to_string()));
        }
        if !self.is_video() && self.duration > 0 {
            return Err(ServiceError::MediaHasDuration(self.content_id.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub page_count: u32,
    pub rotation: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub duration_ms: i64,
}

/// The codec boundary. Implementations wrap whatever image/video stack the
/// deployment carries; tests substitute a stub.
#[async_trait]
pub trait MediaCodec: Send + Sync {
    /// Dimensions, page count, and rotation of an encoded image.
    async fn decode(&self, data: &[u8], mime: &str) -> ServiceResult<DecodedImage>;

    /// Re-encode one page scaled to fit `max_side`, as webp.
    async fn encode_scaled(
        &self,
        data: &[u8],
        mime: &str,
        page: u32,
        max_side: u32,
    ) -> ServiceResult<Vec<u8>>;

    /// Container probe for videos.
    async fn probe(&self, path: &Path) -> ServiceResult<VideoProbe>;

    /// One video frame as jpeg.
    async fn extract_frame(&self, path: &Path, frame_index: u32) -> ServiceResult<Vec<u8>>;

    /// Millis since epoch from embedded metadata (SubSecCreateDate and its
    /// fallbacks), when present.
    fn parse_create_date(&self, data: &[u8]) -> Option<i64>;
}

/// Optional image-recognition tagger, guarded by deployment config.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn tag_image(&self, thumb: &[u8]) -> ServiceResult<Vec<String>>;
}

/// Derives and serves display artifacts for file content. Artifacts are
/// keyed by content id, so two identical uploads share one thumbnail set.
pub struct MediaService {
    db: Arc<RecordDb>,
    files: Arc<FileService>,
    codec: Arc<dyn MediaCodec>,
    recognizer: Option<Arc<dyn Recognizer>>,

    media_map: RwLock<HashMap<ContentId, Media>>,
    byte_cache: Mutex<ByteCache>,

    // Recognition runs one image at a time process-wide.
    recognition_lock: tokio::sync::Mutex<()>,
}

impl MediaService {
    pub fn new(
        db: Arc<RecordDb>,
        files: Arc<FileService>,
        codec: Arc<dyn MediaCodec>,
        recognizer: Option<Arc<dyn Recognizer>>,
    ) -> ServiceResult<Arc<Self>> {
        db.ensure_table(MEDIA_TABLE)?;
        let loaded: Vec<Media> = db.all(MEDIA_TABLE)?;
        let media_map = loaded
            .into_iter()
            .map(|m| (m.content_id.clone(), m))
            .collect::<HashMap<_, _>>();
        debug!("MediaService: loaded {} media", media_map.len());

        Ok(Arc::new(Self {
            db,
            files,
            codec,
            recognizer,
            media_map: RwLock::new(media_map),
            byte_cache: Mutex::new(ByteCache::new(BYTE_CACHE_CAPACITY, BYTE_CACHE_TTL)),
            recognition_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn get(&self, content_id: &ContentId) -> Option<Media> {
        self.media_map.read().unwrap().get(content_id).cloned()
    }

    pub fn all(&self) -> Vec<Media> {
        self.media_map.read().unwrap().values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.media_map.read().unwrap().len()
    }

    /// `<contentId>-<quality>[_<page>].cache`, under `CACHES/thumbs`.
    pub fn cache_file_name(content_id: &ContentId, quality: MediaQuality, page: u32) -> String {
        match quality {
            MediaQuality::Highres if page > 0 => {
                format!("{}-{}_{}.cache", content_id, quality.as_str(), page)
            }
            _ => format!("{}-{}.cache", content_id, quality.as_str()),
        }
    }

    fn persist(&self, media: &Media) -> ServiceResult<()> {
        self.db.upsert(MEDIA_TABLE, media.content_id.as_str(), media)?;
        self.media_map
            .write()
            .unwrap()
            .insert(media.content_id.clone(), media.clone());
        Ok(())
    }

    /// Import (or re-link) a file's content as media: read metadata, build
    /// the cache artifacts, persist the record.
    pub async fn load_media_from_file(&self, file: &Arc<FileNode>, owner: &str) -> ServiceResult<Media> {
        let content_id = self.files.ensure_content_id(file).await?;

        if let Some(mut existing) = self.get(&content_id) {
            if !existing.file_ids.contains(&file.id()) {
                existing.file_ids.push(file.id());
                self.persist(&existing)?;
            }
            return Ok(existing);
        }

        let filename = file.filename();
        let ext = filename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let mtype = media_type_by_extension(ext)
            .ok_or_else(|| ServiceError::MediaBadMime(filename.clone()))?;
        if !mtype.displayable {
            return Err(ServiceError::MediaBadMime(mtype.mime.to_string()));
        }

        let data = file.read_all().await.map_err(ServiceError::Fs)?;
        let create_date = self
            .codec
            .parse_create_date(&data)
            .unwrap_or_else(|| file.mod_time());

        let mut media = Media {
            content_id: content_id.clone(),
            file_ids: vec![file.id()],
            create_date,
            width: 0,
            height: 0,
            duration: 0,
            page_count: 1,
            mime: mtype.mime.to_string(),
            owner: owner.to_string(),
            hidden: false,
            liked_by: Vec::new(),
            recognition_tags: Vec::new(),
            rotation: 0,
        };

        if mtype.video {
            let probe = self.codec.probe(&file.abs_path()).await?;
            media.width = probe.width;
            media.height = probe.height;
            media.duration = probe.duration_ms;

            // A video's poster is one extracted frame; the "highres" is the
            // source file itself, so no highres artifact is cached.
            let poster = self
                .codec
                .extract_frame(&file.abs_path(), VIDEO_THUMB_FRAME)
                .await?;
            self.write_cache_artifact(&content_id, MediaQuality::Thumbnail, 0, &poster)
                .await?;
        } else {
            let decoded = self.codec.decode(&data, mtype.mime).await?;
            media.width = decoded.width;
            media.height = decoded.height;
            media.rotation = decoded.rotation;
            media.page_count = if mtype.multi_page {
                decoded.page_count.max(1)
            } else {
                1
            };

            for page in 0..media.page_count {
                let highres = self
                    .codec
                    .encode_scaled(&data, mtype.mime, page, HIGHRES_MAX_SIDE)
                    .await?;
                self.write_cache_artifact(&content_id, MediaQuality::Highres, page, &highres)
                    .await?;
            }
            let thumb = self
                .codec
                .encode_scaled(&data, mtype.mime, 0, LOWRES_MAX_SIDE)
                .await?;
            self.write_cache_artifact(&content_id, MediaQuality::Thumbnail, 0, &thumb)
                .await?;
        }

        media.validate()?;
        self.persist(&media)?;

        if self.recognizer.is_some() {
            if let Err(err) = self.run_recognition(&content_id).await {
                // Tagging is best-effort decoration, never a load failure.
                warn!("recognition for {} failed: {}", content_id, err);
            }
        }

        Ok(media)
    }

    async fn write_cache_artifact(
        &self,
        content_id: &ContentId,
        quality: MediaQuality,
        page: u32,
        data: &[u8],
    ) -> ServiceResult<()> {
        let name = Self::cache_file_name(content_id, quality, page);
        let node = self.files.new_cache_file(&name).await?;
        node.write(data).await.map_err(ServiceError::Fs)?;
        Ok(())
    }

    /// Encoded bytes for one artifact, through the in-memory byte cache.
    pub async fn fetch_cache_data(
        &self,
        content_id: &ContentId,
        quality: MediaQuality,
        page: u32,
    ) -> ServiceResult<Vec<u8>> {
        let key = format!("{}-{}-{}", content_id, quality.as_str(), page);
        if let Some(hit) = self.byte_cache.lock().unwrap().get(&key) {
            return Ok(hit);
        }

        let name = Self::cache_file_name(content_id, quality, page);
        let node = self.files.get_media_cache_by_filename(&name)?;
        let data = node.read_all().await.map_err(ServiceError::Fs)?;

        self.byte_cache.lock().unwrap().put(&key, data.clone());
        Ok(data)
    }

    pub fn add_file_to_media(&self, content_id: &ContentId, file_id: &FileId) -> ServiceResult<()> {
        let mut media = self
            .get(content_id)
            .ok_or_else(|| ServiceError::NoCache(content_id.to_string()))?;
        if !media.file_ids.contains(file_id) {
            media.file_ids.push(file_id.clone());
            self.persist(&media)?;
        }
        Ok(())
    }

    pub fn remove_file_from_media(&self, content_id: &ContentId, file_id: &FileId) -> ServiceResult<()> {
        let mut media = self
            .get(content_id)
            .ok_or_else(|| ServiceError::NoCache(content_id.to_string()))?;
        media.file_ids.retain(|id| id != file_id);
        self.persist(&media)
    }

    pub fn set_hidden(&self, content_id: &ContentId, hidden: bool) -> ServiceResult<()> {
        let mut media = self
            .get(content_id)
            .ok_or_else(|| ServiceError::NoCache(content_id.to_string()))?;
        media.hidden = hidden;
        self.persist(&media)
    }

    pub fn set_liked_by(&self, content_id: &ContentId, username: &str, liked: bool) -> ServiceResult<()> {
        let mut media = self
            .get(content_id)
            .ok_or_else(|| ServiceError::NoCache(content_id.to_string()))?;
        media.liked_by.retain(|u| u != username);
        if liked {
            media.liked_by.push(username.to_string());
        }
        self.persist(&media)
    }

    async fn run_recognition(&self, content_id: &ContentId) -> ServiceResult<()> {
        let Some(recognizer) = self.recognizer.clone() else {
            return Ok(());
        };

        let thumb = self
            .fetch_cache_data(content_id, MediaQuality::Thumbnail, 0)
            .await?;

        let _guard = self.recognition_lock.lock().await;
        let tags = tokio::time::timeout(RECOGNITION_TIMEOUT, recognizer.tag_image(&thumb))
            .await
            .map_err(|_| ServiceError::RemoteError("recognition timed out".to_string()))??;

        let mut media = self
            .get(content_id)
            .ok_or_else(|| ServiceError::NoCache(content_id.to_string()))?;
        media.recognition_tags = tags;
        self.persist(&media)
    }

    pub fn drop_byte_cache(&self) {
        self.byte_cache.lock().unwrap().clear();
    }
}
