mod access;
mod file_service;
mod instance;
mod share;
mod store;
mod upload;
mod users;

pub mod backup;
pub mod jobs;
pub mod media;

pub use access::*;
pub use store::*;
pub use file_service::*;
pub use instance::*;
pub use share::*;
pub use upload::*;
pub use users::*;

#[cfg(test)]
mod service_tests;

use file_tree::FsError;
use std::sync::Arc;
use task_pool::TaskError;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("no file access: {0}")]
    NoFileAccess(String),
    #[error("user not authenticated")]
    UserNotAuthenticated,
    #[error("user not authorized: {0}")]
    UserNotAuthorized(String),
    #[error("bad password")]
    BadPassword,
    #[error("no such user: {0}")]
    NoUser(String),
    #[error("user already exists: {0}")]
    UserAlreadyExists(String),
    #[error("api key in use: {0}")]
    KeyInUse(String),
    #[error("no such api key")]
    NoApiKey,
    #[error("no such share: {0}")]
    NoShare(String),
    #[error("no server name: {0}")]
    NoServerName(String),
    #[error("no server id: {0}")]
    NoServerId(String),
    #[error("no server key")]
    NoServerKey,
    #[error("no core address: {0}")]
    NoCoreAddress(String),
    #[error("local server already initialized")]
    DuplicateLocalServer,
    #[error("server not initialized")]
    ServerNotInitialized,
    #[error("operation not allowed on backup server")]
    ServerIsBackup,
    #[error("media is nil")]
    MediaNil,
    #[error("media has no id")]
    MediaNoId,
    #[error("media has no pages: {0}")]
    MediaNoPages(String),
    #[error("media has no dimensions: {0}")]
    MediaNoDimensions(String),
    #[error("media has no files: {0}")]
    MediaNoFiles(String),
    #[error("bad mime type: {0}")]
    MediaBadMime(String),
    #[error("video media has no duration: {0}")]
    MediaNoDuration(String),
    #[error("non-video media has duration: {0}")]
    MediaHasDuration(String),
    #[error("media is not video: {0}")]
    MediaNotVideo(String),
    #[error("media already exists: {0}")]
    MediaAlreadyExists(String),
    #[error("no cache entry: {0}")]
    NoCache(String),
    #[error("no upload: {0}")]
    NoUpload(String),
    #[error("bad upload range: {0}")]
    BadRange(String),
    #[error("upload stalled")]
    UploadStalled,
    #[error("file error: {0}")]
    Fs(#[from] FsError),
    #[error("task error: {0}")]
    Task(#[from] TaskError),
    #[error("db error: {0}")]
    DbError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::IoError(err.to_string())
    }
}

impl From<ServiceError> for TaskError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Task(t) => t,
            other => TaskError::JobFailed(other.to_string()),
        }
    }
}

/// Everything the jobs and the HTTP/WS boundary need, built once at startup
/// and passed explicitly. Tests stub individual members.
pub struct ServiceBundle {
    pub instances: Arc<InstanceService>,
    pub users: Arc<UserService>,
    pub files: Arc<FileService>,
    pub media: Arc<media::MediaService>,
    pub access: Arc<AccessService>,
    pub shares: Arc<ShareService>,
    pub uploads: Arc<UploadService>,
    pub tasks: Arc<task_pool::WorkerPool<jobs::JobMeta>>,
    pub clients: Arc<ws_fabric::ClientManager>,
    pub caster: Arc<ws_fabric::Caster>,
}

pub type Services = Arc<ServiceBundle>;
