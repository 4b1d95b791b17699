mod file;
mod portable;
mod tree;

pub mod journal;

#[cfg(test)]
mod tree_tests;

pub use file::*;
pub use portable::*;
pub use tree::*;

pub use journal::{ActionType, FileAction, FileEvent, Journal, JournalStore, Lifetime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file not found: {0}")]
    NoFile(String),
    #[error("file already exists: {0}")]
    FileAlreadyExists(String),
    #[error("directory already exists: {0}")]
    DirAlreadyExists(String),
    #[error("operation requires a regular file: {0}")]
    IsDir(String),
    #[error("operation requires a directory: {0}")]
    DirectoryRequired(String),
    #[error("no file tree: {0}")]
    NoFileTree(String),
    #[error("no lifetime: {0}")]
    NoLifetime(String),
    #[error("no file action: {0}")]
    NoFileAction(String),
    #[error("no content id: {0}")]
    NoContentId(String),
    #[error("directory has no children: {0}")]
    NoChildren(String),
    #[error("short read: {0}")]
    BadReadCount(String),
    #[error("already watching: {0}")]
    AlreadyWatching(String),
    #[error("file already claimed by task: {0}")]
    FileAlreadyHasTask(String),
    #[error("file has no such task: {0}")]
    FileNoTask(String),
    #[error("journal server mismatch: {0}")]
    JournalServerMismatch(String),
    #[error("invalid portable path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NoFile(_))
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(FileId);
string_id!(ContentId);
string_id!(EventId);
string_id!(InstanceId);

/// How many characters of the base64url digest identify file content.
pub const CONTENT_ID_LEN: usize = 20;

/// Content ids are the dedup key for identical bytes: the first
/// [`CONTENT_ID_LEN`] characters of base64url(SHA-256(bytes)).
pub fn content_id_from_hash(digest: &[u8]) -> ContentId {
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    ContentId::new(&encoded[..CONTENT_ID_LEN.min(encoded.len())])
}

pub fn content_id_from_bytes(data: &[u8]) -> ContentId {
    let mut hasher = Sha256::new();
    hasher.update(data);
    content_id_from_hash(&hasher.finalize())
}

/// File ids are derived from the portable path, so two inserts of the same
/// path collide and the tree can reject the duplicate.
pub fn file_id_from_path(portable: &str) -> FileId {
    let mut hasher = Sha256::new();
    hasher.update(portable.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", b));
    }
    FileId::new(out)
}

pub fn new_event_id() -> EventId {
    let mut raw = [0u8; 12];
    rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
    let mut out = String::with_capacity(24);
    for b in raw {
        out.push_str(&format!("{:02x}", b));
    }
    EventId::new(out)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn test_content_id_stable() {
        let a = content_id_from_bytes(b"hello weblens");
        let b = content_id_from_bytes(b"hello weblens");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), CONTENT_ID_LEN);
    }

    #[test]
    fn test_content_id_is_url_safe() {
        let cid = content_id_from_bytes(&[0xffu8; 64]);
        assert!(!cid.as_str().contains('+'));
        assert!(!cid.as_str().contains('/'));
        assert!(!cid.as_str().contains('='));
    }

    #[test]
    fn test_file_id_collides_on_same_path() {
        assert_eq!(
            file_id_from_path("USERS:alice/pics/"),
            file_id_from_path("USERS:alice/pics/")
        );
        assert_ne!(
            file_id_from_path("USERS:alice/pics/"),
            file_id_from_path("USERS:alice/docs/")
        );
    }
}
