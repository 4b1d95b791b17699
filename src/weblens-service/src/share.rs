use crate::{RecordDb, ServiceError, ServiceResult};
use file_tree::{now_millis, FileId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const SHARES_TABLE: &str = "shares";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "album")]
    Album,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub share_id: String,
    pub kind: ShareKind,
    /// The file id for file shares, the album id for album shares.
    pub content_id: String,
    pub owner: String,
    #[serde(default)]
    pub accessors: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub enabled: bool,
    /// Millis timestamp; zero means the share never expires.
    #[serde(default)]
    pub expires: i64,
}

impl Share {
    pub fn new_file_share(file_id: &FileId, owner: &str, accessors: Vec<String>, public: bool) -> Self {
        Self {
            share_id: new_share_nonce(),
            kind: ShareKind::File,
            content_id: file_id.to_string(),
            owner: owner.to_string(),
            accessors,
            public,
            enabled: true,
            expires: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires != 0 && self.expires < now_millis()
    }

    /// Disabled or expired shares grant nothing; public shares pass any
    /// authenticated user; otherwise the requester must be the owner or a
    /// listed accessor.
    pub fn grants_access_to(&self, username: &str) -> bool {
        if !self.enabled || self.is_expired() {
            return false;
        }
        if self.owner == username {
            return true;
        }
        if self.public {
            return !username.is_empty();
        }
        self.accessors.iter().any(|a| a == username)
    }
}

fn new_share_nonce() -> String {
    let mut raw = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct ShareService {
    db: Arc<RecordDb>,
    shares: RwLock<HashMap<String, Share>>,
}

impl ShareService {
    pub fn new(db: Arc<RecordDb>) -> ServiceResult<Arc<Self>> {
        db.ensure_table(SHARES_TABLE)?;
        let loaded: Vec<Share> = db.all(SHARES_TABLE)?;
        let shares = loaded
            .into_iter()
            .map(|s| (s.share_id.clone(), s))
            .collect::<HashMap<_, _>>();
        Ok(Arc::new(Self {
            db,
            shares: RwLock::new(shares),
        }))
    }

    pub fn add(&self, share: Share) -> ServiceResult<()> {
        self.db.upsert(SHARES_TABLE, &share.share_id, &share)?;
        self.shares.write().unwrap().insert(share.share_id.clone(), share);
        Ok(())
    }

    pub fn get(&self, share_id: &str) -> ServiceResult<Share> {
        self.shares
            .read()
            .unwrap()
            .get(share_id)
            .cloned()
            .ok_or_else(|| ServiceError::NoShare(share_id.to_string()))
    }

    /// The file share pointing at a specific file, if one exists.
    pub fn get_file_share(&self, file_id: &FileId) -> Option<Share> {
        self.shares
            .read()
            .unwrap()
            .values()
            .find(|s| s.kind == ShareKind::File && s.content_id == file_id.as_str())
            .cloned()
    }

    pub fn shares_for_owner(&self, owner: &str) -> Vec<Share> {
        self.shares
            .read()
            .unwrap()
            .values()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect()
    }

    pub fn set_enabled(&self, share_id: &str, enabled: bool) -> ServiceResult<()> {
        let mut share = self.get(share_id)?;
        share.enabled = enabled;
        self.add(share)
    }

    pub fn add_accessors(&self, share_id: &str, usernames: &[String]) -> ServiceResult<Share> {
        let mut share = self.get(share_id)?;
        for name in usernames {
            if !share.accessors.contains(name) {
                share.accessors.push(name.clone());
            }
        }
        self.add(share.clone())?;
        Ok(share)
    }

    pub fn del(&self, share_id: &str) -> ServiceResult<()> {
        if !self.db.delete(SHARES_TABLE, share_id)? {
            return Err(ServiceError::NoShare(share_id.to_string()));
        }
        self.shares.write().unwrap().remove(share_id);
        Ok(())
    }
}
