use crate::{RecordDb, ServiceError, ServiceResult, Share, ShareKind, User};
use file_tree::{now_millis, FileNode, InstanceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const KEYS_TABLE: &str = "api_keys";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub key: String,
    pub owner: String,
    pub created_time: i64,
    /// The remote server this key was bound to, once one claims it.
    #[serde(skip_serializing_if = "InstanceId::is_empty", default)]
    pub remote_using: InstanceId,
}

/// File access resolution and api-key lifecycle.
pub struct AccessService {
    db: Arc<RecordDb>,
    keys: RwLock<HashMap<String, ApiKeyInfo>>,
}

impl AccessService {
    pub fn new(db: Arc<RecordDb>) -> ServiceResult<Arc<Self>> {
        db.ensure_table(KEYS_TABLE)?;
        let loaded: Vec<ApiKeyInfo> = db.all(KEYS_TABLE)?;
        let keys = loaded
            .into_iter()
            .map(|k| (k.key.clone(), k))
            .collect::<HashMap<_, _>>();
        Ok(Arc::new(Self {
            db,
            keys: RwLock::new(keys),
        }))
    }

    /// Whether `user` may read `file`, possibly through a share.
    ///
    /// Owner and the system user always pass. A share passes when it is a
    /// file share granting this user and the file sits at or under the
    /// shared file.
    pub fn can_user_access_file(
        &self,
        user: &User,
        file: &Arc<FileNode>,
        file_owner: &str,
        share: Option<&Share>,
        shared_root: Option<&Arc<FileNode>>,
    ) -> bool {
        if user.is_system_user() || user.username == file_owner {
            return true;
        }

        let Some(share) = share else { return false };
        if share.kind != ShareKind::File || !share.grants_access_to(&user.username) {
            return false;
        }

        match shared_root {
            Some(root) => {
                root.id().as_str() == share.content_id
                    && (root.id() == file.id() || root.is_parent_of(file))
            }
            None => false,
        }
    }

    pub fn can_user_modify_share(&self, user: &User, share: &Share) -> bool {
        user.username == share.owner || user.is_system_user()
    }

    // ==================== Api keys ====================

    /// Mint a key. Only admins hand keys out.
    pub fn generate_api_key(&self, creator: &User) -> ServiceResult<ApiKeyInfo> {
        if !creator.admin && !creator.is_system_user() {
            return Err(ServiceError::UserNotAuthorized(creator.username.clone()));
        }

        let mut raw = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
        let key: String = raw.iter().map(|b| format!("{:02x}", b)).collect();

        let info = ApiKeyInfo {
            key: key.clone(),
            owner: creator.username.clone(),
            created_time: now_millis(),
            remote_using: InstanceId::default(),
        };
        self.db.upsert(KEYS_TABLE, &key, &info)?;
        self.keys.write().unwrap().insert(key, info.clone());
        Ok(info)
    }

    pub fn get(&self, key: &str) -> ServiceResult<ApiKeyInfo> {
        self.keys
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(ServiceError::NoApiKey)
    }

    pub fn del(&self, key: &str) -> ServiceResult<()> {
        if !self.db.delete(KEYS_TABLE, key)? {
            return Err(ServiceError::NoApiKey);
        }
        self.keys.write().unwrap().remove(key);
        Ok(())
    }

    pub fn get_all_keys(&self, accessor: &User) -> ServiceResult<Vec<ApiKeyInfo>> {
        if !accessor.admin && !accessor.is_system_user() {
            return Err(ServiceError::UserNotAuthorized(accessor.username.clone()));
        }
        Ok(self.keys.read().unwrap().values().cloned().collect())
    }

    /// Bind a key to the remote server using it. Single-assignment: the
    /// first bind wins, a rebind to the same server is a no-op, anything
    /// else fails.
    pub fn set_key_used_by(&self, key: &str, server_id: &InstanceId) -> ServiceResult<()> {
        let mut keys = self.keys.write().unwrap();
        let info = keys.get_mut(key).ok_or(ServiceError::NoApiKey)?;

        if !info.remote_using.is_empty() {
            if &info.remote_using == server_id {
                return Ok(());
            }
            return Err(ServiceError::KeyInUse(format!(
                "key already bound to {}",
                info.remote_using
            )));
        }

        info.remote_using = server_id.clone();
        self.db.upsert(KEYS_TABLE, key, info)?;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.keys.read().unwrap().len()
    }
}
