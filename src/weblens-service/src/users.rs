use crate::{RecordDb, ServiceError, ServiceResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use file_tree::FileId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const USERS_TABLE: &str = "users";

/// The reserved system user: it passes every access check and owns the
/// service trees.
pub const WEBLENS_USER: &str = "WEBLENS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub password_hash: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub owner: bool,
    #[serde(default)]
    pub activated: bool,
    #[serde(skip_serializing_if = "FileId::is_empty", default)]
    pub home_id: FileId,
    #[serde(skip_serializing_if = "FileId::is_empty", default)]
    pub trash_id: FileId,
}

impl User {
    pub fn new(username: &str, password: &str, admin: bool, owner: bool) -> Self {
        Self {
            username: username.to_string(),
            password_hash: hash_password(password),
            admin,
            owner,
            activated: true,
            home_id: FileId::default(),
            trash_id: FileId::default(),
        }
    }

    /// A record mirrored from a core server. Carries the core's password
    /// hash so logins keep working after a restore.
    pub fn remote(username: &str, password_hash: &str, admin: bool) -> Self {
        Self {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            admin,
            owner: false,
            activated: true,
            home_id: FileId::default(),
            trash_id: FileId::default(),
        }
    }

    pub fn is_system_user(&self) -> bool {
        self.username == WEBLENS_USER
    }

    pub fn check_login(&self, password: &str) -> bool {
        self.activated && verify_password(password, &self.password_hash)
    }
}

fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut salt);
    let salt = URL_SAFE_NO_PAD.encode(salt);
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{}${}", salt, URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize()) == digest
}

/// User records, cached in memory and persisted as JSON rows.
pub struct UserService {
    db: Arc<RecordDb>,
    users: RwLock<HashMap<String, User>>,
}

impl UserService {
    pub fn new(db: Arc<RecordDb>) -> ServiceResult<Arc<Self>> {
        db.ensure_table(USERS_TABLE)?;
        let loaded: Vec<User> = db.all(USERS_TABLE)?;
        let users = loaded
            .into_iter()
            .map(|u| (u.username.clone(), u))
            .collect::<HashMap<_, _>>();
        debug!("UserService: loaded {} users", users.len());
        Ok(Arc::new(Self {
            db,
            users: RwLock::new(users),
        }))
    }

    pub fn add(&self, user: User) -> ServiceResult<()> {
        {
            let users = self.users.read().unwrap();
            if users.contains_key(&user.username) {
                return Err(ServiceError::UserAlreadyExists(user.username));
            }
        }
        self.db.upsert(USERS_TABLE, &user.username, &user)?;
        self.users.write().unwrap().insert(user.username.clone(), user);
        Ok(())
    }

    /// Add a user mirrored from a core server; already-known users are a
    /// no-op so backup rounds stay idempotent.
    pub fn ensure(&self, user: User) -> ServiceResult<()> {
        if self.users.read().unwrap().contains_key(&user.username) {
            return Ok(());
        }
        self.add(user)
    }

    pub fn update(&self, user: User) -> ServiceResult<()> {
        self.db.upsert(USERS_TABLE, &user.username, &user)?;
        self.users.write().unwrap().insert(user.username.clone(), user);
        Ok(())
    }

    pub fn get(&self, username: &str) -> ServiceResult<User> {
        self.users
            .read()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or_else(|| ServiceError::NoUser(username.to_string()))
    }

    pub fn all(&self) -> Vec<User> {
        self.users.read().unwrap().values().cloned().collect()
    }

    pub fn del(&self, username: &str) -> ServiceResult<()> {
        if !self.db.delete(USERS_TABLE, username)? {
            return Err(ServiceError::NoUser(username.to_string()));
        }
        self.users.write().unwrap().remove(username);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.users.read().unwrap().len()
    }

    /// Check a password and return the user on success.
    pub fn login(&self, username: &str, password: &str) -> ServiceResult<User> {
        let user = self.get(username)?;
        if !user.check_login(password) {
            return Err(ServiceError::BadPassword);
        }
        Ok(user)
    }
}
