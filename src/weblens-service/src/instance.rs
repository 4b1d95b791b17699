use crate::{RecordDb, ServiceError, ServiceResult};
use file_tree::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const SERVERS_TABLE: &str = "servers";

/// Whether an instance accepts writes or mirrors another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Not yet initialized; refuses everything but setup.
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "core")]
    Core,
    #[serde(rename = "backup")]
    Backup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub role: ServerRole,
    /// Reachable address for remotes; empty for the local record.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub address: String,
    /// The api key this server presents to its core.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub uses_key: String,
    #[serde(default)]
    pub is_local: bool,
}

impl Instance {
    pub fn new_local(name: &str, role: ServerRole) -> Self {
        Self {
            id: InstanceId::new(new_instance_nonce()),
            name: name.to_string(),
            role,
            address: String::new(),
            uses_key: String::new(),
            is_local: true,
        }
    }

    pub fn new_remote(id: InstanceId, name: &str, role: ServerRole, address: &str, key: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            role,
            address: address.to_string(),
            uses_key: key.to_string(),
            is_local: false,
        }
    }
}

fn new_instance_nonce() -> String {
    let mut raw = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The local server record plus every known remote.
pub struct InstanceService {
    db: Arc<RecordDb>,
    local: RwLock<Option<Instance>>,
    remotes: RwLock<HashMap<InstanceId, Instance>>,
}

impl InstanceService {
    pub fn new(db: Arc<RecordDb>) -> ServiceResult<Arc<Self>> {
        db.ensure_table(SERVERS_TABLE)?;
        let loaded: Vec<Instance> = db.all(SERVERS_TABLE)?;

        let mut local = None;
        let mut remotes = HashMap::new();
        for instance in loaded {
            if instance.is_local {
                local = Some(instance);
            } else {
                remotes.insert(instance.id.clone(), instance);
            }
        }

        Ok(Arc::new(Self {
            db,
            local: RwLock::new(local),
            remotes: RwLock::new(remotes),
        }))
    }

    /// The local record; a server that was never initialized has none.
    pub fn get_local(&self) -> ServiceResult<Instance> {
        self.local
            .read()
            .unwrap()
            .clone()
            .ok_or(ServiceError::ServerNotInitialized)
    }

    pub fn local_role(&self) -> ServerRole {
        self.local
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.role)
            .unwrap_or(ServerRole::Init)
    }

    pub fn local_id(&self) -> ServiceResult<InstanceId> {
        Ok(self.get_local()?.id)
    }

    /// First-time setup. Refused once a local record exists.
    pub fn init_local(&self, name: &str, role: ServerRole) -> ServiceResult<Instance> {
        if name.is_empty() {
            return Err(ServiceError::NoServerName("init".to_string()));
        }
        let mut local = self.local.write().unwrap();
        if local.is_some() {
            return Err(ServiceError::DuplicateLocalServer);
        }
        let instance = Instance::new_local(name, role);
        self.db.upsert(SERVERS_TABLE, instance.id.as_str(), &instance)?;
        *local = Some(instance.clone());
        info!("initialized local server [{}] as {:?}", instance.name, role);
        Ok(instance)
    }

    pub fn add_remote(&self, instance: Instance) -> ServiceResult<()> {
        if instance.id.is_empty() {
            return Err(ServiceError::NoServerId(instance.name));
        }
        if instance.role == ServerRole::Core && instance.address.is_empty() {
            return Err(ServiceError::NoCoreAddress(instance.name));
        }
        self.db.upsert(SERVERS_TABLE, instance.id.as_str(), &instance)?;
        self.remotes.write().unwrap().insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn get_remote(&self, id: &InstanceId) -> ServiceResult<Instance> {
        self.remotes
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NoServerId(id.to_string()))
    }

    pub fn remotes(&self) -> Vec<Instance> {
        self.remotes.read().unwrap().values().cloned().collect()
    }

    pub fn del_remote(&self, id: &InstanceId) -> ServiceResult<()> {
        if !self.db.delete(SERVERS_TABLE, id.as_str())? {
            return Err(ServiceError::NoServerId(id.to_string()));
        }
        self.remotes.write().unwrap().remove(id);
        Ok(())
    }
}
