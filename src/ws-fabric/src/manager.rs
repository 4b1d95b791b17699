use crate::{
    ClientId, ClientIdentity, Subscription, WsClient, WsConn, WsError, WsResponseInfo, WsResult,
    WsSubType,
};
use file_tree::InstanceId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The subscription registry and routing core. Casters hand finished frames
/// to [`ClientManager::send`], which resolves the subscriber set for the
/// frame's broadcast type and writes to each client.
///
/// Every frame a core server sends is also relayed to connected remote
/// (backup) clients, stamped with the local instance id so a relay is never
/// re-relayed.
pub struct ClientManager {
    local_instance: RwLock<Option<InstanceId>>,

    clients: RwLock<HashMap<ClientId, Arc<WsClient>>>,

    folder_subs: RwLock<HashMap<String, Vec<ClientId>>>,
    task_subs: RwLock<HashMap<String, Vec<ClientId>>>,
    task_type_subs: RwLock<HashMap<String, Vec<ClientId>>>,
}

impl ClientManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local_instance: RwLock::new(None),
            clients: RwLock::new(HashMap::new()),
            folder_subs: RwLock::new(HashMap::new()),
            task_subs: RwLock::new(HashMap::new()),
            task_type_subs: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_local_instance(&self, id: InstanceId) {
        *self.local_instance.write().unwrap() = Some(id);
    }

    // ==================== Clients ====================

    pub fn client_connect(&self, conn: Arc<dyn WsConn>, identity: ClientIdentity) -> Arc<WsClient> {
        let client = WsClient::new(conn, identity);
        debug!("client {} connected", client.id());
        self.clients
            .write()
            .unwrap()
            .insert(client.id().clone(), client.clone());
        client
    }

    /// Drop a client and every subscription it held.
    pub async fn client_disconnect(&self, client: &Arc<WsClient>) {
        client.disconnect().await;
        self.clients.write().unwrap().remove(client.id());

        for subs in [&self.folder_subs, &self.task_subs, &self.task_type_subs] {
            let mut subs = subs.write().unwrap();
            for entries in subs.values_mut() {
                entries.retain(|id| id != client.id());
            }
            subs.retain(|_, entries| !entries.is_empty());
        }
        debug!("client {} disconnected", client.id());
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn get_client(&self, id: &ClientId) -> Option<Arc<WsClient>> {
        self.clients.read().unwrap().get(id).cloned()
    }

    pub fn get_client_by_username(&self, username: &str) -> Option<Arc<WsClient>> {
        self.clients
            .read()
            .unwrap()
            .values()
            .find(|c| c.username() == Some(username))
            .cloned()
    }

    pub fn get_client_by_server_id(&self, instance_id: &InstanceId) -> Option<Arc<WsClient>> {
        self.clients
            .read()
            .unwrap()
            .values()
            .find(|c| c.instance_id() == Some(instance_id))
            .cloned()
    }

    pub fn remote_clients(&self) -> Vec<Arc<WsClient>> {
        self.clients
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_remote())
            .cloned()
            .collect()
    }

    // ==================== Subscriptions ====================

    /// Record a subscription. User subscriptions are tracked implicitly by
    /// the client's identity, so only the keyed types land in the registry.
    pub fn subscribe(
        &self,
        client: &Arc<WsClient>,
        sub_type: WsSubType,
        key: &str,
        when: i64,
    ) -> WsResult<()> {
        if key.is_empty() {
            return Err(WsError::BadRequest("empty subscribe key".to_string()));
        }

        let registry = match sub_type {
            WsSubType::Folder => &self.folder_subs,
            WsSubType::Task => &self.task_subs,
            WsSubType::TaskType => &self.task_type_subs,
            WsSubType::User | WsSubType::System => {
                return Err(WsError::BadRequest(format!(
                    "cannot subscribe explicitly to {:?}",
                    sub_type
                )))
            }
        };

        client.add_subscription(Subscription {
            sub_type,
            key: key.to_string(),
            when,
        });

        let mut registry = registry.write().unwrap();
        let entries = registry.entry(key.to_string()).or_default();
        if !entries.contains(client.id()) {
            entries.push(client.id().clone());
        }
        trace!("client {} subscribed to {:?} [{}]", client.id(), sub_type, key);
        Ok(())
    }

    pub fn unsubscribe(&self, client: &Arc<WsClient>, key: &str) -> WsResult<()> {
        let sub = client
            .remove_subscription(key)
            .ok_or_else(|| WsError::NoSubscription(key.to_string()))?;

        let registry = match sub.sub_type {
            WsSubType::Folder => &self.folder_subs,
            WsSubType::Task => &self.task_subs,
            WsSubType::TaskType => &self.task_type_subs,
            _ => return Ok(()),
        };
        let mut registry = registry.write().unwrap();
        if let Some(entries) = registry.get_mut(key) {
            entries.retain(|id| id != client.id());
            if entries.is_empty() {
                registry.remove(key);
            }
        }
        Ok(())
    }

    /// Everyone watching a folder also wants the task that is about to
    /// mutate it.
    pub fn folder_sub_to_task(&self, folder_key: &str, task_key: &str, when: i64) {
        let watchers = self.get_subscribers(WsSubType::Folder, folder_key);
        for client in watchers {
            if let Err(err) = self.subscribe(&client, WsSubType::Task, task_key, when) {
                debug!("folder-to-task subscribe failed: {}", err);
            }
        }
    }

    pub fn get_subscribers(&self, sub_type: WsSubType, key: &str) -> Vec<Arc<WsClient>> {
        match sub_type {
            WsSubType::Folder | WsSubType::Task | WsSubType::TaskType => {
                let registry = match sub_type {
                    WsSubType::Folder => &self.folder_subs,
                    WsSubType::Task => &self.task_subs,
                    _ => &self.task_type_subs,
                };
                let ids = registry.read().unwrap().get(key).cloned().unwrap_or_default();
                let clients = self.clients.read().unwrap();
                ids.iter().filter_map(|id| clients.get(id).cloned()).collect()
            }
            WsSubType::User => self
                .clients
                .read()
                .unwrap()
                .values()
                .filter(|c| c.username() == Some(key))
                .cloned()
                .collect(),
            WsSubType::System => self
                .clients
                .read()
                .unwrap()
                .values()
                .filter(|c| !c.is_remote())
                .cloned()
                .collect(),
        }
    }

    // ==================== Routing ====================

    /// Fan one frame out to its subscribers, then relay it to remote
    /// instances. Send failures degrade the client, never the caller.
    pub async fn send(&self, mut msg: WsResponseInfo) {
        if msg.sent_time == 0 {
            msg.sent_time = crate::now_unix();
        }

        let targets = match msg.broadcast_type {
            Some(sub_type) => self.get_subscribers(sub_type, &msg.subscribe_key),
            None => Vec::new(),
        };

        for client in &targets {
            if let Err(err) = client.send(&msg).await {
                warn!("dropping frame for client {}: {}", client.id(), err);
            }
        }

        // Backups mirror the core's event stream. A frame that already
        // carries a relay source came from another instance; forwarding it
        // again would loop.
        if msg.relay_source.is_none() {
            let local = self.local_instance.read().unwrap().clone();
            if let Some(local) = local {
                let mut relayed = msg.clone();
                relayed.relay_source = Some(local.to_string());
                for remote in self.remote_clients() {
                    if let Err(err) = remote.send(&relayed).await {
                        warn!("relay to {} failed: {}", remote.id(), err);
                    }
                }
            }
        }
    }
}
