use crate::{ClientId, Subscription, WsError, WsResponseInfo, WsResult, WsSubType};
use async_trait::async_trait;
use file_tree::InstanceId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// The transport seam. The daemon backs this with a real WebSocket; tests
/// capture frames in memory.
#[async_trait]
pub trait WsConn: Send + Sync {
    async fn send_text(&self, frame: String) -> WsResult<()>;

    async fn close(&self);
}

/// Who is on the other end of a connection: a browser session for a user,
/// or another Weblens instance (a backup server dialed into its core).
#[derive(Debug, Clone)]
pub enum ClientIdentity {
    WebClient { username: String },
    RemoteClient { instance_id: InstanceId },
}

/// One WebSocket connection. Reads happen on one task per client elsewhere;
/// writes are serialized through the outbound lock so interleaved JSON never
/// hits the wire.
pub struct WsClient {
    client_id: ClientId,
    identity: ClientIdentity,
    conn: Arc<dyn WsConn>,
    active: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl WsClient {
    pub fn new(conn: Arc<dyn WsConn>, identity: ClientIdentity) -> Arc<Self> {
        let seq = CLIENT_SEQ.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            client_id: ClientId(format!("client-{}", seq)),
            identity,
            conn,
            active: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn username(&self) -> Option<&str> {
        match &self.identity {
            ClientIdentity::WebClient { username } => Some(username),
            ClientIdentity::RemoteClient { .. } => None,
        }
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match &self.identity {
            ClientIdentity::RemoteClient { instance_id } => Some(instance_id),
            ClientIdentity::WebClient { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.identity, ClientIdentity::RemoteClient { .. })
    }

    pub fn is_open(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Serialize and write one frame. A dead connection surfaces as
    /// `ClientGone` and flips the active flag; the manager sweeps the
    /// client out on the next touch.
    pub async fn send(&self, msg: &WsResponseInfo) -> WsResult<()> {
        if !self.is_open() {
            return Err(WsError::ClientGone(self.client_id.to_string()));
        }

        let frame = serde_json::to_string(msg)
            .map_err(|e| WsError::SendFailed(format!("encode frame: {}", e)))?;

        let _guard = self.write_lock.lock().await;
        match self.conn.send_text(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.active.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Push a sanitized error frame; internal detail stays in the log.
    pub async fn send_error(&self, public_message: &str) {
        let msg = WsResponseInfo {
            event_tag: crate::ERROR_EVENT.to_string(),
            subscribe_key: crate::SYSTEM_SUB_KEY.to_string(),
            error: public_message.to_string(),
            sent_time: crate::now_unix(),
            ..Default::default()
        };
        if let Err(err) = self.send(&msg).await {
            debug!("failed sending error frame to {}: {}", self.client_id, err);
        }
    }

    pub fn add_subscription(&self, sub: Subscription) {
        let mut subs = self.subscriptions.lock().unwrap();
        if !subs.iter().any(|s| s.sub_type == sub.sub_type && s.key == sub.key) {
            subs.push(sub);
        }
    }

    pub fn remove_subscription(&self, key: &str) -> Option<Subscription> {
        let mut subs = self.subscriptions.lock().unwrap();
        let idx = subs.iter().position(|s| s.key == key)?;
        Some(subs.remove(idx))
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn subscribed_to(&self, sub_type: WsSubType, key: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.sub_type == sub_type && s.key == key)
    }

    pub async fn disconnect(&self) {
        self.active.store(false, Ordering::Release);
        self.conn.close().await;
    }
}
