use async_trait::async_trait;
use file_tree::{FileId, FileSnapshot, Lifetime};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use weblens_service::backup::{CoreClient, CoreClientFactory};
use weblens_service::{Instance, ServiceError, ServiceResult, Services, User};

/// HTTP client against a core server's interserver api, authenticated with
/// the api key the core handed this backup.
pub struct HttpCoreClient {
    base: String,
    key: String,
    http: reqwest::Client,
}

impl HttpCoreClient {
    pub fn new(address: &str, key: &str) -> Self {
        Self {
            base: address.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ServiceResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("GET {}: {}", path, e)))?;
        if !response.status().is_success() {
            return Err(ServiceError::RemoteError(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("decode {}: {}", path, e)))
    }
}

#[async_trait]
impl CoreClient for HttpCoreClient {
    async fn get_users(&self) -> ServiceResult<Vec<User>> {
        self.get_json("/api/users").await
    }

    async fn get_lifetimes_since(&self, since: i64) -> ServiceResult<Vec<Lifetime>> {
        self.get_json(&format!("/api/journal/since?millis={}", since))
            .await
    }

    async fn get_files(&self, ids: &[FileId]) -> ServiceResult<Vec<FileSnapshot>> {
        let response = self
            .http
            .post(self.url("/api/files/bulk"))
            .bearer_auth(&self.key)
            .json(&json!({ "fileIds": ids }))
            .send()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("bulk files: {}", e)))?;
        response
            .json()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("decode bulk files: {}", e)))
    }

    async fn read_file(&self, id: &FileId) -> ServiceResult<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/api/files/{}/download", id)))
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| ServiceError::RemoteError(format!("download {}: {}", id, e)))?;
        if !response.status().is_success() {
            return Err(ServiceError::RemoteError(format!(
                "download {} returned {}",
                id,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::RemoteError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

pub struct HttpCoreFactory;

impl CoreClientFactory for HttpCoreFactory {
    fn client_for(&self, remote: &Instance) -> ServiceResult<Arc<dyn CoreClient>> {
        if remote.address.is_empty() {
            return Err(ServiceError::NoCoreAddress(remote.name.clone()));
        }
        Ok(Arc::new(HttpCoreClient::new(&remote.address, &remote.uses_key)))
    }
}

/// Long-lived relay socket from a backup to its core: every frame the core
/// broadcasts arrives here and is re-delivered to this server's local
/// subscribers. Reconnects with a flat backoff.
pub async fn run_core_relay(services: Services, remote: Instance) {
    let ws_base = remote
        .address
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    let local_id = match services.instances.local_id() {
        Ok(id) => id,
        Err(err) => {
            error!("relay cannot start before init: {}", err);
            return;
        }
    };
    let url = format!(
        "{}/api/ws?serverId={}&key={}",
        ws_base.trim_end_matches('/'),
        local_id,
        remote.uses_key
    );

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                info!("relay connected to core [{}]", remote.name);
                let (_write, mut read) = stream.split();
                while let Some(frame) = read.next().await {
                    let text = match frame {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => text,
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    match serde_json::from_str::<ws_fabric::WsResponseInfo>(&text) {
                        Ok(msg) => services.clients.send(msg).await,
                        Err(err) => debug!("undecodable relay frame: {}", err),
                    }
                }
                warn!("relay to core [{}] dropped", remote.name);
            }
            Err(err) => {
                debug!("relay connect to [{}] failed: {}", remote.name, err);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
