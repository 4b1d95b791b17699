use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use async_trait::async_trait;
use file_tree::InstanceId;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use task_pool::TaskId;
use ws_fabric::{
    ClientIdentity, WsClient, WsConn, WsError, WsRequestInfo, WsResponseInfo, WsResult, WsSubType,
    CANCEL_TASK_ACTION, FOLDER_SUBSCRIBE_ACTION, REPORT_ERROR_ACTION, SCAN_DIRECTORY_ACTION,
    TASK_ID_PREFIX, TASK_SUBSCRIBE_ACTION, TASK_TYPE_PREFIX, UNSUBSCRIBE_ACTION,
    USER_SUBSCRIBE_ACTION,
};

struct AxumConn {
    tx: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl WsConn for AxumConn {
    async fn send_text(&self, frame: String) -> WsResult<()> {
        self.tx
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|e| WsError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.tx.lock().await.send(Message::Close(None)).await;
    }
}

/// `GET /api/ws`: browsers authenticate with their session cookie; a remote
/// instance presents `serverId` plus its api key and connects as a relay
/// target.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = identify(&state, &headers, &params);
    ws.on_upgrade(move |socket| async move {
        match identity {
            Some(identity) => handle_socket(state, socket, identity).await,
            None => {
                // Unauthenticated sockets get nothing.
                let mut socket = socket;
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    })
}

fn identify(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Option<ClientIdentity> {
    if let Some(server_id) = params.get("serverId") {
        let key = params.get("key").cloned().or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_start_matches("Bearer ").trim().to_string())
        })?;
        state.services.access.get(&key).ok()?;
        return Some(ClientIdentity::RemoteClient {
            instance_id: InstanceId::new(server_id.clone()),
        });
    }

    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|c| c.trim().strip_prefix("weblens-session=").map(str::to_string))
        })?;
    let username = state.sessions.read().unwrap().get(&cookie).cloned()?;
    Some(ClientIdentity::WebClient { username })
}

async fn handle_socket(state: AppState, socket: WebSocket, identity: ClientIdentity) {
    let (tx, mut rx) = socket.split();
    let conn = Arc::new(AxumConn {
        tx: tokio::sync::Mutex::new(tx),
    });
    let client = state.services.clients.client_connect(conn, identity);

    while let Some(frame) = rx.next().await {
        let message = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let request: WsRequestInfo = match serde_json::from_str(&message) {
            Ok(req) => req,
            Err(err) => {
                debug!("bad ws request from {}: {}", client.id(), err);
                client.send_error("malformed request").await;
                continue;
            }
        };

        if let Err(err) = handle_request(&state, &client, &request).await {
            warn!("ws action [{}] from {} failed: {}", request.action, client.id(), err);
            client.send_error("request failed").await;
        }
    }

    state.services.clients.client_disconnect(&client).await;
}

fn content_field(request: &WsRequestInfo, field: &str) -> Option<String> {
    let content: serde_json::Value = serde_json::from_str(&request.content).ok()?;
    content
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn handle_request(
    state: &AppState,
    client: &Arc<WsClient>,
    request: &WsRequestInfo,
) -> Result<(), WsError> {
    let services = &state.services;
    match request.action.as_str() {
        FOLDER_SUBSCRIBE_ACTION => {
            let key = content_field(request, "subscribeKey")
                .ok_or_else(|| WsError::BadRequest("missing subscribeKey".to_string()))?;
            services
                .clients
                .subscribe(client, WsSubType::Folder, &key, request.sent_at)
        }
        TASK_SUBSCRIBE_ACTION => {
            let key = content_field(request, "subscribeKey")
                .ok_or_else(|| WsError::BadRequest("missing subscribeKey".to_string()))?;

            if let Some(task_type) = key.strip_prefix(TASK_TYPE_PREFIX) {
                return services
                    .clients
                    .subscribe(client, WsSubType::TaskType, task_type, request.sent_at);
            }

            let task_id = key.strip_prefix(TASK_ID_PREFIX).unwrap_or(&key);
            services
                .clients
                .subscribe(client, WsSubType::Task, task_id, request.sent_at)?;

            // A finished task answers its new subscriber on the spot.
            if let Some(task) = services.tasks.get_task(&TaskId::new(task_id)) {
                if task.is_complete() {
                    let mut content = ws_fabric::WsC::new();
                    for (k, v) in task.results() {
                        content.insert(k, v);
                    }
                    content.insert("complete".to_string(), json!(true));
                    let reply = WsResponseInfo {
                        event_tag: task_pool::TASK_COMPLETE_EVENT.to_string(),
                        subscribe_key: task_id.to_string(),
                        task_type: Some(task.job_name().to_string()),
                        content,
                        broadcast_type: Some(WsSubType::Task),
                        sent_time: ws_fabric::now_unix(),
                        ..Default::default()
                    };
                    return client.send(&reply).await;
                }
            }
            Ok(())
        }
        UNSUBSCRIBE_ACTION => {
            let key = content_field(request, "subscribeKey")
                .ok_or_else(|| WsError::BadRequest("missing subscribeKey".to_string()))?;
            let key = key
                .strip_prefix(TASK_ID_PREFIX)
                .or_else(|| key.strip_prefix(TASK_TYPE_PREFIX))
                .unwrap_or(&key);
            services.clients.unsubscribe(client, key)
        }
        SCAN_DIRECTORY_ACTION => {
            let folder_id = content_field(request, "folderId")
                .ok_or_else(|| WsError::BadRequest("missing folderId".to_string()))?;
            let task = services
                .tasks
                .dispatch_job(
                    weblens_service::jobs::JobMeta::ScanDirectory {
                        folder_id: file_tree::FileId::new(folder_id.clone()),
                    },
                    Some(services.caster.clone()),
                    None,
                )
                .map_err(|e| WsError::BadRequest(e.to_string()))?;

            // Anyone watching the folder follows the scan automatically.
            services
                .clients
                .folder_sub_to_task(&folder_id, task.id().as_str(), request.sent_at);
            Ok(())
        }
        CANCEL_TASK_ACTION => {
            let task_id = content_field(request, "taskId")
                .ok_or_else(|| WsError::BadRequest("missing taskId".to_string()))?;
            let task = services
                .tasks
                .get_task(&TaskId::new(task_id.clone()))
                .ok_or(WsError::NoSubscription(task_id))?;
            task.cancel();
            Ok(())
        }
        REPORT_ERROR_ACTION => {
            warn!("client {} reported web error: {}", client.id(), request.content);
            Ok(())
        }
        USER_SUBSCRIBE_ACTION => {
            // User routing is implicit in the client identity.
            Ok(())
        }
        other => Err(WsError::BadRequest(format!("unknown action {}", other))),
    }
}
