use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use file_tree::{FileId, InstanceId, Lifetime};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use weblens_service::jobs::{self, JobMeta};
use weblens_service::{
    make_unique_child_name, ServerRole, ServiceError, Services, Share, User,
};

/// Router state: the service bundle plus the in-memory session table.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub sessions: Arc<RwLock<HashMap<String, String>>>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Client-visible error: sanitized message, mapped status. Detail stays in
/// the server log.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::UserNotAuthenticated | ServiceError::BadPassword => {
                StatusCode::UNAUTHORIZED
            }
            ServiceError::UserNotAuthorized(_) | ServiceError::NoFileAccess(_) => {
                StatusCode::FORBIDDEN
            }
            ServiceError::NoUser(_)
            | ServiceError::NoShare(_)
            | ServiceError::NoApiKey
            | ServiceError::NoUpload(_)
            | ServiceError::NoCache(_) => StatusCode::NOT_FOUND,
            ServiceError::Fs(fs) if fs.is_not_found() => StatusCode::NOT_FOUND,
            ServiceError::Fs(file_tree::FsError::FileAlreadyExists(_))
            | ServiceError::Fs(file_tree::FsError::DirAlreadyExists(_))
            | ServiceError::UserAlreadyExists(_)
            | ServiceError::DuplicateLocalServer
            | ServiceError::KeyInUse(_) => StatusCode::CONFLICT,
            ServiceError::BadRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ServiceError::ServerNotInitialized | ServiceError::ServerIsBackup => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", err);
            ApiError(status, "internal error".to_string())
        } else {
            ApiError(status, err.to_string())
        }
    }
}

impl From<file_tree::FsError> for ApiError {
    fn from(err: file_tree::FsError) -> Self {
        ServiceError::Fs(err).into()
    }
}

impl From<task_pool::TaskError> for ApiError {
    fn from(err: task_pool::TaskError) -> Self {
        ServiceError::Task(err).into()
    }
}

fn unauthorized() -> ApiError {
    ServiceError::UserNotAuthenticated.into()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // users
        .route("/api/users/login", post(login))
        .route("/api/users", get(list_users).post(create_user))
        // files and folders
        .route("/api/files/bulk", post(bulk_file_info))
        .route("/api/files/:id", get(file_info).patch(move_file).delete(delete_file))
        .route("/api/files/:id/download", get(download_file))
        .route("/api/files/:id/history", get(file_history))
        .route("/api/files/:id/restore", post(restore_files))
        .route("/api/files/:id/trash", patch(trash_file))
        .route("/api/folder", post(create_folder))
        .route("/api/folder/:id", get(folder_info))
        .route("/api/folder/:id/past", get(past_folder))
        .route("/api/folder/:id/scan", post(scan_folder))
        .route("/api/folder/:id/cover", get(get_folder_cover).patch(set_folder_cover))
        // uploads
        .route("/api/upload", post(open_upload))
        .route("/api/upload/:upload_id/file", post(announce_file))
        .route("/api/upload/:upload_id/file/:file_id", put(upload_chunk))
        // media
        .route("/api/media/:content_id/:quality", get(media_artifact))
        // journal (interserver)
        .route("/api/journal/since", get(journal_since))
        .route("/api/journal/latest", get(journal_latest))
        // takeout
        .route("/api/takeout", post(request_takeout))
        .route("/api/takeout/:takeout_id", get(download_takeout))
        // shares
        .route("/api/share", post(create_share))
        .route("/api/share/:share_id", patch(update_share).delete(delete_share))
        // keys
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/:key", delete(delete_key))
        // servers
        .route("/api/servers", get(server_info))
        .route("/api/servers/init", post(init_server))
        .route("/api/servers/backup", post(attach_backup))
        .route("/api/servers/restore", post(restore_history))
        .with_state(state)
}

// ==================== Auth ====================

/// Resolve the caller: an `Authorization` api key, or the session cookie.
/// Interserver routes pass `key_only = true` and refuse cookie sessions.
fn authenticate(state: &AppState, headers: &HeaderMap, key_only: bool) -> Result<User, ApiError> {
    if let Some(raw) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let key = raw.trim_start_matches("Bearer ").trim();
        let info = state.services.access.get(key)?;
        return Ok(state.services.users.get(&info.owner)?);
    }
    if key_only {
        return Err(unauthorized());
    }

    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("weblens-session=").map(|v| v.to_string())
            })
        })
        .ok_or_else(unauthorized)?;

    let username = state
        .sessions
        .read()
        .unwrap()
        .get(&cookie)
        .cloned()
        .ok_or_else(unauthorized)?;
    Ok(state.services.users.get(&username)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Response, ApiError> {
    let user = state.services.users.login(&body.username, &body.password)?;

    let mut raw = [0u8; 16];
    rand_fill(&mut raw);
    let token: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    state
        .sessions
        .write()
        .unwrap()
        .insert(token.clone(), user.username.clone());

    let mut response = Json(json!({ "username": user.username, "admin": user.admin })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        format!("weblens-session={}; HttpOnly; Path=/", token)
            .parse()
            .unwrap(),
    );
    Ok(response)
}

fn rand_fill(buf: &mut [u8]) {
    rand::Rng::fill(&mut rand::thread_rng(), buf);
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    if !caller.admin && !caller.is_system_user() {
        return Err(ServiceError::UserNotAuthorized(caller.username).into());
    }
    Ok(Json(json!(state.services.users.all())))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewUserBody {
    username: String,
    password: String,
    #[serde(default)]
    admin: bool,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewUserBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // The very first user becomes the owner without auth; after that only
    // admins may add users.
    if state.services.users.size() > 0 {
        let caller = authenticate(&state, &headers, false)?;
        if !caller.admin {
            return Err(ServiceError::UserNotAuthorized(caller.username).into());
        }
    }

    let owner = state.services.users.size() == 0;
    let mut user = User::new(&body.username, &body.password, body.admin || owner, owner);
    let (home, trash) = state.services.files.create_user_home(&user.username).await?;
    user.home_id = home.id();
    user.trash_id = trash.id();
    state.services.users.add(user.clone())?;
    Ok(Json(json!({ "username": user.username, "homeId": user.home_id })))
}

// ==================== Files ====================

fn checked_file(
    state: &AppState,
    caller: &User,
    id: &FileId,
) -> Result<Arc<file_tree::FileNode>, ApiError> {
    let file = state.services.files.get_file(id)?;
    let owner = state.services.files.owner_of(&file);

    let share = state
        .services
        .shares
        .get_file_share(id)
        .or_else(|| find_covering_share(state, &file));
    let shared_root = share
        .as_ref()
        .and_then(|s| state.services.files.get_file(&FileId::new(s.content_id.clone())).ok());

    if !state.services.access.can_user_access_file(
        caller,
        &file,
        &owner,
        share.as_ref(),
        shared_root.as_ref(),
    ) {
        return Err(ServiceError::NoFileAccess(id.to_string()).into());
    }
    Ok(file)
}

// A share on any ancestor covers the file.
fn find_covering_share(state: &AppState, file: &Arc<file_tree::FileNode>) -> Option<Share> {
    let mut current = file.parent();
    while let Some(node) = current {
        if let Some(share) = state.services.shares.get_file_share(&node.id()) {
            return Some(share);
        }
        current = node.parent();
    }
    None
}

async fn file_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;
    Ok(Json(json!(file.freeze())))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    file_ids: Vec<FileId>,
}

/// Descriptor fetch used by backup servers.
async fn bulk_file_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers, true)?;
    let (found, _missing) = state.services.files.get_files(&body.file_ids);
    let snapshots: Vec<file_tree::FileSnapshot> = found.iter().map(|f| f.freeze()).collect();
    Ok(Json(json!(snapshots)))
}

async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;
    let data = file.read_all().await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Bytes::from(data),
    )
        .into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody {
    #[serde(default)]
    new_parent_id: Option<FileId>,
    #[serde(default)]
    new_name: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

async fn move_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;

    let new_parent = match &body.new_parent_id {
        Some(pid) => checked_file(&state, &caller, pid)?,
        None => file
            .parent()
            .ok_or_else(|| ServiceError::Internal("file has no parent".to_string()))?,
    };
    let new_name = body.new_name.unwrap_or_else(|| file.filename());

    // Scans and uploads holding the file must wind down before the move.
    jobs::release_file_claims(&state.services, &file).await?;

    // An overwrite implicitly deletes whatever already sits at the
    // destination, so its claimant tasks must wind down too.
    if body.overwrite {
        if let Ok(existing) = new_parent.get_child(&new_name) {
            if existing.id() != file.id() {
                jobs::release_file_claims(&state.services, &existing).await?;
            }
        }
    }

    let pre = file.freeze();
    state
        .services
        .files
        .users_tree()
        .move_file(&file, &new_parent, &new_name, body.overwrite, None)
        .await?;
    state.services.caster.push_file_move(&pre, &file.freeze());
    Ok(Json(json!(file.freeze())))
}

async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;

    jobs::release_file_claims(&state.services, &file).await?;

    let journal = state.services.files.journal();
    let event = journal.new_event();
    let snapshots = state.services.files.delete_files(&[file], &event).await?;
    journal.log_event(&event).await;
    event.wait_logged().await;

    for snap in &snapshots {
        state.services.caster.push_file_delete(snap);
    }
    Ok(Json(json!({ "deleted": snapshots.len() })))
}

async fn trash_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;
    jobs::release_file_claims(&state.services, &file).await?;

    if state.services.files.is_file_in_trash(&file) {
        state.services.files.return_file_from_trash(&file, None).await?;
    } else {
        state.services.files.move_file_to_trash(&file, None).await?;
    }
    Ok(Json(json!(file.freeze())))
}

async fn file_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let file = checked_file(&state, &caller, &FileId::new(id))?;
    let actions = state
        .services
        .files
        .journal()
        .get_actions_by_path(&file.portable_path())?;
    Ok(Json(json!(actions)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    life_ids: Vec<FileId>,
    timestamp: i64,
}

async fn restore_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let new_parent = checked_file(&state, &caller, &FileId::new(id))?;

    let journal = state.services.files.journal();
    let event = journal.new_event();
    let restored = state
        .services
        .files
        .restore_files(&body.life_ids, &new_parent, body.timestamp, &event)
        .await?;
    journal.log_event(&event).await;
    event.wait_logged().await;

    for file in &restored {
        state.services.caster.push_file_create(&file.freeze());
    }
    let ids: Vec<FileId> = restored.iter().map(|f| f.id()).collect();
    Ok(Json(json!({ "restored": ids })))
}

// ==================== Folders ====================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewFolderBody {
    parent_id: FileId,
    name: String,
}

async fn create_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewFolderBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let parent = checked_file(&state, &caller, &body.parent_id)?;
    let dir = state
        .services
        .files
        .users_tree()
        .mkdir(&parent, &body.name, None)
        .await?;
    state.services.caster.push_file_create(&dir.freeze());
    Ok(Json(json!(dir.freeze())))
}

async fn folder_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let folder = checked_file(&state, &caller, &FileId::new(id))?;
    let children: Vec<file_tree::FileSnapshot> =
        folder.children().iter().map(|c| c.freeze()).collect();
    Ok(Json(json!({ "self": folder.freeze(), "children": children })))
}

#[derive(Deserialize)]
struct PastQuery {
    at: i64,
}

async fn past_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PastQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let folder = checked_file(&state, &caller, &FileId::new(id))?;
    let children = state
        .services
        .files
        .journal()
        .get_past_folder_children(&folder, query.at)?;
    let snapshots: Vec<file_tree::FileSnapshot> = children.iter().map(|c| c.freeze()).collect();
    Ok(Json(json!(snapshots)))
}

async fn scan_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let folder = checked_file(&state, &caller, &FileId::new(id))?;
    let task = state.services.tasks.dispatch_job(
        JobMeta::ScanDirectory { folder_id: folder.id() },
        Some(state.services.caster.clone()),
        None,
    )?;
    Ok(Json(json!({ "taskId": task.id() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverBody {
    #[serde(default)]
    cover_id: Option<String>,
}

async fn set_folder_cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CoverBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let folder = checked_file(&state, &caller, &FileId::new(id))?;
    let cover = body.cover_id.map(file_tree::ContentId::new);
    state.services.files.set_folder_cover(&folder, cover.as_ref())?;
    Ok(Json(json!({ "coverId": cover })))
}

async fn get_folder_cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let folder = checked_file(&state, &caller, &FileId::new(id))?;
    let cover = state.services.files.get_folder_cover(&folder)?;
    Ok(Json(json!({ "coverId": cover })))
}

// ==================== Uploads ====================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenUploadBody {
    root_folder_id: FileId,
    chunk_size: i64,
    total_upload_size: i64,
}

async fn open_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OpenUploadBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    checked_file(&state, &caller, &body.root_folder_id)?;

    let mut raw = [0u8; 8];
    rand_fill(&mut raw);
    let upload_id: String = raw.iter().map(|b| format!("{:02x}", b)).collect();

    jobs::open_upload(
        &state.services,
        &upload_id,
        body.root_folder_id,
        body.chunk_size,
        body.total_upload_size,
    )?;
    Ok(Json(json!({ "uploadId": upload_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnounceFileBody {
    parent_folder_id: FileId,
    new_file_name: String,
    file_size: i64,
    #[serde(default)]
    is_dir: bool,
}

async fn announce_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(upload_id): Path<String>,
    Json(body): Json<AnnounceFileBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let parent = checked_file(&state, &caller, &body.parent_folder_id)?;

    if body.is_dir {
        let dir = state
            .services
            .files
            .users_tree()
            .mkdir(&parent, &body.new_file_name, None)
            .await?;
        return Ok(Json(json!({ "fileId": dir.id() })));
    }

    let name = make_unique_child_name(&parent, &body.new_file_name);
    let node = state.services.files.new_upload_file(&parent, &name)?;
    let file_id = node.id();
    jobs::announce_upload_file(&state.services, &upload_id, node, body.file_size).await?;
    Ok(Json(json!({ "fileId": file_id })))
}

async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((upload_id, file_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers, false)?;
    let content_range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::BadRange("missing Content-Range".to_string()))?
        .trim_start_matches("bytes ")
        .to_string();

    state
        .services
        .uploads
        .add_chunk_to_stream(&upload_id, FileId::new(file_id), body.to_vec(), &content_range)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// ==================== Media ====================

async fn media_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((content_id, quality)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers, false)?;

    let quality = match quality.as_str() {
        "thumbnail" => weblens_service::media::MediaQuality::Thumbnail,
        "fullres" | "highres" => weblens_service::media::MediaQuality::Highres,
        other => return Err(ServiceError::NoCache(other.to_string()).into()),
    };
    let page: u32 = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    let data = state
        .services
        .media
        .fetch_cache_data(&file_tree::ContentId::new(content_id), quality, page)
        .await?;
    Ok(([(header::CONTENT_TYPE, "image/webp")], Bytes::from(data)).into_response())
}

// ==================== Journal (interserver) ====================

#[derive(Deserialize)]
struct SinceQuery {
    millis: i64,
}

async fn journal_since(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Vec<Lifetime>>, ApiError> {
    authenticate(&state, &headers, true)?;
    let lifetimes = state.services.files.journal().get_lifetimes_since(query.millis)?;
    Ok(Json(lifetimes))
}

async fn journal_latest(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers, true)?;
    let latest = state.services.files.journal().get_latest_action()?;
    Ok(Json(json!(latest)))
}

// ==================== Takeout ====================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeoutBody {
    file_ids: Vec<FileId>,
    #[serde(default)]
    share_id: String,
}

async fn request_takeout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TakeoutBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    for id in &body.file_ids {
        checked_file(&state, &caller, id)?;
    }

    let task = state.services.tasks.dispatch_job(
        JobMeta::CreateZip {
            file_ids: body.file_ids,
            username: caller.username,
            share_id: body.share_id,
        },
        Some(state.services.caster.clone()),
        None,
    )?;

    // A repeated request for a finished zip answers immediately.
    if task.is_complete() {
        return Ok(Json(json!({
            "taskId": task.id(),
            "takeoutId": task.results().get("takeoutId"),
            "complete": true,
        })));
    }
    Ok(Json(json!({ "taskId": task.id(), "complete": false })))
}

async fn download_takeout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(takeout_id): Path<String>,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers, false)?;
    let zip = state.services.files.get_zip(&takeout_id)?;
    let data = zip.read_all().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", zip.filename()),
            ),
        ],
        Bytes::from(data),
    )
        .into_response())
}

// ==================== Shares ====================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewShareBody {
    file_id: FileId,
    #[serde(default)]
    accessors: Vec<String>,
    #[serde(default)]
    public: bool,
}

async fn create_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewShareBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    checked_file(&state, &caller, &body.file_id)?;

    let share = Share::new_file_share(&body.file_id, &caller.username, body.accessors, body.public);
    state.services.shares.add(share.clone())?;
    for accessor in &share.accessors {
        state
            .services
            .caster
            .push_share_update(accessor, json!(share));
    }
    Ok(Json(json!(share)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateShareBody {
    #[serde(default)]
    add_accessors: Vec<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn update_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
    Json(body): Json<UpdateShareBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let share = state.services.shares.get(&share_id)?;
    if !state.services.access.can_user_modify_share(&caller, &share) {
        return Err(ServiceError::UserNotAuthorized(caller.username).into());
    }

    if let Some(enabled) = body.enabled {
        state.services.shares.set_enabled(&share_id, enabled)?;
    }
    let share = if body.add_accessors.is_empty() {
        state.services.shares.get(&share_id)?
    } else {
        state.services.shares.add_accessors(&share_id, &body.add_accessors)?
    };
    Ok(Json(json!(share)))
}

async fn delete_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    let share = state.services.shares.get(&share_id)?;
    if !state.services.access.can_user_modify_share(&caller, &share) {
        return Err(ServiceError::UserNotAuthorized(caller.username).into());
    }
    state.services.shares.del(&share_id)?;
    Ok(Json(json!({ "ok": true })))
}

// ==================== Keys ====================

async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    Ok(Json(json!(state.services.access.get_all_keys(&caller)?)))
}

async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    Ok(Json(json!(state.services.access.generate_api_key(&caller)?)))
}

async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers, false)?;
    if !caller.admin {
        return Err(ServiceError::UserNotAuthorized(caller.username).into());
    }
    state.services.access.del(&key)?;
    Ok(Json(json!({ "ok": true })))
}

// ==================== Servers ====================

async fn server_info(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let local = state.services.instances.get_local().ok();
    Ok(Json(json!({
        "local": local,
        "remotes": state.services.instances.remotes(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitBody {
    name: String,
    role: String,
}

async fn init_server(
    State(state): State<AppState>,
    Json(body): Json<InitBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = match body.role.as_str() {
        "core" => ServerRole::Core,
        "backup" => ServerRole::Backup,
        other => return Err(ServiceError::Internal(format!("unknown role {}", other)).into()),
    };
    let local = state.services.instances.init_local(&body.name, role)?;
    state
        .services
        .clients
        .set_local_instance(local.id.clone());
    Ok(Json(json!(local)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachBackupBody {
    server_id: InstanceId,
    name: String,
    uses_key: String,
}

/// A backup server announcing itself to this core. The presented key is
/// bound to the backup's id; a key already bound elsewhere is refused.
async fn attach_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AttachBackupBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers, true)?;
    state
        .services
        .access
        .set_key_used_by(&body.uses_key, &body.server_id)?;

    let instance = weblens_service::Instance::new_remote(
        body.server_id,
        &body.name,
        ServerRole::Backup,
        "",
        &body.uses_key,
    );
    state.services.instances.add_remote(instance.clone())?;
    Ok(Json(json!(instance)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreHistoryBody {
    lifetimes: Vec<Lifetime>,
}

async fn restore_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RestoreHistoryBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &headers, true)?;
    let count = body.lifetimes.len();
    state.services.files.restore_history(body.lifetimes)?;
    state.services.caster.push_weblens_event(
        ws_fabric::RESTORE_STARTED_EVENT,
        ws_fabric::WsC::new(),
    );
    Ok(Json(json!({ "merged": count })))
}
