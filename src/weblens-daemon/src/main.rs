mod config;
mod core_client;
mod http;
mod recognition;
mod ws;

#[macro_use]
extern crate log;

use axum::routing::get;
use config::Config;
use core_client::HttpCoreFactory;
use file_tree::{FileTree, InstanceId, Journal, JournalStore};
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use weblens_service::jobs::{self, JobMeta};
use weblens_service::media::MediaService;
use weblens_service::{
    AccessService, FileService, InstanceService, RecordDb, ServerRole, ServiceBundle,
    ServiceResult, Services, ShareService, UploadService, UserService,
};
use ws_fabric::{Caster, ClientManager};

const BACKUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn main() {
    let cfg = Config::load();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log_filter()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime");

    if let Err(err) = runtime.block_on(run(cfg)) {
        error!("weblens failed to start: {}", err);
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> ServiceResult<()> {
    info!("weblens starting (workers: {})", cfg.pool_worker_count);

    let db = RecordDb::open(&cfg.db_path)?;
    let instances = InstanceService::new(db.clone())?;

    // Before first init the journal runs under a placeholder id; the init
    // endpoint asks for a restart once the real identity exists.
    let (server_id, ignore_local) = match instances.get_local() {
        Ok(local) => (local.id.clone(), local.role == ServerRole::Backup),
        Err(_) => (InstanceId::new("uninitialized"), true),
    };

    let journal_store = JournalStore::open(&cfg.db_path.with_file_name("journal.db"))?;
    let journal = Journal::open(journal_store, server_id, ignore_local)?;

    let users_tree = Arc::new(FileTree::new(
        cfg.media_root.join("users"),
        weblens_service::USERS_TREE,
        journal.clone(),
    )?);
    let caches_tree = Arc::new(FileTree::new(
        cfg.caches_root.clone(),
        weblens_service::CACHES_TREE,
        null_journal()?,
    )?);
    let restore_tree = Arc::new(FileTree::new(
        cfg.media_root.join("restore"),
        weblens_service::RESTORE_TREE,
        null_journal()?,
    )?);

    let files = FileService::new(users_tree, caches_tree, restore_tree, db.clone())?;

    // Re-materialize what already sits on disk: the restore pool and the
    // cache artifacts survive restarts.
    let restore = files.restore_tree();
    restore.load_from_disk(&restore.root(), None).await?;
    let caches = files.caches_tree();
    for sub in [weblens_service::THUMBS_DIR, weblens_service::TAKEOUT_DIR] {
        if let Ok(dir) = caches.root().get_child(sub) {
            caches.load_from_disk(&dir, None).await?;
        }
    }
    files.load_content_index()?;

    let users = UserService::new(db.clone())?;
    let access = AccessService::new(db.clone())?;
    let shares = ShareService::new(db.clone())?;
    let recognizer: Option<Arc<dyn weblens_service::media::Recognizer>> = cfg
        .ollama_host
        .as_deref()
        .map(|host| Arc::new(recognition::OllamaRecognizer::new(host)) as _);
    let media = MediaService::new(db, files.clone(), Arc::new(NullCodec), recognizer)?;

    let clients = ClientManager::new();
    if let Ok(local) = instances.get_local() {
        clients.set_local_instance(local.id.clone());
    }
    let caster = Caster::new(clients.clone());
    let tasks = task_pool::WorkerPool::<JobMeta>::new(cfg.pool_worker_count);
    let uploads = UploadService::new();

    let services: Services = Arc::new(ServiceBundle {
        instances: instances.clone(),
        users,
        files: files.clone(),
        media,
        access,
        shares,
        uploads,
        tasks: tasks.clone(),
        clients: clients.clone(),
        caster: caster.clone(),
    });

    jobs::register_jobs(&tasks, services.clone(), Some(Arc::new(HttpCoreFactory)));
    tasks.start();

    // A core server re-walks its users tree on boot to pick up anything
    // that changed underneath it.
    if instances.local_role() == ServerRole::Core {
        let root_id = files.users_tree().root().id();
        if let Err(err) = tasks.dispatch_job(
            JobMeta::ScanDirectory { folder_id: root_id },
            Some(caster.clone()),
            None,
        ) {
            warn!("startup scan failed to dispatch: {}", err);
        }
    }

    // Backup servers mirror each remote core and dial its relay socket.
    if instances.local_role() == ServerRole::Backup {
        for remote in instances.remotes() {
            if remote.role != ServerRole::Core {
                continue;
            }
            weblens_service::backup::mount_mirror_tree(
                &services,
                cfg.db_path.parent().unwrap_or(std::path::Path::new(".")),
                &cfg.media_root,
                &remote.id,
            )?;
            tokio::spawn(core_client::run_core_relay(services.clone(), remote));
        }
        tokio::spawn(weblens_service::backup::backup_d(
            BACKUP_INTERVAL,
            services.clone(),
        ));
    }

    let state = http::AppState::new(services.clone());
    let mut router = http::router(state.clone()).route(
        "/api/ws",
        get(ws::ws_handler).with_state(state),
    );
    if let Some(ui_path) = &cfg.ui_path {
        router = router.fallback_service(ServeDir::new(ui_path));
    }
    let router = router.layer(tower_http::trace::TraceLayer::new_for_http());

    let bind = format!("{}:{}", cfg.router_host, cfg.router_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| weblens_service::ServiceError::IoError(format!("bind {}: {}", bind, e)))?;
    info!("weblens listening on {}", bind);

    caster.push_weblens_event(ws_fabric::WEBLENS_LOADED_EVENT, ws_fabric::WsC::new());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(services.clone()))
        .await
        .map_err(|e| weblens_service::ServiceError::IoError(e.to_string()))?;

    files.journal().flush().await;
    files.journal().close();
    info!("weblens stopped");
    Ok(())
}

async fn shutdown_signal(services: Services) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    services
        .caster
        .push_weblens_event(ws_fabric::SERVER_GOING_DOWN_EVENT, ws_fabric::WsC::new());
    services.tasks.stop();
}

fn null_journal() -> ServiceResult<Arc<Journal>> {
    let store = JournalStore::open_in_memory()?;
    Ok(Journal::open(store, InstanceId::new("untracked"), true)?)
}

/// Placeholder codec until a real image/video stack is linked in. Every
/// decode reports failure, so scans record files without display artifacts.
struct NullCodec;

#[async_trait::async_trait]
impl weblens_service::media::MediaCodec for NullCodec {
    async fn decode(
        &self,
        _data: &[u8],
        mime: &str,
    ) -> ServiceResult<weblens_service::media::DecodedImage> {
        Err(weblens_service::ServiceError::NotImplemented(format!(
            "no codec for {}",
            mime
        )))
    }

    async fn encode_scaled(
        &self,
        _data: &[u8],
        mime: &str,
        _page: u32,
        _max_side: u32,
    ) -> ServiceResult<Vec<u8>> {
        Err(weblens_service::ServiceError::NotImplemented(format!(
            "no codec for {}",
            mime
        )))
    }

    async fn probe(
        &self,
        path: &std::path::Path,
    ) -> ServiceResult<weblens_service::media::VideoProbe> {
        Err(weblens_service::ServiceError::NotImplemented(format!(
            "no video probe for {}",
            path.display()
        )))
    }

    async fn extract_frame(
        &self,
        path: &std::path::Path,
        _frame_index: u32,
    ) -> ServiceResult<Vec<u8>> {
        Err(weblens_service::ServiceError::NotImplemented(format!(
            "no frame extraction for {}",
            path.display()
        )))
    }

    fn parse_create_date(&self, _data: &[u8]) -> Option<i64> {
        None
    }
}
