mod action;
mod event;
mod lifetime;
mod store;

pub use action::*;
pub use event::*;
pub use lifetime::*;
pub use store::*;

#[cfg(test)]
mod journal_tests;

use crate::{ContentId, FileId, FileNode, FsError, FsResult, InstanceId, PortablePath};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

const EVENT_STREAM_DEPTH: usize = 10;

/// The journaled history of one file tree. Every structural mutation arrives
/// here as a [`FileEvent`]; a single writer task drains the stream, folds the
/// actions into their lifetimes, and upserts the result into the store.
///
/// The event fence is closed even when the durable write fails, so callers
/// blocked on [`FileEvent::wait_logged`] are never deadlocked; backup
/// reconciliation is the recovery path for a lost write.
pub struct Journal {
    server_id: InstanceId,

    // Backup servers keep tracking tree state but do not record local
    // actions; they only merge history received from the core.
    ignore_local: AtomicBool,

    lifetimes: RwLock<HashMap<FileId, Lifetime>>,
    store: Arc<JournalStore>,

    event_tx: Mutex<Option<mpsc::Sender<Arc<FileEvent>>>>,
    pending: AtomicUsize,
    drained: Notify,
}

impl Journal {
    pub fn open(
        store: JournalStore,
        server_id: InstanceId,
        ignore_local: bool,
    ) -> FsResult<Arc<Self>> {
        let start = Instant::now();
        let loaded = store.all_lifetimes(&server_id)?;
        trace!(
            "Journal: loaded {} lifetimes for [{}] in {:?}",
            loaded.len(),
            server_id,
            start.elapsed()
        );

        let mut lifetimes = HashMap::with_capacity(loaded.len());
        for mut lt in loaded {
            lt.sort_actions();
            lifetimes.insert(lt.id.clone(), lt);
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_STREAM_DEPTH);

        let journal = Arc::new(Self {
            server_id,
            ignore_local: AtomicBool::new(ignore_local),
            lifetimes: RwLock::new(lifetimes),
            store: Arc::new(store),
            event_tx: Mutex::new(Some(event_tx)),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        let worker = journal.clone();
        tokio::spawn(async move { worker.event_worker(event_rx).await });

        Ok(journal)
    }

    pub fn server_id(&self) -> &InstanceId {
        &self.server_id
    }

    pub fn new_event(&self) -> Arc<FileEvent> {
        FileEvent::new(self.server_id.clone())
    }

    pub fn ignore_local(&self) -> bool {
        self.ignore_local.load(Ordering::Acquire)
    }

    pub fn set_ignore_local(&self, ignore: bool) {
        self.ignore_local.store(ignore, Ordering::Release);
    }

    /// Hand an event to the writer. Empty events and events on an
    /// ignore-local journal are acknowledged immediately.
    pub async fn log_event(&self, event: &Arc<FileEvent>) {
        if self.ignore_local() {
            trace!("Journal: ignoring local event [{}]", event.event_id);
            event.mark_logged();
            return;
        }
        if event.is_empty() {
            trace!("Journal: event [{}] has no actions, not logging", event.event_id);
            event.mark_logged();
            return;
        }

        let tx = self.event_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                trace!(
                    "Journal: dropping off event [{}] with {} actions",
                    event.event_id,
                    event.action_count()
                );
                self.pending.fetch_add(1, Ordering::AcqRel);
                if tx.send(event.clone()).await.is_err() {
                    warn!("Journal: event stream closed, event [{}] dropped", event.event_id);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    event.mark_logged();
                }
            }
            None => {
                warn!("Journal: logging on a closed journal");
                event.mark_logged();
            }
        }
    }

    /// Block until every event handed to [`Journal::log_event`] so far has
    /// been handled by the writer.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the writer once the stream drains. Events logged after close are
    /// acknowledged without being written.
    pub fn close(&self) {
        self.event_tx.lock().unwrap().take();
    }

    async fn event_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Arc<FileEvent>>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.handle_file_event(&event) {
                error!("Journal: failed handling event [{}]: {}", event.event_id, err);
            }
            event.mark_logged();

            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.drained.notify_waiters();
            }
        }
        debug!("Journal: event worker exiting");
    }

    fn handle_file_event(&self, event: &Arc<FileEvent>) -> FsResult<()> {
        let mut actions = event.actions();
        if actions.is_empty() {
            return Ok(());
        }
        actions.sort_by_key(|a| a.timestamp);
        trace!("Journal: handling event with {} actions", actions.len());

        let mut lifetimes = self.lifetimes.write().unwrap();
        let mut updated = Vec::new();

        for action in actions {
            trace!("Journal: handling {} for {}", action.action_type, action.life_id);
            if action.action_type.opens_lifetime() {
                if lifetimes.contains_key(&action.life_id) {
                    warn!(
                        "Journal: create action for already existing lifetime {}",
                        action.life_id
                    );
                    continue;
                }
                let lt = Lifetime::new(action)?;
                updated.push(lt.id.clone());
                lifetimes.insert(lt.id.clone(), lt);
            } else {
                match lifetimes.get_mut(&action.life_id) {
                    Some(lt) => {
                        lt.add(action);
                        updated.push(lt.id.clone());
                    }
                    None => {
                        warn!(
                            "Journal: {} action for unknown lifetime {}",
                            action.action_type, action.life_id
                        );
                    }
                }
            }
        }

        updated.dedup();
        for id in updated {
            if let Some(lt) = lifetimes.get(&id) {
                self.store.upsert_lifetime(lt)?;
            }
        }
        Ok(())
    }

    /// Record the content id on a lifetime after upload hashing completes.
    pub fn set_lifetime_content(&self, life_id: &FileId, content_id: &ContentId) -> FsResult<()> {
        let mut lifetimes = self.lifetimes.write().unwrap();
        let lt = lifetimes
            .get_mut(life_id)
            .ok_or_else(|| FsError::NoLifetime(life_id.to_string()))?;
        lt.content_id = content_id.clone();
        self.store.upsert_lifetime(lt)
    }

    // ==================== Queries ====================

    pub fn get(&self, life_id: &FileId) -> Option<Lifetime> {
        self.lifetimes.read().unwrap().get(life_id).cloned()
    }

    /// The lifetime currently living at a portable path, if any.
    pub fn get_by_live_path(&self, path: &str) -> Option<Lifetime> {
        self.lifetimes
            .read()
            .unwrap()
            .values()
            .find(|lt| lt.live_file_path == path)
            .cloned()
    }

    pub fn active_lifetimes(&self) -> Vec<Lifetime> {
        self.lifetimes
            .read()
            .unwrap()
            .values()
            .filter(|lt| lt.is_live())
            .cloned()
            .collect()
    }

    pub fn all_lifetimes(&self) -> Vec<Lifetime> {
        self.lifetimes.read().unwrap().values().cloned().collect()
    }

    /// Merge lifetimes received from another server's journal (the backup
    /// replay path). Lifetimes for a different server are rejected.
    pub fn add(&self, incoming: Vec<Lifetime>) -> FsResult<()> {
        let mut to_write = Vec::new();
        {
            let mut lifetimes = self.lifetimes.write().unwrap();
            for mut lt in incoming {
                if lt.server_id != self.server_id {
                    return Err(FsError::JournalServerMismatch(format!(
                        "{} != {}",
                        lt.server_id, self.server_id
                    )));
                }

                match lifetimes.get_mut(&lt.id) {
                    Some(existing) => {
                        if existing.merge(&lt) {
                            to_write.push(existing.clone());
                        }
                    }
                    None => {
                        lt.sort_actions();
                        lifetimes.insert(lt.id.clone(), lt.clone());
                        to_write.push(lt);
                    }
                }
            }
        }

        for lt in to_write {
            self.store.upsert_lifetime(&lt)?;
        }
        Ok(())
    }

    /// Reconstruct a file descriptor as it existed at `at`. Pure size-change
    /// actions never relocate a file, so they are skipped when picking the
    /// placing action.
    pub fn get_past_file(&self, life_id: &FileId, at: i64) -> FsResult<Arc<FileNode>> {
        let lt = self
            .get(life_id)
            .ok_or_else(|| FsError::NoLifetime(life_id.to_string()))?;

        let mut actions = lt.actions.clone();
        actions.sort_by_key(|a| a.timestamp);

        let relevant = actions
            .iter()
            .filter(|a| a.timestamp <= at && !a.is_size_change())
            .last()
            .ok_or_else(|| FsError::NoFileAction(format!("{} at {}", life_id, at)))?;

        if relevant.destination_path.is_empty() {
            return Err(FsError::NoFile(format!("{} deleted before {}", life_id, at)));
        }

        let portable = PortablePath::parse(&relevant.destination_path)?;
        let node = FileNode::new_past(
            lt.id.clone(),
            portable,
            relevant.parent_id.clone(),
            relevant.size,
            relevant.timestamp,
            lt.content_id.clone(),
        );

        if node.is_dir() {
            for child in self.get_past_folder_children(&node, at)? {
                node.add_child(&child)?;
            }
        }

        Ok(node)
    }

    /// The children of a folder as they stood at `at`, one node per lifetime
    /// whose placing action at that time was under the folder.
    pub fn get_past_folder_children(
        &self,
        folder: &Arc<FileNode>,
        at: i64,
    ) -> FsResult<Vec<Arc<FileNode>>> {
        let folder_id = folder.life_id();
        let actions = self.store.children_at_time(&folder_id, at)?;
        trace!("Journal: got {} placing actions under {}", actions.len(), folder_id);

        let lifetimes = self.lifetimes.read().unwrap();
        let mut children = Vec::with_capacity(actions.len());
        for action in actions {
            let portable = PortablePath::parse(&action.destination_path)?;
            let content_id = lifetimes
                .get(&action.life_id)
                .map(|lt| lt.content_id.clone())
                .unwrap_or_default();
            children.push(FileNode::new_past(
                action.life_id.clone(),
                portable,
                folder_id.clone(),
                action.size,
                at,
                content_id,
            ));
        }
        Ok(children)
    }

    pub fn get_actions_by_path(&self, path: &PortablePath) -> FsResult<Vec<FileAction>> {
        self.store.actions_by_path(&self.server_id, &path.to_portable())
    }

    /// The globally most recent action, used by backup servers to compute
    /// their since-cursor.
    pub fn get_latest_action(&self) -> FsResult<Option<FileAction>> {
        self.store.latest_action(&self.server_id)
    }

    /// All lifetimes with any action after `since`, oldest first.
    pub fn get_lifetimes_since(&self, since: i64) -> FsResult<Vec<Lifetime>> {
        let ids = self.store.lifetime_ids_since(&self.server_id, since)?;
        let lifetimes = self.lifetimes.read().unwrap();
        let mut found: Vec<Lifetime> = ids
            .iter()
            .filter_map(|id| lifetimes.get(id).cloned())
            .collect();
        found.sort_by_key(|lt| lt.first_timestamp());
        Ok(found)
    }

    pub fn clear(&self) -> FsResult<()> {
        self.lifetimes.write().unwrap().clear();
        self.store.clear(&self.server_id)
    }
}
