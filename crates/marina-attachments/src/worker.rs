//! Sync worker: drives queued attachment operations to completion.
//!
//! One worker task owns the sync loop. It wakes on attachment-table change
//! notifications, on the periodic retry tick, and on explicit triggers, then
//! drains the three queued states with bounded parallelism: at most one
//! in-flight upload, one download, and one delete at a time, oldest row
//! first within each class.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use marina_core::{
    defaults, Attachment, AttachmentState, Error, RemoteStorageAdapter, Result, SqlRow,
    SyncErrorHandler,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ArchiveCache;
use crate::local_store::LocalFileStore;
use crate::repository::AttachmentRepository;

/// Operation class a sync failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Upload,
    Download,
    Delete,
}

/// Event emitted by the sync worker.
///
/// Background sync failures are observable only through these events and
/// the row's state; the queue never logs user-visibly.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Worker loop started.
    WorkerStarted,
    /// Worker loop stopped.
    WorkerStopped,
    /// An attachment reached `synced`.
    AttachmentSynced { id: String },
    /// An attachment was archived (gave up on upload, or unreferenced).
    AttachmentArchived { id: String },
    /// An attachment row was removed.
    AttachmentDeleted { id: String },
    /// A sync operation failed; the row stays in its queued state when the
    /// error handler elects to retry.
    SyncFailed {
        id: String,
        phase: SyncPhase,
        error: String,
    },
}

/// RAII guard for the per-id in-flight set. Releases on every exit path,
/// including cancellation, via `Drop`.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut guard = set.lock().expect("in-flight set poisoned");
        if guard.insert(id.to_string()) {
            Some(Self {
                set: Arc::clone(set),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .remove(&self.id);
    }
}

/// Handle for controlling a running worker.
pub(crate) struct WorkerHandle {
    trigger_tx: mpsc::Sender<()>,
    pub(crate) task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request a sync pass. Triggers coalesce; a full channel means a pass
    /// is already pending.
    pub(crate) fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// A cloneable trigger sender for the reconcile loop.
    pub(crate) fn trigger_sender(&self) -> mpsc::Sender<()> {
        self.trigger_tx.clone()
    }
}

/// The sync worker.
pub struct SyncWorker {
    repository: AttachmentRepository,
    store: LocalFileStore,
    remote: Arc<dyn RemoteStorageAdapter>,
    error_handler: Arc<dyn SyncErrorHandler>,
    cache: ArchiveCache,
    download_attachments: bool,
    sync_interval: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        repository: AttachmentRepository,
        store: LocalFileStore,
        remote: Arc<dyn RemoteStorageAdapter>,
        error_handler: Arc<dyn SyncErrorHandler>,
        cache: ArchiveCache,
        download_attachments: bool,
        sync_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_CHANNEL_CAPACITY);
        Self {
            repository,
            store,
            remote,
            error_handler,
            cache,
            download_attachments,
            sync_interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn the worker loop and return a handle for control.
    pub(crate) fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(defaults::TRIGGER_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(trigger_rx, shutdown));
        WorkerHandle { trigger_tx, task }
    }

    /// Worker loop: wake on table changes, triggers, and the periodic tick.
    async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            sync_interval_ms = self.sync_interval.as_millis() as u64,
            "sync worker started"
        );
        let _ = self.event_tx.send(SyncEvent::WorkerStarted);

        // Change notifications: the repository watch emits the current
        // pending set immediately, which doubles as the initial kick for
        // restart recovery.
        let mut changes = self.repository.watch_queued();

        let mut ticker = if self.sync_interval.is_zero() {
            None
        } else {
            Some(tokio::time::interval_at(
                tokio::time::Instant::now() + self.sync_interval,
                self.sync_interval,
            ))
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    self.sync_pass(&shutdown).await;
                }
                emission = changes.next() => {
                    match emission {
                        Some(Ok(pending)) => {
                            if !pending.is_empty() {
                                self.sync_pass(&shutdown).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "attachment table watch error");
                        }
                        None => {
                            debug!("attachment table watch ended");
                            changes = Box::pin(futures::stream::pending::<Result<Vec<SqlRow>>>());
                        }
                    }
                }
                _ = Self::tick(&mut ticker) => {
                    self.sync_pass(&shutdown).await;
                    if let Err(e) = self.cache.evict_overflow().await {
                        error!(error = %e, "archive cache eviction failed");
                    }
                }
            }
        }

        let _ = self.event_tx.send(SyncEvent::WorkerStopped);
        info!("sync worker stopped");
    }

    async fn tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Drain the three queued states, one in-flight operation per class.
    pub(crate) async fn sync_pass(&self, shutdown: &watch::Receiver<bool>) {
        debug!("sync pass");
        let (upload, download, delete) = tokio::join!(
            self.drain(AttachmentState::QueuedUpload, shutdown.clone()),
            self.drain(AttachmentState::QueuedDownload, shutdown.clone()),
            self.drain(AttachmentState::QueuedDelete, shutdown.clone()),
        );
        for result in [upload, download, delete] {
            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => debug!("sync pass cancelled"),
                // Logged and retried on the next cycle.
                Err(e) => error!(error = %e, "sync pass failed"),
            }
        }
    }

    /// Process rows in `state`, oldest first, skipping rows already in
    /// flight and rows already attempted in this pass.
    async fn drain(&self, state: AttachmentState, shutdown: watch::Receiver<bool>) -> Result<()> {
        if state == AttachmentState::QueuedDownload && !self.download_attachments {
            return Ok(());
        }

        let mut shutdown = shutdown;
        let mut attempted: HashSet<String> = HashSet::new();
        loop {
            if *shutdown.borrow() {
                return Err(Error::Cancelled);
            }

            let rows = self.repository.get_by_state(state).await?;
            let Some(attachment) = rows.into_iter().find(|att| !attempted.contains(&att.id))
            else {
                return Ok(());
            };
            attempted.insert(attachment.id.clone());

            let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &attachment.id) else {
                debug!(id = %attachment.id, "operation already in flight, skipping");
                continue;
            };

            let result = match state {
                AttachmentState::QueuedUpload => {
                    self.process_upload(&attachment, &mut shutdown).await
                }
                AttachmentState::QueuedDownload => {
                    self.process_download(&attachment, &mut shutdown).await
                }
                AttachmentState::QueuedDelete => {
                    self.process_delete(&attachment, &mut shutdown).await
                }
                AttachmentState::Synced | AttachmentState::Archived => Ok(()),
            };
            result?;
        }
    }

    /// Stream the local file to the remote adapter.
    async fn process_upload(
        &self,
        attachment: &Attachment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        debug!(id = %attachment.id, "upload: starting");
        let path = self.local_path(attachment);

        let outcome = race_shutdown(shutdown, async {
            let data = self.store.read(&path).await?;
            self.remote.upload_file(data, attachment).await
        })
        .await;

        match outcome {
            Ok(()) => {
                let updated = attachment.with_state(AttachmentState::Synced);
                if self.repository.update_if_unchanged(attachment, updated).await? {
                    info!(id = %attachment.id, "upload: synced");
                    let _ = self.event_tx.send(SyncEvent::AttachmentSynced {
                        id: attachment.id.clone(),
                    });
                }
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                let _ = self.event_tx.send(SyncEvent::SyncFailed {
                    id: attachment.id.clone(),
                    phase: SyncPhase::Upload,
                    error: err.to_string(),
                });
                if self.error_handler.on_upload_error(attachment, &err).await {
                    warn!(id = %attachment.id, error = %err, "upload: failed, will retry");
                } else {
                    warn!(id = %attachment.id, error = %err, "upload: giving up, archiving");
                    let updated = attachment.with_state(AttachmentState::Archived);
                    if self.repository.update_if_unchanged(attachment, updated).await? {
                        let _ = self.event_tx.send(SyncEvent::AttachmentArchived {
                            id: attachment.id.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Stream the remote object into the local store.
    async fn process_download(
        &self,
        attachment: &Attachment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        debug!(id = %attachment.id, "download: starting");

        // A cancelled write can leave a temp file behind; garbage
        // collection on the next start removes it.
        let outcome = race_shutdown(shutdown, async {
            let data = self.remote.download_file(attachment).await?;
            self.store
                .write(&attachment.id, attachment.extension(), data)
                .await
        })
        .await;

        match outcome {
            Ok((path, size)) => {
                let mut updated = attachment.with_state(AttachmentState::Synced);
                updated.size = Some(size as i64);
                updated.local_uri = Some(path.to_string_lossy().into_owned());
                if self.repository.update_if_unchanged(attachment, updated).await? {
                    info!(id = %attachment.id, size, "download: synced");
                    let _ = self.event_tx.send(SyncEvent::AttachmentSynced {
                        id: attachment.id.clone(),
                    });
                }
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                let _ = self.event_tx.send(SyncEvent::SyncFailed {
                    id: attachment.id.clone(),
                    phase: SyncPhase::Download,
                    error: err.to_string(),
                });
                if self.error_handler.on_download_error(attachment, &err).await {
                    warn!(id = %attachment.id, error = %err, "download: failed, will retry");
                } else {
                    // No local file and no upload pending; nothing to retain.
                    warn!(id = %attachment.id, error = %err, "download: giving up, deleting row");
                    if self.repository.delete_if_unchanged(attachment).await? {
                        let _ = self.event_tx.send(SyncEvent::AttachmentDeleted {
                            id: attachment.id.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Delete remotely, then locally, then forget the row.
    async fn process_delete(
        &self,
        attachment: &Attachment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        debug!(id = %attachment.id, "delete: starting");

        let outcome = race_shutdown(shutdown, self.remote.delete_file(attachment)).await;

        match outcome {
            Ok(()) => {
                self.forget(attachment).await?;
                info!(id = %attachment.id, "delete: complete");
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                let _ = self.event_tx.send(SyncEvent::SyncFailed {
                    id: attachment.id.clone(),
                    phase: SyncPhase::Delete,
                    error: err.to_string(),
                });
                if self.error_handler.on_delete_error(attachment, &err).await {
                    warn!(id = %attachment.id, error = %err, "delete: failed, will retry");
                } else {
                    warn!(id = %attachment.id, error = %err, "delete: giving up, forgetting locally");
                    self.forget(attachment).await?;
                }
                Ok(())
            }
        }
    }

    /// Remove the local file (missing tolerated) and the row.
    async fn forget(&self, attachment: &Attachment) -> Result<()> {
        self.store.delete(&self.local_path(attachment)).await?;
        if self.repository.delete_if_unchanged(attachment).await? {
            let _ = self.event_tx.send(SyncEvent::AttachmentDeleted {
                id: attachment.id.clone(),
            });
        }
        Ok(())
    }

    fn local_path(&self, attachment: &Attachment) -> PathBuf {
        attachment
            .local_uri
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.path(&attachment.filename))
    }
}

/// Race `operation` against the shutdown signal; cancellation wins.
async fn race_shutdown<T>(
    shutdown: &mut watch::Receiver<bool>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = shutdown_signalled(shutdown) => Err(Error::Cancelled),
        result = operation => result,
    }
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender dropped: the queue is gone, treat as shutdown.
            return;
        }
    }
}
