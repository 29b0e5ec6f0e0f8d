//! Queue orchestrator: lifecycle and public API.
//!
//! Composes the repository, local store, watcher, reconciler, sync worker,
//! and archive cache. The queue is an ordinary instance; multiple queues may
//! coexist if they use disjoint directories and tables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use marina_core::{
    defaults, Attachment, AttachmentState, ByteStream, DatabaseAdapter, Error,
    RemoteStorageAdapter, Result, RetryAlways, SyncErrorHandler, WatchedAttachmentStream,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::ArchiveCache;
use crate::local_store::LocalFileStore;
use crate::reconciler::Reconciler;
use crate::repository::{AttachmentRepository, TransactionCallback};
use crate::watcher;
use crate::worker::{SyncEvent, SyncWorker, WorkerHandle};

/// Factory producing a fresh referenced-attachment stream per subscription.
///
/// The stream itself is non-restartable, so each `start()` asks the factory
/// for a new one.
pub type WatchStreamFactory = Box<dyn Fn() -> WatchedAttachmentStream + Send + Sync>;

/// Configuration for an attachment queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root directory for local attachment files.
    pub attachments_directory: PathBuf,
    /// Periodic retry period in milliseconds; `0` disables periodic retry.
    pub sync_interval_ms: u64,
    /// Maximum number of archived rows retained.
    pub archived_cache_limit: u64,
    /// Name of the attachment state table.
    pub attachments_table_name: String,
    /// Whether missing referenced attachments are scheduled for download.
    pub download_attachments: bool,
}

impl QueueConfig {
    /// Create a config rooted at `directory` with default settings.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            attachments_directory: directory.into(),
            sync_interval_ms: defaults::SYNC_INTERVAL_MS,
            archived_cache_limit: defaults::ARCHIVED_CACHE_LIMIT,
            attachments_table_name: defaults::ATTACHMENTS_TABLE_NAME.to_string(),
            download_attachments: defaults::DOWNLOAD_ATTACHMENTS,
        }
    }

    /// Set the periodic retry period (`0` disables).
    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.sync_interval_ms = ms;
        self
    }

    /// Set the archived-row cache limit.
    pub fn with_archived_cache_limit(mut self, limit: u64) -> Self {
        self.archived_cache_limit = limit;
        self
    }

    /// Set the attachment state table name.
    pub fn with_attachments_table_name(mut self, name: impl Into<String>) -> Self {
        self.attachments_table_name = name.into();
        self
    }

    /// Enable or disable download scheduling.
    pub fn with_download_attachments(mut self, enabled: bool) -> Self {
        self.download_attachments = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.attachments_directory.as_os_str().is_empty() {
            return Err(Error::Config("attachments_directory must not be empty".into()));
        }
        validate_table_name(&self.attachments_table_name)?;
        Ok(())
    }
}

/// Validate a table name: lowercase identifier, no quoting required.
fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if valid_start && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid attachments table name '{name}': expected [a-z_][a-z0-9_]*"
        )))
    }
}

/// Optional fields for [`AttachmentQueue::save_file`].
#[derive(Default)]
pub struct SaveFileRequest {
    /// MIME type of the payload.
    pub media_type: Option<String>,
    /// Extension used to derive the storage filename.
    pub file_extension: Option<String>,
    /// Explicit id; generated (UUIDv7) when absent.
    pub id: Option<String>,
    /// Opaque application metadata (JSON by convention).
    pub meta_data: Option<String>,
    /// Callback run inside the save transaction, for atomically linking the
    /// attachment id into application rows.
    pub callback: Option<TransactionCallback>,
}

impl SaveFileRequest {
    /// Set the MIME type.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Set the file extension.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set opaque metadata.
    pub fn with_meta_data(mut self, meta_data: impl Into<String>) -> Self {
        self.meta_data = Some(meta_data.into());
        self
    }

    /// Set the transactional callback.
    pub fn with_callback(mut self, callback: TransactionCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Builder for [`AttachmentQueue`].
pub struct AttachmentQueueBuilder {
    db: Arc<dyn DatabaseAdapter>,
    remote: Arc<dyn RemoteStorageAdapter>,
    config: QueueConfig,
    watch_stream: Option<WatchStreamFactory>,
    error_handler: Arc<dyn SyncErrorHandler>,
}

impl AttachmentQueueBuilder {
    fn new(
        db: Arc<dyn DatabaseAdapter>,
        remote: Arc<dyn RemoteStorageAdapter>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            remote,
            config: QueueConfig::new(directory),
            watch_stream: None,
            error_handler: Arc::new(RetryAlways),
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the referenced-attachment stream factory (required).
    pub fn with_watch_stream<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> WatchedAttachmentStream + Send + Sync + 'static,
    {
        self.watch_stream = Some(Box::new(factory));
        self
    }

    /// Set the sync error handler (defaults to retry-always).
    pub fn with_error_handler(mut self, handler: Arc<dyn SyncErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Set the periodic retry period (`0` disables).
    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    /// Set the archived-row cache limit.
    pub fn with_archived_cache_limit(mut self, limit: u64) -> Self {
        self.config.archived_cache_limit = limit;
        self
    }

    /// Set the attachment state table name.
    pub fn with_attachments_table_name(mut self, name: impl Into<String>) -> Self {
        self.config.attachments_table_name = name.into();
        self
    }

    /// Enable or disable download scheduling.
    pub fn with_download_attachments(mut self, enabled: bool) -> Self {
        self.config.download_attachments = enabled;
        self
    }

    /// Build the queue.
    pub fn build(self) -> Result<AttachmentQueue> {
        self.config.validate()?;
        let watch_factory = self
            .watch_stream
            .ok_or_else(|| Error::Config("a watch stream factory is required".into()))?;

        let store = LocalFileStore::new(&self.config.attachments_directory);
        let repository =
            AttachmentRepository::new(self.db, self.config.attachments_table_name.clone());
        let cache = ArchiveCache::new(
            repository.clone(),
            store.clone(),
            self.config.archived_cache_limit,
        );
        let worker = Arc::new(SyncWorker::new(
            repository.clone(),
            store.clone(),
            self.remote,
            self.error_handler,
            cache,
            self.config.download_attachments,
            Duration::from_millis(self.config.sync_interval_ms),
        ));

        Ok(AttachmentQueue {
            config: self.config,
            repository,
            store,
            worker,
            watch_factory,
            running: Mutex::new(None),
        })
    }
}

/// Tasks owned by a started queue.
struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    watcher_task: JoinHandle<()>,
    reconcile_task: JoinHandle<()>,
    worker_handle: WorkerHandle,
}

/// Durable, reactive attachment synchronization queue.
pub struct AttachmentQueue {
    config: QueueConfig,
    repository: AttachmentRepository,
    store: LocalFileStore,
    worker: Arc<SyncWorker>,
    watch_factory: WatchStreamFactory,
    running: Mutex<Option<RunningState>>,
}

impl AttachmentQueue {
    /// Start building a queue over the given adapters and directory.
    pub fn builder(
        db: Arc<dyn DatabaseAdapter>,
        remote: Arc<dyn RemoteStorageAdapter>,
        directory: impl Into<PathBuf>,
    ) -> AttachmentQueueBuilder {
        AttachmentQueueBuilder::new(db, remote, directory)
    }

    /// The active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to sync events (observation hook for hosts and tests).
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.worker.events()
    }

    /// Start the queue: garbage-collect orphaned files, subscribe to the
    /// referenced-attachment stream, launch the reconcile and worker loops,
    /// and kick an initial sync pass. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("attachment queue already started");
            return Ok(());
        }

        // Remove temp-file orphans from interrupted transfers and files no
        // row owns.
        let stored = self.repository.get_all().await?;
        let keep: HashSet<String> = stored.iter().map(|att| att.filename.clone()).collect();
        self.store.collect_garbage(&keep).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let subscription = watcher::subscribe((self.watch_factory)(), shutdown_rx.clone());
        let worker_handle = self.worker.clone().spawn(shutdown_rx.clone());
        // Restart recovery: drain rows left queued by a previous process.
        worker_handle.trigger();

        let reconciler = Reconciler::new(
            self.repository.clone(),
            self.store.clone(),
            self.config.download_attachments,
        );
        let cache = ArchiveCache::new(
            self.repository.clone(),
            self.store.clone(),
            self.config.archived_cache_limit,
        );
        let reconcile_task = tokio::spawn(reconcile_loop(
            reconciler,
            cache,
            subscription.emissions,
            worker_handle.trigger_sender(),
            shutdown_rx,
        ));

        *running = Some(RunningState {
            shutdown_tx,
            watcher_task: subscription.task,
            reconcile_task,
            worker_handle,
        });

        info!(
            directory = %self.config.attachments_directory.display(),
            table = %self.config.attachments_table_name,
            "attachment queue started"
        );
        Ok(())
    }

    /// Stop the queue: cancel subscriptions and in-flight work, await
    /// quiescence. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            debug!("attachment queue already stopped");
            return Ok(());
        };

        let _ = state.shutdown_tx.send(true);
        let _ = state.watcher_task.await;
        let _ = state.reconcile_task.await;
        let _ = state.worker_handle.task.await;

        info!("attachment queue stopped");
        Ok(())
    }

    /// Save a new local attachment and queue it for upload.
    ///
    /// The payload is written to the local store first; the row (and the
    /// optional callback, for linking foreign keys) commits in one
    /// transaction afterwards. On any failure before commit the written file
    /// is removed: neither the row nor the file survives.
    ///
    /// Collision policy: an existing row in `queued_upload` or
    /// `queued_download` is re-queued for upload with the new payload; any
    /// other state fails with [`Error::InvalidState`].
    pub async fn save_file(&self, data: ByteStream, request: SaveFileRequest) -> Result<Attachment> {
        let id = request
            .id
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        // Check before touching the filesystem so an invalid save cannot
        // clobber a synced file.
        let existing = self.repository.get(&id).await?;
        if let Some(existing) = &existing {
            ensure_pre_upload(existing)?;
        }

        let extension = request.file_extension.as_deref();
        let (path, size) = self.store.write(&id, extension, data).await?;

        let mut attachment = Attachment::new(
            &id,
            LocalFileStore::filename(&id, extension),
            AttachmentState::QueuedUpload,
        );
        attachment.media_type = request.media_type;
        attachment.meta_data = request.meta_data;
        attachment.size = Some(size as i64);
        attachment.local_uri = Some(path.to_string_lossy().into_owned());
        attachment.has_synced = existing.as_ref().map(|e| e.has_synced).unwrap_or(false);

        let saved = self
            .save_file_row(attachment, request.callback)
            .await;

        match saved {
            Ok(stored) => {
                self.trigger().await;
                Ok(stored)
            }
            Err(err) => {
                // The row did not commit; the file must not survive either.
                if let Err(cleanup) = self.store.delete(&path).await {
                    error!(id = %id, error = %cleanup, "save_file: cleanup of written file failed");
                }
                Err(err)
            }
        }
    }

    /// Row mutation half of `save_file`: re-validates the collision policy
    /// inside the transaction, then upserts and runs the callback.
    async fn save_file_row(
        &self,
        attachment: Attachment,
        callback: Option<TransactionCallback>,
    ) -> Result<Attachment> {
        let mut tx = self.repository.begin_write().await?;
        if let Some(existing) = self.repository.get_tx(tx.as_mut(), &attachment.id).await? {
            ensure_pre_upload(&existing)?;
        }
        let stored = self.repository.save_tx(tx.as_mut(), attachment).await?;
        if let Some(callback) = callback {
            callback(tx.as_mut(), &stored).await?;
        }
        tx.commit().await?;
        Ok(stored)
    }

    /// Queue an attachment for remote and local deletion.
    ///
    /// Fails with [`Error::NotFound`] for an unknown id and
    /// [`Error::InvalidState`] for an archived row.
    pub async fn delete_file(
        &self,
        id: &str,
        callback: Option<TransactionCallback>,
    ) -> Result<Attachment> {
        let mut tx = self.repository.begin_write().await?;
        let existing = self
            .repository
            .get_tx(tx.as_mut(), id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment {id}")))?;
        if existing.state == AttachmentState::Archived {
            return Err(Error::InvalidState(format!(
                "attachment {id} is archived and no longer deletable"
            )));
        }

        let stored = self
            .repository
            .save_tx(tx.as_mut(), existing.with_state(AttachmentState::QueuedDelete))
            .await?;
        if let Some(callback) = callback {
            callback(tx.as_mut(), &stored).await?;
        }
        tx.commit().await?;

        self.trigger().await;
        Ok(stored)
    }

    /// Fetch one attachment record.
    pub async fn get_attachment(&self, id: &str) -> Result<Attachment> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment {id}")))
    }

    /// Request a sync pass. No-op while the queue is stopped.
    pub async fn trigger(&self) {
        if let Some(state) = self.running.lock().await.as_ref() {
            state.worker_handle.trigger();
        }
    }

    /// Test hook: delete every row and every local file.
    pub async fn clear_queue(&self) -> Result<()> {
        self.repository.clear().await?;
        self.store.remove_all().await?;
        Ok(())
    }
}

/// Reconcile loop: run one pass per coalesced watcher emission, then a cache
/// pass, then kick the worker.
async fn reconcile_loop(
    reconciler: Reconciler,
    cache: ArchiveCache,
    mut emissions: watch::Receiver<Option<Vec<marina_core::WatchedAttachmentItem>>>,
    trigger_tx: tokio::sync::mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("reconcile loop: shutdown");
                    return;
                }
            }
            changed = emissions.changed() => {
                if changed.is_err() {
                    debug!("reconcile loop: watcher gone");
                    return;
                }
                let Some(items) = emissions.borrow_and_update().clone() else {
                    continue;
                };
                match reconciler.reconcile(&items).await {
                    Ok(outcome) => {
                        if outcome.changes > 0 {
                            let _ = trigger_tx.try_send(());
                        }
                        if let Err(e) = cache.evict_overflow().await {
                            error!(error = %e, "archive cache eviction failed");
                        }
                    }
                    // Logged and retried on the next emission.
                    Err(e) => error!(error = %e, "reconciliation failed"),
                }
            }
        }
    }
}

/// Collision policy check for `save_file`.
fn ensure_pre_upload(existing: &Attachment) -> Result<()> {
    match existing.state {
        AttachmentState::QueuedUpload | AttachmentState::QueuedDownload => Ok(()),
        state => Err(Error::InvalidState(format!(
            "attachment {} already exists in state {state}",
            existing.id
        ))),
    }
}
