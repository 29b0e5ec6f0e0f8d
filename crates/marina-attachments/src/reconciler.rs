//! Reconciler: diff the referenced set against the stored set and emit
//! state transitions.
//!
//! One reconciliation pass runs inside a single repository transaction, so
//! the state table never reflects a partial diff. Re-running a pass on an
//! unchanged referenced set produces zero transitions.

use std::collections::HashMap;

use marina_core::{Attachment, AttachmentState, Result, WatchedAttachmentItem};
use tracing::{debug, info};

use crate::local_store::LocalFileStore;
use crate::repository::AttachmentRepository;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Number of rows inserted, transitioned, or deleted.
    pub changes: usize,
}

/// Transforms `(referenced set, stored set)` into state transitions.
pub struct Reconciler {
    repository: AttachmentRepository,
    store: LocalFileStore,
    download_attachments: bool,
}

impl Reconciler {
    /// Create a reconciler over the repository and file store.
    pub fn new(
        repository: AttachmentRepository,
        store: LocalFileStore,
        download_attachments: bool,
    ) -> Self {
        Self {
            repository,
            store,
            download_attachments,
        }
    }

    /// Run one pass against the latest watcher emission.
    pub async fn reconcile(&self, items: &[WatchedAttachmentItem]) -> Result<ReconcileOutcome> {
        // Last occurrence wins if an id is emitted twice.
        let referenced: HashMap<&str, &WatchedAttachmentItem> =
            items.iter().map(|item| (item.id.as_str(), item)).collect();

        let mut tx = self.repository.begin_write().await?;
        let stored = self.repository.get_all_tx(tx.as_mut()).await?;
        let stored_ids: HashMap<&str, &Attachment> =
            stored.iter().map(|att| (att.id.as_str(), att)).collect();

        let mut changes = 0;

        for (id, item) in &referenced {
            match stored_ids.get(id) {
                // Restoration wins over insertion: an archived row keeps its
                // history and, when the file survived, skips the round trip.
                Some(existing) if existing.state == AttachmentState::Archived => {
                    let path = self.store.path(&existing.filename);
                    let next_state = if self.store.exists(&path).await? {
                        AttachmentState::Synced
                    } else if self.download_attachments {
                        AttachmentState::QueuedDownload
                    } else {
                        debug!(id = %id, "reconcile: downloads disabled, leaving archived");
                        continue;
                    };
                    debug!(id = %id, state = %next_state, "reconcile: restoring archived row");
                    self.repository
                        .save_tx(tx.as_mut(), existing.with_state(next_state))
                        .await?;
                    changes += 1;
                }
                // The worker drives any in-flight transition.
                Some(_) => {}
                None => {
                    if !self.download_attachments {
                        debug!(id = %id, "reconcile: downloads disabled, not scheduling");
                        continue;
                    }
                    debug!(id = %id, "reconcile: new referenced id, queueing download");
                    let mut attachment =
                        Attachment::new(*id, item.filename(), AttachmentState::QueuedDownload);
                    attachment.media_type = item.media_type.clone();
                    self.repository.save_tx(tx.as_mut(), attachment).await?;
                    changes += 1;
                }
            }
        }

        for attachment in &stored {
            if referenced.contains_key(attachment.id.as_str()) {
                continue;
            }
            match attachment.state {
                AttachmentState::Synced => {
                    debug!(id = %attachment.id, "reconcile: unreferenced, archiving");
                    self.repository
                        .save_tx(tx.as_mut(), attachment.with_state(AttachmentState::Archived))
                        .await?;
                    changes += 1;
                }
                AttachmentState::QueuedDownload => {
                    // Never fetched and no longer wanted; nothing to preserve.
                    debug!(id = %attachment.id, "reconcile: unreferenced pending download, deleting");
                    self.repository.delete_tx(tx.as_mut(), &attachment.id).await?;
                    changes += 1;
                }
                // A pending upload still uploads: the row was created inside
                // the reference-assignment transaction and the watcher may
                // simply not have observed that commit yet. Pending deletes
                // and archived rows are already where they belong.
                AttachmentState::QueuedUpload
                | AttachmentState::QueuedDelete
                | AttachmentState::Archived => {}
            }
        }

        tx.commit().await?;

        if changes > 0 {
            info!(
                referenced = referenced.len(),
                stored = stored.len(),
                changes,
                "reconcile: pass complete"
            );
        }
        Ok(ReconcileOutcome { changes })
    }
}
