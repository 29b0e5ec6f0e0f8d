//! Archive cache manager: bound the number of archived rows.
//!
//! Archived files are kept at all so a reference that disappears and
//! reappears can be restored without a round trip; the cache limit keeps
//! that convenience from growing without bound. Runs after every
//! reconciliation pass and on each periodic sync tick.

use marina_core::Result;
use tracing::{debug, info};

use crate::local_store::LocalFileStore;
use crate::repository::AttachmentRepository;

/// Evicts the oldest archived rows once the configured limit is exceeded.
pub struct ArchiveCache {
    repository: AttachmentRepository,
    store: LocalFileStore,
    limit: u64,
}

impl ArchiveCache {
    /// Create a cache manager with the given row limit. A limit of `0`
    /// evicts archived rows immediately.
    pub fn new(repository: AttachmentRepository, store: LocalFileStore, limit: u64) -> Self {
        Self {
            repository,
            store,
            limit,
        }
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Evict oldest archived rows beyond the limit, removing their local
    /// files. Returns the number of rows evicted.
    pub async fn evict_overflow(&self) -> Result<usize> {
        let count = self.repository.archived_count().await?;
        if count <= self.limit as i64 {
            return Ok(0);
        }

        let evicted = self.repository.delete_archived_beyond(self.limit).await?;
        for attachment in &evicted {
            let path = self.store.path(&attachment.filename);
            debug!(id = %attachment.id, "archive cache: evicting");
            // Rows may have been archived without their file surviving; a
            // missing file is fine.
            self.store.delete(&path).await?;
        }

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), limit = self.limit, "archive cache: eviction complete");
        }
        Ok(evicted.len())
    }
}
