//! Adapter traits consumed by the attachment queue.
//!
//! Both the database and the remote storage are externally supplied; the
//! queue is written against these interfaces and must not assume a specific
//! implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::{Attachment, WatchedAttachmentItem};
use crate::sql::{SqlRow, SqlValue};

/// Lazy, finite sequence of byte chunks.
///
/// Producers are created fresh for every transfer attempt, so a failed
/// transfer is retried from scratch; an individual stream need not be
/// restartable.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// The externally supplied sequence of referenced-attachment snapshots.
///
/// Each emission is the complete current set of referenced attachments.
pub type WatchedAttachmentStream = BoxStream<'static, Vec<WatchedAttachmentItem>>;

/// An open write transaction on the attachment database.
///
/// Dropping a transaction without committing must roll it back; that is the
/// adapter's responsibility.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Fetch the first result row, if any.
    async fn get(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>>;

    /// Fetch all result rows.
    async fn get_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back explicitly.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// SQL database adapter.
///
/// Emissions from [`DatabaseAdapter::watch`] carry the full current result
/// set: one snapshot immediately on subscription, then one per relevant
/// change.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Execute a statement outside any explicit transaction.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Fetch the first result row, if any.
    async fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>>;

    /// Fetch all result rows.
    async fn get_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Open a write transaction. The handle is owned (adapters typically
    /// hold an exclusive connection guard) and must roll back when dropped
    /// without commit.
    async fn begin_write(&self) -> Result<Box<dyn DatabaseTransaction>>;

    /// Watch a query, emitting the full result set on every relevant change.
    fn watch(&self, sql: &str, params: &[SqlValue]) -> BoxStream<'static, Result<Vec<SqlRow>>>;
}

/// Remote blob storage adapter.
#[async_trait]
pub trait RemoteStorageAdapter: Send + Sync {
    /// Upload the attachment payload. Fails with transport/remote errors.
    async fn upload_file(&self, data: ByteStream, attachment: &Attachment) -> Result<()>;

    /// Download the attachment payload as a finite byte stream.
    async fn download_file(&self, attachment: &Attachment) -> Result<ByteStream>;

    /// Delete the remote object. Idempotent; a missing object is success.
    async fn delete_file(&self, attachment: &Attachment) -> Result<()>;
}

/// Policy hook for background sync failures.
///
/// Each method returns whether the failed operation should be retried on a
/// later sync cycle. The default implementation always retries.
#[async_trait]
pub trait SyncErrorHandler: Send + Sync {
    /// Called when uploading `attachment` failed. `false` archives the row.
    async fn on_upload_error(&self, attachment: &Attachment, error: &crate::Error) -> bool {
        let _ = (attachment, error);
        true
    }

    /// Called when downloading `attachment` failed. `false` deletes the row.
    async fn on_download_error(&self, attachment: &Attachment, error: &crate::Error) -> bool {
        let _ = (attachment, error);
        true
    }

    /// Called when deleting `attachment` remotely failed. `false` forgets
    /// the row locally anyway.
    async fn on_delete_error(&self, attachment: &Attachment, error: &crate::Error) -> bool {
        let _ = (attachment, error);
        true
    }
}

/// Default error handler: retry every failed operation indefinitely.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAlways;

#[async_trait]
impl SyncErrorHandler for RetryAlways {}
