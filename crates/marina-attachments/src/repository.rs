//! Attachment repository: transactional CRUD over the attachment state table.
//!
//! This is the only component that issues SQL against the table. Every
//! mutation stamps `timestamp`, so cache eviction order and the worker's
//! optimistic terminal writes both key off repository-controlled clocks.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use marina_core::{
    Attachment, AttachmentState, DatabaseAdapter, DatabaseTransaction, Error, Result, SqlRow,
    SqlValue,
};
use tracing::debug;

/// Callback invoked inside the same transaction as a row mutation, so the
/// application can atomically link or unlink foreign keys.
pub type TransactionCallback = Box<
    dyn for<'a> FnOnce(&'a mut dyn DatabaseTransaction, &'a Attachment) -> BoxFuture<'a, Result<()>>
        + Send,
>;

/// Coerce a closure into a [`TransactionCallback`].
///
/// The explicit bound guides closure lifetime inference; writing
/// `Box::new(|tx, att| ...)` directly usually fails to unify the borrowed
/// future's lifetime.
pub fn transaction_callback<F>(callback: F) -> TransactionCallback
where
    F: for<'a> FnOnce(&'a mut dyn DatabaseTransaction, &'a Attachment) -> BoxFuture<'a, Result<()>>
        + Send
        + 'static,
{
    Box::new(callback)
}

const COLUMNS: &str = "id, filename, media_type, state, timestamp, size, has_synced, meta_data, local_uri";

/// Repository over the configured attachment state table.
#[derive(Clone)]
pub struct AttachmentRepository {
    db: Arc<dyn DatabaseAdapter>,
    table: String,
}

impl AttachmentRepository {
    /// Create a repository against `table`.
    pub fn new(db: Arc<dyn DatabaseAdapter>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }

    /// The configured table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Open a write transaction for multi-step mutations.
    pub async fn begin_write(&self) -> Result<Box<dyn DatabaseTransaction>> {
        self.db.begin_write().await
    }

    /// Fetch one attachment by id.
    pub async fn get(&self, id: &str) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?", self.table);
        self.db
            .get(&sql, &[SqlValue::from(id)])
            .await?
            .map(|row| attachment_from_row(&row))
            .transpose()
    }

    /// Transaction-aware variant of [`AttachmentRepository::get`].
    pub async fn get_tx(
        &self,
        tx: &mut dyn DatabaseTransaction,
        id: &str,
    ) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?", self.table);
        tx.get(&sql, &[SqlValue::from(id)])
            .await?
            .map(|row| attachment_from_row(&row))
            .transpose()
    }

    /// Fetch all rows, oldest transition first.
    pub async fn get_all(&self) -> Result<Vec<Attachment>> {
        let sql = format!("SELECT {COLUMNS} FROM {} ORDER BY timestamp ASC", self.table);
        let rows = self.db.get_all(&sql, &[]).await?;
        rows.iter().map(attachment_from_row).collect()
    }

    /// Transaction-aware variant of [`AttachmentRepository::get_all`].
    pub async fn get_all_tx(&self, tx: &mut dyn DatabaseTransaction) -> Result<Vec<Attachment>> {
        let sql = format!("SELECT {COLUMNS} FROM {} ORDER BY timestamp ASC", self.table);
        let rows = tx.get_all(&sql, &[]).await?;
        rows.iter().map(attachment_from_row).collect()
    }

    /// Rows in `state`, oldest-timestamp first for fairness.
    pub async fn get_by_state(&self, state: AttachmentState) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE state = ? ORDER BY timestamp ASC",
            self.table
        );
        let rows = self.db.get_all(&sql, &[SqlValue::from(state.as_str())]).await?;
        rows.iter().map(attachment_from_row).collect()
    }

    /// Upsert `attachment`, stamping a fresh `timestamp`. Returns the stored
    /// record.
    pub async fn save(&self, attachment: Attachment) -> Result<Attachment> {
        let mut tx = self.db.begin_write().await?;
        let stored = self.save_tx(tx.as_mut(), attachment).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Upsert with a user callback in the same transaction. If the callback
    /// fails the transaction aborts and no state change is visible.
    pub async fn save_with(
        &self,
        attachment: Attachment,
        callback: Option<TransactionCallback>,
    ) -> Result<Attachment> {
        let mut tx = self.db.begin_write().await?;
        let stored = self.save_tx(tx.as_mut(), attachment).await?;
        if let Some(callback) = callback {
            callback(tx.as_mut(), &stored).await?;
        }
        tx.commit().await?;
        Ok(stored)
    }

    /// Transaction-aware variant of [`AttachmentRepository::save`].
    pub async fn save_tx(
        &self,
        tx: &mut dyn DatabaseTransaction,
        mut attachment: Attachment,
    ) -> Result<Attachment> {
        attachment.timestamp = now_ms();
        let sql = format!(
            "INSERT INTO {0} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             filename = excluded.filename, media_type = excluded.media_type, \
             state = excluded.state, timestamp = excluded.timestamp, \
             size = excluded.size, has_synced = excluded.has_synced, \
             meta_data = excluded.meta_data, local_uri = excluded.local_uri",
            self.table
        );
        tx.execute(&sql, &attachment_params(&attachment)).await?;
        debug!(id = %attachment.id, state = %attachment.state, "repository: saved");
        Ok(attachment)
    }

    /// Optimistic terminal write: apply `updated` only if the stored row
    /// still matches `expected`'s `(state, timestamp)`. Returns whether the
    /// write happened.
    pub async fn update_if_unchanged(
        &self,
        expected: &Attachment,
        updated: Attachment,
    ) -> Result<bool> {
        let timestamp = now_ms();
        let sql = format!(
            "UPDATE {} SET filename = ?, media_type = ?, state = ?, timestamp = ?, \
             size = ?, has_synced = ?, meta_data = ?, local_uri = ? \
             WHERE id = ? AND state = ? AND timestamp = ?",
            self.table
        );
        let params = [
            SqlValue::from(updated.filename.clone()),
            SqlValue::from(updated.media_type.clone()),
            SqlValue::from(updated.state.as_str()),
            SqlValue::from(timestamp),
            SqlValue::from(updated.size),
            SqlValue::from(updated.has_synced),
            SqlValue::from(updated.meta_data.clone()),
            SqlValue::from(updated.local_uri.clone()),
            SqlValue::from(expected.id.clone()),
            SqlValue::from(expected.state.as_str()),
            SqlValue::from(expected.timestamp),
        ];
        let affected = self.db.execute(&sql, &params).await?;
        if affected == 0 {
            debug!(id = %expected.id, "repository: row changed underneath, terminal write skipped");
        }
        Ok(affected > 0)
    }

    /// Optimistic hard delete: remove the row only if it still matches
    /// `expected`'s `(state, timestamp)`. Returns whether the row was
    /// removed.
    pub async fn delete_if_unchanged(&self, expected: &Attachment) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND state = ? AND timestamp = ?",
            self.table
        );
        let params = [
            SqlValue::from(expected.id.clone()),
            SqlValue::from(expected.state.as_str()),
            SqlValue::from(expected.timestamp),
        ];
        let affected = self.db.execute(&sql, &params).await?;
        if affected == 0 {
            debug!(id = %expected.id, "repository: row changed underneath, delete skipped");
        }
        Ok(affected > 0)
    }

    /// Hard-delete one row.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.db.begin_write().await?;
        self.delete_tx(tx.as_mut(), id).await?;
        tx.commit().await
    }

    /// Transaction-aware variant of [`AttachmentRepository::delete`].
    pub async fn delete_tx(&self, tx: &mut dyn DatabaseTransaction, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        tx.execute(&sql, &[SqlValue::from(id)]).await?;
        Ok(())
    }

    /// Number of rows currently archived.
    pub async fn archived_count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {} WHERE state = ?", self.table);
        let row = self
            .db
            .get(&sql, &[SqlValue::from(AttachmentState::Archived.as_str())])
            .await?
            .ok_or_else(|| Error::Database("COUNT(*) returned no row".to_string()))?;
        row.integer("n")
    }

    /// Delete the oldest archived rows beyond `limit`, returning the deleted
    /// records so callers can remove their local files.
    pub async fn delete_archived_beyond(&self, limit: u64) -> Result<Vec<Attachment>> {
        let mut tx = self.db.begin_write().await?;

        let count_sql = format!("SELECT COUNT(*) AS n FROM {} WHERE state = ?", self.table);
        let state = SqlValue::from(AttachmentState::Archived.as_str());
        let count = tx
            .get(&count_sql, &[state.clone()])
            .await?
            .ok_or_else(|| Error::Database("COUNT(*) returned no row".to_string()))?
            .integer("n")?;

        let excess = count - limit as i64;
        if excess <= 0 {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let select_sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE state = ? ORDER BY timestamp ASC LIMIT ?",
            self.table
        );
        let rows = tx
            .get_all(&select_sql, &[state.clone(), SqlValue::from(excess)])
            .await?;
        let evicted: Vec<Attachment> = rows
            .iter()
            .map(attachment_from_row)
            .collect::<Result<_>>()?;

        let delete_sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        for attachment in &evicted {
            tx.execute(&delete_sql, &[SqlValue::from(attachment.id.clone())])
                .await?;
        }
        tx.commit().await?;

        debug!(evicted = evicted.len(), "repository: archived rows evicted");
        Ok(evicted)
    }

    /// Delete all rows (test hook for `clear_queue`).
    pub async fn clear(&self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.table);
        self.db.execute(&sql, &[]).await
    }

    /// Watch the queued states; each emission is the current pending set.
    /// This is the worker's change-notification trigger source.
    pub fn watch_queued(&self) -> BoxStream<'static, Result<Vec<SqlRow>>> {
        let states: Vec<String> = AttachmentState::QUEUED
            .iter()
            .map(|state| format!("'{}'", state.as_str()))
            .collect();
        let sql = format!(
            "SELECT id, state, timestamp FROM {} WHERE state IN ({}) ORDER BY timestamp ASC",
            self.table,
            states.join(", ")
        );
        self.db.watch(&sql, &[])
    }
}

/// Wall-clock milliseconds used for every `timestamp` stamp.
fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parameter list matching the upsert column order.
fn attachment_params(attachment: &Attachment) -> [SqlValue; 9] {
    [
        SqlValue::from(attachment.id.clone()),
        SqlValue::from(attachment.filename.clone()),
        SqlValue::from(attachment.media_type.clone()),
        SqlValue::from(attachment.state.as_str()),
        SqlValue::from(attachment.timestamp),
        SqlValue::from(attachment.size),
        SqlValue::from(attachment.has_synced),
        SqlValue::from(attachment.meta_data.clone()),
        SqlValue::from(attachment.local_uri.clone()),
    ]
}

/// Convert a result row to an [`Attachment`].
fn attachment_from_row(row: &SqlRow) -> Result<Attachment> {
    let state_str = row.text("state")?;
    let state = AttachmentState::parse(state_str)
        .ok_or_else(|| Error::Database(format!("unknown attachment state '{state_str}'")))?;
    Ok(Attachment {
        id: row.text("id")?.to_string(),
        filename: row.text("filename")?.to_string(),
        media_type: row.opt_text("media_type")?,
        state,
        timestamp: row.integer("timestamp")?,
        size: row.opt_integer("size")?,
        has_synced: row.boolean("has_synced")?,
        meta_data: row.opt_text("meta_data")?,
        local_uri: row.opt_text("local_uri")?,
    })
}
