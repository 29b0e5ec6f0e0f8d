//! Shared test fixtures for the attachment queue integration tests.
//!
//! Provides a real-SQLite [`DatabaseAdapter`] (in-memory, change-notifying),
//! an in-memory remote storage mock with scripted failures, and a
//! referenced-attachment feed the tests drive by hand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use marina_attachments::{
    AttachmentQueue, AttachmentQueueBuilder, AttachmentRepository, AttachmentTable,
    WatchStreamFactory,
};
use marina_core::{
    Attachment, AttachmentState, ByteStream, DatabaseAdapter, DatabaseTransaction, Error,
    RemoteErrorKind, Result, SqlRow, SqlValue, WatchedAttachmentItem,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};

// =============================================================================
// SQLITE DATABASE ADAPTER
// =============================================================================

/// In-memory SQLite implementation of the consumed database adapter.
///
/// Every mutation (adapter-level execute or committed transaction) notifies
/// watchers, which re-run their query and emit the fresh result set.
pub struct TestDatabase {
    conn: Arc<AsyncMutex<Connection>>,
    change_tx: broadcast::Sender<()>,
}

impl TestDatabase {
    /// Open an in-memory database with the attachment table installed.
    pub fn new(table: &AttachmentTable) -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory sqlite");
        for statement in table.create_statements() {
            conn.execute(&statement, []).expect("create schema");
        }
        let (change_tx, _) = broadcast::channel(64);
        Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            change_tx,
        }
    }

    /// Create an application-side table for transaction-callback tests.
    pub async fn install_table(&self, ddl: &str) {
        let conn = self.conn.lock().await;
        conn.execute(ddl, []).expect("install table");
    }

    /// Count rows in an arbitrary table (callback test support).
    pub async fn count_rows(&self, table: &str) -> i64 {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count rows")
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn to_sql_param(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter().map(to_sql_param)))
        .map_err(db_err)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let mut columns = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let value = row.get_ref(index).map_err(db_err)?;
            columns.push((name.clone(), from_sql_ref(value)));
        }
        out.push(SqlRow::new(columns));
    }
    Ok(out)
}

fn execute_sql(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<u64> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let affected = stmt
        .execute(rusqlite::params_from_iter(params.iter().map(to_sql_param)))
        .map_err(db_err)?;
    Ok(affected as u64)
}

#[async_trait]
impl DatabaseAdapter for TestDatabase {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let affected = {
            let conn = self.conn.lock().await;
            execute_sql(&conn, sql, params)?
        };
        let _ = self.change_tx.send(());
        Ok(affected)
    }

    async fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        let conn = self.conn.lock().await;
        Ok(query_rows(&conn, sql, params)?.into_iter().next())
    }

    async fn get_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let conn = self.conn.lock().await;
        query_rows(&conn, sql, params)
    }

    async fn begin_write(&self) -> Result<Box<dyn DatabaseTransaction>> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;
        Ok(Box::new(TestTransaction {
            conn,
            change_tx: self.change_tx.clone(),
            finished: false,
        }))
    }

    fn watch(&self, sql: &str, params: &[SqlValue]) -> BoxStream<'static, Result<Vec<SqlRow>>> {
        let conn = self.conn.clone();
        let rx = self.change_tx.subscribe();
        let sql = sql.to_string();
        let params = params.to_vec();

        Box::pin(futures::stream::unfold(
            (conn, rx, sql, params, true),
            |(conn, mut rx, sql, params, first)| async move {
                if !first {
                    loop {
                        match rx.recv().await {
                            Ok(()) => break,
                            // Coalesce missed notifications into one re-query.
                            Err(broadcast::error::RecvError::Lagged(_)) => break,
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
                let result = {
                    let guard = conn.lock().await;
                    query_rows(&guard, &sql, &params)
                };
                Some((result, (conn, rx, sql, params, false)))
            },
        ))
    }
}

/// An open transaction holding the (single) connection exclusively.
struct TestTransaction {
    conn: OwnedMutexGuard<Connection>,
    change_tx: broadcast::Sender<()>,
    finished: bool,
}

#[async_trait]
impl DatabaseTransaction for TestTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        execute_sql(&self.conn, sql, params)
    }

    async fn get(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(query_rows(&self.conn, sql, params)?.into_iter().next())
    }

    async fn get_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        query_rows(&self.conn, sql, params)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(db_err)?;
        self.finished = true;
        let _ = self.change_tx.send(());
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("ROLLBACK").map_err(db_err)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TestTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

// =============================================================================
// MOCK REMOTE STORAGE
// =============================================================================

/// In-memory remote storage with scripted failures and call counters.
#[derive(Default)]
pub struct MockRemoteStorage {
    objects: StdMutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicUsize,
    fail_downloads: AtomicUsize,
    fail_deletes: AtomicUsize,
    upload_calls: AtomicUsize,
    download_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MockRemoteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a remote object directly (for download scenarios).
    pub fn put_object(&self, filename: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(filename.to_string(), data);
    }

    pub fn object(&self, filename: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(filename).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Fail the next `n` uploads with a transport error.
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_downloads(&self, n: usize) {
        self.fail_downloads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.fail_deletes.store(n, Ordering::SeqCst);
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl marina_core::RemoteStorageAdapter for MockRemoteStorage {
    async fn upload_file(&self, mut data: ByteStream, attachment: &Attachment) -> Result<()> {
        use futures::StreamExt;

        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_uploads) {
            return Err(Error::remote_transport("injected upload failure"));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = data.next().await {
            bytes.extend(chunk?);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(attachment.filename.clone(), bytes);
        Ok(())
    }

    async fn download_file(&self, attachment: &Attachment) -> Result<ByteStream> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_downloads) {
            return Err(Error::remote_transport("injected download failure"));
        }

        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&attachment.filename)
            .cloned()
            .ok_or_else(|| Error::Remote {
                kind: RemoteErrorKind::NotFound,
                message: format!("no remote object {}", attachment.filename),
            })?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(data)])))
    }

    async fn delete_file(&self, attachment: &Attachment) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_deletes) {
            return Err(Error::remote_transport("injected delete failure"));
        }

        // Missing object is success.
        self.objects.lock().unwrap().remove(&attachment.filename);
        Ok(())
    }
}

/// Error handler with a fixed verdict per operation class.
///
/// `true` retries (the default policy), `false` gives up.
pub struct ScriptedErrorHandler {
    pub retry_uploads: bool,
    pub retry_downloads: bool,
    pub retry_deletes: bool,
}

impl Default for ScriptedErrorHandler {
    fn default() -> Self {
        Self {
            retry_uploads: true,
            retry_downloads: true,
            retry_deletes: true,
        }
    }
}

#[async_trait]
impl marina_core::SyncErrorHandler for ScriptedErrorHandler {
    async fn on_upload_error(&self, _attachment: &Attachment, _error: &Error) -> bool {
        self.retry_uploads
    }

    async fn on_download_error(&self, _attachment: &Attachment, _error: &Error) -> bool {
        self.retry_downloads
    }

    async fn on_delete_error(&self, _attachment: &Attachment, _error: &Error) -> bool {
        self.retry_deletes
    }
}

// =============================================================================
// WATCH FEED
// =============================================================================

/// Hand-driven referenced-attachment feed.
///
/// Each `factory()` subscription gets the emissions sent after it was
/// created, mirroring a reactive query that emits on change.
#[derive(Clone)]
pub struct WatchFeed {
    tx: broadcast::Sender<Vec<WatchedAttachmentItem>>,
}

impl Default for WatchFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Emit the complete current referenced set.
    pub fn emit(&self, items: Vec<WatchedAttachmentItem>) {
        let _ = self.tx.send(items);
    }

    /// Stream factory for the queue builder.
    pub fn factory(&self) -> WatchStreamFactory {
        let tx = self.tx.clone();
        Box::new(move || {
            let rx = tx.subscribe();
            Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(items) => return Some((items, rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }))
        })
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// Everything a queue test needs, wired together.
pub struct TestHarness {
    pub db: Arc<TestDatabase>,
    pub remote: Arc<MockRemoteStorage>,
    pub feed: WatchFeed,
    pub repository: AttachmentRepository,
    pub dir: tempfile::TempDir,
    pub queue: AttachmentQueue,
}

impl TestHarness {
    /// Build a harness with reactive-only syncing (no periodic tick) and
    /// any further builder tweaks from `configure`. The queue is not
    /// started.
    pub async fn new(
        configure: impl FnOnce(AttachmentQueueBuilder) -> AttachmentQueueBuilder,
    ) -> Self {
        let db = Arc::new(TestDatabase::new(&AttachmentTable::default()));
        let remote = Arc::new(MockRemoteStorage::new());
        let feed = WatchFeed::new();
        let dir = tempfile::tempdir().expect("tempdir");

        let builder = AttachmentQueue::builder(
            db.clone() as Arc<dyn DatabaseAdapter>,
            remote.clone() as Arc<dyn marina_core::RemoteStorageAdapter>,
            dir.path(),
        )
        .with_watch_stream(feed.factory())
        .with_sync_interval_ms(0);

        let queue = configure(builder).build().expect("build queue");
        let repository =
            AttachmentRepository::new(db.clone() as Arc<dyn DatabaseAdapter>, "attachments");

        Self {
            db,
            remote,
            feed,
            repository,
            dir,
            queue,
        }
    }

    /// Build and start a default harness.
    pub async fn started() -> Self {
        let harness = Self::new(|builder| builder).await;
        harness.queue.start().await.expect("start queue");
        harness
    }

    /// Path of a stored filename inside the managed directory.
    pub fn path(&self, filename: &str) -> PathBuf {
        self.dir.path().join(filename)
    }

    pub fn file_exists(&self, filename: &str) -> bool {
        self.path(filename).exists()
    }

    pub fn file_contents(&self, filename: &str) -> Vec<u8> {
        std::fs::read(self.path(filename)).expect("read stored file")
    }

    /// Poll until the row for `id` reaches `state`.
    pub async fn wait_for_state(&self, id: &str, state: AttachmentState) -> Attachment {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(att) = self.repository.get(id).await.expect("repository get") {
                if att.state == state {
                    return att;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("attachment {id} did not reach {state} in time");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the row for `id` is gone.
    pub async fn wait_for_absent(&self, id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.repository.get(id).await.expect("repository get").is_none() {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("attachment {id} was not deleted in time");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `condition` over all rows holds.
    pub async fn wait_for_rows(&self, condition: impl Fn(&[Attachment]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rows = self.repository.get_all().await.expect("repository get_all");
            if condition(&rows) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("row condition not met in time; rows: {rows:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// One-chunk byte stream.
pub fn byte_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok(data)]))
}

/// Multi-chunk byte stream, to exercise streaming paths.
pub fn chunked_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}
