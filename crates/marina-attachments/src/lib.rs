//! # marina-attachments
//!
//! Durable, reactive attachment synchronization queue for the marina sync
//! library.
//!
//! This crate provides:
//! - A per-attachment state machine (`queued_upload`, `queued_download`,
//!   `queued_delete`, `synced`, `archived`) persisted in a local-only table
//! - A reconciler that diffs the application's referenced-attachment set
//!   against stored state in one transaction
//! - A sync worker with bounded parallelism, per-id in-flight guards, and
//!   pluggable retry policy
//! - A bounded archive cache so briefly de-referenced files survive without
//!   unbounded growth
//!
//! ## Example
//!
//! ```rust,ignore
//! use marina_attachments::{AttachmentQueue, SaveFileRequest};
//!
//! let queue = AttachmentQueue::builder(db, remote, "/data/attachments")
//!     .with_watch_stream(move || watch_photo_attachments(&db))
//!     .with_archived_cache_limit(50)
//!     .build()?;
//!
//! queue.start().await?;
//!
//! let attachment = queue
//!     .save_file(photo_bytes, SaveFileRequest::default().with_file_extension("jpg"))
//!     .await?;
//! println!("queued {}", attachment.id);
//! ```

pub mod cache;
pub mod local_store;
pub mod queue;
pub mod reconciler;
pub mod repository;
pub mod schema;
mod watcher;
pub mod worker;

// Re-export core types
pub use marina_core::*;

// Re-export the public queue surface
pub use cache::ArchiveCache;
pub use local_store::LocalFileStore;
pub use queue::{
    AttachmentQueue, AttachmentQueueBuilder, QueueConfig, SaveFileRequest, WatchStreamFactory,
};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use repository::{transaction_callback, AttachmentRepository, TransactionCallback};
pub use schema::AttachmentTable;
pub use worker::{SyncEvent, SyncPhase};
