//! # marina-core
//!
//! Core types, traits, and abstractions for the marina sync library.
//!
//! This crate provides the foundational data structures and adapter
//! interfaces that the attachment queue is written against: the attachment
//! data model, the error taxonomy, and the consumed database / remote
//! storage seams.

pub mod defaults;
pub mod error;
pub mod models;
pub mod sql;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, LocalIoErrorKind, RemoteErrorKind, Result};
pub use models::{Attachment, AttachmentState, WatchedAttachmentItem};
pub use sql::{SqlRow, SqlValue};
pub use traits::{
    ByteStream, DatabaseAdapter, DatabaseTransaction, RemoteStorageAdapter, RetryAlways,
    SyncErrorHandler, WatchedAttachmentStream,
};
