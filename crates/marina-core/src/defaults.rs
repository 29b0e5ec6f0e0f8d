//! Centralized default constants for the marina attachment queue.
//!
//! **This module is the single source of truth** for shared default values.
//! Other crates reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// SYNC SCHEDULING
// =============================================================================

/// Periodic retry period for the sync worker, in milliseconds. `0` disables
/// periodic retry, leaving only reactive triggers.
pub const SYNC_INTERVAL_MS: u64 = 30_000;

// =============================================================================
// ARCHIVE CACHE
// =============================================================================

/// Maximum number of `archived` rows retained before the oldest are evicted.
pub const ARCHIVED_CACHE_LIMIT: u64 = 100;

// =============================================================================
// STORAGE
// =============================================================================

/// Default name of the attachment state table.
pub const ATTACHMENTS_TABLE_NAME: &str = "attachments";

/// Whether missing referenced attachments are scheduled for download.
pub const DOWNLOAD_ATTACHMENTS: bool = true;

/// Chunk size for streaming file reads, in bytes.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// CHANNELS
// =============================================================================

/// Capacity of the queue event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the worker trigger channel. Triggers coalesce, so a small
/// buffer is sufficient.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 8;
