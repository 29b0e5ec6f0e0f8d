//! Data model for the attachment queue.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an attachment row.
///
/// The queued states are work items for the sync worker; `Synced` and
/// `Archived` are resting states. Archived rows are retained for possible
/// restore until evicted by the archive cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    /// A local file exists and must be uploaded to remote storage.
    QueuedUpload,
    /// A referenced attachment has no local file and must be downloaded.
    QueuedDownload,
    /// The attachment must be removed remotely and locally.
    QueuedDelete,
    /// Local file and remote object both exist.
    Synced,
    /// No longer referenced; retained subject to the cache limit.
    Archived,
}

impl AttachmentState {
    /// Stable string encoding used in the state table.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::QueuedUpload => "queued_upload",
            AttachmentState::QueuedDownload => "queued_download",
            AttachmentState::QueuedDelete => "queued_delete",
            AttachmentState::Synced => "synced",
            AttachmentState::Archived => "archived",
        }
    }

    /// Parse the database encoding. Returns `None` for unknown values so
    /// callers can surface corruption instead of guessing.
    pub fn parse(s: &str) -> Option<AttachmentState> {
        match s {
            "queued_upload" => Some(AttachmentState::QueuedUpload),
            "queued_download" => Some(AttachmentState::QueuedDownload),
            "queued_delete" => Some(AttachmentState::QueuedDelete),
            "synced" => Some(AttachmentState::Synced),
            "archived" => Some(AttachmentState::Archived),
            _ => None,
        }
    }

    /// The three states the sync worker drains.
    pub const QUEUED: [AttachmentState; 3] = [
        AttachmentState::QueuedUpload,
        AttachmentState::QueuedDownload,
        AttachmentState::QueuedDelete,
    ];
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record in the attachment state table.
///
/// Attachments are immutable once created: the payload behind an id never
/// changes, only the row's lifecycle state does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Opaque unique id; externally chosen or generated on save.
    pub id: String,
    /// Derived storage filename, typically `{id}.{extension}`.
    pub filename: String,
    /// Current lifecycle state.
    pub state: AttachmentState,
    /// Wall-clock ms of the last transition. Stamped by the repository on
    /// every mutation; drives cache eviction order.
    pub timestamp: i64,
    /// Sticky flag: true once the record has ever reached `Synced`.
    pub has_synced: bool,
    /// MIME type, when known.
    pub media_type: Option<String>,
    /// Size in bytes, populated once known locally.
    pub size: Option<i64>,
    /// Opaque application metadata (JSON by convention).
    pub meta_data: Option<String>,
    /// Local path for a pending upload; not required after `Synced`.
    pub local_uri: Option<String>,
}

impl Attachment {
    /// Create a new attachment record in the given state.
    pub fn new(id: impl Into<String>, filename: impl Into<String>, state: AttachmentState) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            state,
            timestamp: 0,
            has_synced: false,
            media_type: None,
            size: None,
            meta_data: None,
            local_uri: None,
        }
    }

    /// Copy of this record transitioned to `state`. Reaching `Synced` sets
    /// the sticky `has_synced` flag.
    pub fn with_state(&self, state: AttachmentState) -> Self {
        let mut next = self.clone();
        next.state = state;
        if state == AttachmentState::Synced {
            next.has_synced = true;
        }
        next
    }

    /// File extension, derived from the filename.
    pub fn extension(&self) -> Option<&str> {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

/// Transient record emitted by the reactive watcher.
///
/// Means "this attachment should exist and be fetched if missing". The set
/// of ids in the most recent emission defines which attachments are
/// referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAttachmentItem {
    /// Attachment id referenced by the application's relational data.
    pub id: String,
    /// Extension used to derive the storage filename.
    pub file_extension: Option<String>,
    /// MIME type, when the application knows it.
    pub media_type: Option<String>,
}

impl WatchedAttachmentItem {
    /// Create an item with just an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_extension: None,
            media_type: None,
        }
    }

    /// Set the file extension.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }

    /// Set the media type.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Storage filename derived as `{id}.{extension}`, or bare `{id}` when
    /// no extension was supplied.
    pub fn filename(&self) -> String {
        match &self.file_extension {
            Some(ext) => format!("{}.{}", self.id, ext),
            None => self.id.clone(),
        }
    }
}
