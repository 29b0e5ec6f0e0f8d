//! Schema contribution for the attachment state table.
//!
//! The queue owns one local-only table. The host application includes the
//! statements from [`AttachmentTable::create_statements`] in its own schema
//! setup; the table name is configurable so multiple queues can coexist.

use marina_core::defaults;

/// Factory for the attachment state table definition.
#[derive(Debug, Clone)]
pub struct AttachmentTable {
    name: String,
}

impl Default for AttachmentTable {
    fn default() -> Self {
        Self::new(defaults::ATTACHMENTS_TABLE_NAME)
    }
}

impl AttachmentTable {
    /// Create a table definition with a custom name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The configured table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DDL statements for the table and its indexes, idempotent under
    /// re-execution.
    pub fn create_statements(&self) -> Vec<String> {
        vec![
            format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    filename TEXT NOT NULL,
                    media_type TEXT,
                    state TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    size INTEGER,
                    has_synced INTEGER NOT NULL DEFAULT 0,
                    meta_data TEXT,
                    local_uri TEXT
                )"#,
                self.name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_state ON {0} (state)",
                self.name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_state_timestamp ON {0} (state, timestamp)",
                self.name
            ),
        ]
    }
}
