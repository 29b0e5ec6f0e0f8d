//! Local file store for attachment payloads.
//!
//! Confines all attachment I/O to a single managed directory. Writes are
//! streamed and atomic (write to a `.tmp` sibling, fsync, rename), so a
//! crashed or cancelled transfer leaves at worst an orphaned temp file that
//! [`LocalFileStore::collect_garbage`] removes on the next start.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use marina_core::{defaults, ByteStream, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Suffix used for in-progress writes.
const TMP_SUFFIX: &str = ".tmp";

/// File store rooted at a managed attachments directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    directory: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `directory`. The directory is created on
    /// first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The managed directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Derive the storage filename for an attachment id.
    pub fn filename(id: &str, extension: Option<&str>) -> String {
        match extension {
            Some(ext) => format!("{id}.{ext}"),
            None => id.to_string(),
        }
    }

    /// Absolute path of a stored filename.
    pub fn path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    /// Stream `data` into `{id}.{extension}`, returning the final path and
    /// the number of bytes written.
    pub async fn write(
        &self,
        id: &str,
        extension: Option<&str>,
        mut data: ByteStream,
    ) -> Result<(PathBuf, u64)> {
        let filename = Self::filename(id, extension);
        let final_path = self.path(&filename);
        let temp_path = self.path(&format!("{filename}{TMP_SUFFIX}"));

        fs::create_dir_all(&self.directory).await.map_err(|e| {
            warn!(directory = %self.directory.display(), error = %e, "local_store: create_dir_all failed");
            marina_core::Error::from(e)
        })?;

        let result = self.write_stream(&temp_path, &mut data).await;
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                // Drop the partial temp file; the error wins.
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        fs::rename(&temp_path, &final_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %final_path.display(), error = %e, "local_store: rename failed");
            marina_core::Error::from(e)
        })?;

        debug!(path = %final_path.display(), size, "local_store: write");
        Ok((final_path, size))
    }

    async fn write_stream(&self, temp_path: &Path, data: &mut ByteStream) -> Result<u64> {
        let mut file = fs::File::create(temp_path).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(size)
    }

    /// Lazily read a stored file as a chunked byte stream.
    pub async fn read(&self, path: &Path) -> Result<ByteStream> {
        let file = fs::File::open(path).await?;
        let stream = futures::stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; defaults::FILE_CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), Some(file)))
                }
                Err(e) => Some((Err(e.into()), None)),
            }
        });
        Ok(Box::pin(stream))
    }

    /// Delete a stored file. A missing file is not an error.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a stored file exists.
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }

    /// Size of a stored file in bytes.
    pub async fn size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    /// Remove temp-file orphans and files not referenced by any row.
    ///
    /// `keep` is the set of filenames owned by current attachment rows.
    /// Returns the number of files removed.
    pub async fn collect_garbage(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            // Nothing stored yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) || !keep.contains(&name) {
                debug!(file = %name, "local_store: removing orphan");
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "local_store: garbage collection complete");
        }
        Ok(removed)
    }

    /// Delete every file in the managed directory.
    pub async fn remove_all(&self) -> Result<usize> {
        self.collect_garbage(&HashSet::new()).await
    }
}
