//! Content files for cached entries

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake2::{Blake2s256, Digest};

/// File-based content storage, one file per cache key
///
/// File names are a BLAKE2 hash of the key, so rewriting a key always
/// lands on the same file. Directory structure:
/// ```text
/// blobs/
///   3f/
///     3f9a...c1.blob
///   a0/
///     a07e...44.blob
/// ```
pub struct FileBlobStore {
    root: PathBuf,
}

/// Content written to a temp file, waiting to be moved into place
#[derive(Debug)]
pub struct StagedBlob {
    temp_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

impl StagedBlob {
    /// Bytes written
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Atomically replace the content file
    pub fn commit(&self) -> Result<()> {
        fs::rename(&self.temp_path, &self.final_path).with_context(|| {
            format!("Failed to move blob into place: {}", self.final_path.display())
        })
    }

    /// Drop the temp file (after a failed index update)
    pub fn discard(&self) {
        if self.temp_path.exists() {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                log::warn!("[CACHE] Failed to remove temp blob {:?}: {}", self.temp_path, e);
            }
        }
    }
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self { root })
    }

    /// Content-addressed file name for a key
    pub fn file_name_for(key: &str) -> String {
        let digest = Blake2s256::digest(key.as_bytes());
        format!("{}.blob", hex::encode(digest))
    }

    /// Shard directory (first 2 chars of the hash)
    fn shard(file_name: &str) -> &str {
        if file_name.len() >= 2 {
            &file_name[..2]
        } else {
            "xx"
        }
    }

    /// Full path for a content file name
    pub fn blob_path(&self, file_name: &str) -> PathBuf {
        self.root.join(Self::shard(file_name)).join(file_name)
    }

    /// Write content next to its final location without replacing it yet
    pub fn stage(&self, file_name: &str, data: &[u8]) -> Result<StagedBlob> {
        let final_path = self.blob_path(file_name);

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Unique temp name so concurrent writers of one key never share it
        let temp_path = final_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, data)
            .with_context(|| format!("Failed to write blob: {}", temp_path.display()))?;

        Ok(StagedBlob {
            temp_path,
            final_path,
            size: data.len() as u64,
        })
    }

    /// Read content, None if the file does not exist
    pub fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(file_name);

        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)
            .with_context(|| format!("Failed to read blob: {}", path.display()))?;
        Ok(Some(data))
    }

    #[cfg(test)]
    pub fn exists(&self, file_name: &str) -> bool {
        self.blob_path(file_name).exists()
    }

    pub fn delete(&self, file_name: &str) -> Result<()> {
        let path = self.blob_path(file_name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Delete a content file, logging instead of failing
    pub fn delete_quietly(&self, file_name: &str) {
        if let Err(e) = self.delete(file_name) {
            log::warn!("[CACHE] Failed to delete blob {}: {}", file_name, e);
        }
    }

    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }
}
