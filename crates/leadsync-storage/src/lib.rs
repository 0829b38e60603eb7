//! Attachment staging + lead/run-log persistence for partner lead sync.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

mod leads;
mod memory;
mod postgres;

pub use leads::{
    DuplicateGroup, LeadPage, LeadQuery, LeadStats, LeadStore, LeadWrite, Pagination, PurgeCounts,
    StatusCount, StoreError, StoreResult,
};
pub use memory::MemoryLeadStore;
pub use postgres::{PgLeadStore, MIGRATOR};

pub const CRATE_NAME: &str = "leadsync-storage";

/// An attachment written to the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub original_name: String,
    pub staged_name: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `{base}_{token}{.ext}` for an attachment name, with any directory part dropped.
    pub fn staged_file_name(original_name: &str, token: &str) -> String {
        let leaf = original_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .replace(':', "_");
        let leaf = Path::new(&leaf);
        let base = leaf
            .file_stem()
            .map(|s| s.to_string_lossy().trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "attachment".to_string());
        let ext = leaf
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        format!("{base}_{token}{ext}")
    }

    /// Write an attachment under a collision-resistant name via temp file + atomic rename.
    pub async fn stage_bytes(&self, original_name: &str, bytes: &[u8]) -> anyhow::Result<StagedFile> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating staging directory {}", self.root.display()))?;

        let token = Uuid::new_v4().simple().to_string();
        let staged_name = Self::staged_file_name(original_name, &token);
        let path = self.root.join(&staged_name);
        let temp_path = self.root.join(format!(".{token}.{}.tmp", bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp staging file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp staging file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp staging file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp staging file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(original_name, staged = %path.display(), bytes = bytes.len(), "staged attachment");
        Ok(StagedFile {
            original_name: original_name.to_string(),
            staged_name,
            path,
            byte_size: bytes.len(),
            content_hash: Self::sha256_hex(bytes),
        })
    }

    /// Confirm a staged file is on disk with the expected size and content hash.
    pub async fn verify(&self, staged: &StagedFile) -> anyhow::Result<()> {
        let bytes = fs::read(&staged.path)
            .await
            .with_context(|| format!("reading back staged file {}", staged.path.display()))?;
        if bytes.len() != staged.byte_size {
            anyhow::bail!(
                "staged file {} has {} bytes, expected {}",
                staged.path.display(),
                bytes.len(),
                staged.byte_size
            );
        }
        let hash = Self::sha256_hex(&bytes);
        if hash != staged.content_hash {
            anyhow::bail!("staged file {} content hash mismatch", staged.path.display());
        }
        Ok(())
    }

    pub async fn remove(&self, path: &Path) -> anyhow::Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("deleting staged file {}", path.display()))?;
        info!(path = %path.display(), "deleted staged file");
        Ok(())
    }
}
