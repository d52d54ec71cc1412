use std::path::{Path, PathBuf};

use prost::Message;

use crate::error::DlmError;
use crate::fs_utils::{atomic_replace, atomic_write};

/// Suffix of the side-car file that travels next to the destination.
const TEMP_SUFFIX: &str = ".tmp";
/// Suffix of the staging file the side-car is renamed from.
const STAGING_SUFFIX: &str = ".tmp1";

/// Durable record of which chunks of the destination file are already on
/// disk. Serialized as a length-delimited protobuf message into the
/// side-car; a run that finds a well-formed side-car resumes from it,
/// anything else starts fresh.
///
/// Only the writer mutates a `Metadata`; range workers get a read-only
/// bitmap snapshot taken before they start.
#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(uint64, tag = "1")]
    pub(crate) chunk_count: u64,
    #[prost(uint64, tag = "2")]
    pub(crate) chunks_done: u64,
    #[prost(bool, repeated, tag = "3")]
    pub(crate) bitmap: Vec<bool>,
}

impl Metadata {
    pub fn new(chunk_count: u64) -> Self {
        Self {
            chunk_count,
            chunks_done: 0,
            bitmap: vec![false; chunk_count as usize],
        }
    }

    /// Load the side-car next to `dest`, falling back to a fresh record when
    /// there is none, when it does not decode, or when it disagrees with the
    /// expected chunk count (the file changed, or the constants did).
    pub async fn load_or_new(dest: &Path, chunk_count: u64) -> Self {
        Self::recover_staging(dest).await;

        match tokio::fs::read(sidecar_path(dest)).await {
            Ok(buf) => match Metadata::decode_length_delimited(&*buf) {
                Ok(meta) if meta.is_well_formed() && meta.chunk_count == chunk_count => meta,
                Ok(_) => {
                    tracing::warn!("Metadata file does not match this download. Starting over.");
                    Self::new(chunk_count)
                }
                Err(e) => {
                    tracing::warn!("Could not decode the metadata file ({e}). Starting over.");
                    Self::new(chunk_count)
                }
            },
            Err(_) => Self::new(chunk_count),
        }
    }

    /// Promote a complete staging file left behind by an interrupted rename,
    /// and clear out a garbled one. Best-effort either way.
    async fn recover_staging(dest: &Path) {
        let staging = staging_path(dest);
        match tokio::fs::read(&staging).await {
            Ok(buf) => {
                if Metadata::decode_length_delimited(&*buf).is_ok() {
                    if let Err(e) = atomic_replace(staging, sidecar_path(dest)).await {
                        tracing::warn!("Failed to promote staged metadata: {e}");
                    }
                } else if let Err(e) = tokio::fs::remove_file(&staging).await {
                    tracing::warn!("Failed to remove stale staged metadata: {e}");
                }
            }
            Err(_) => {}
        }
    }

    fn is_well_formed(&self) -> bool {
        self.bitmap.len() as u64 == self.chunk_count
            && self.bitmap.iter().filter(|b| **b).count() as u64 == self.chunks_done
    }

    /// Record chunk `index` as durably written. Must be called at most once
    /// per index.
    pub fn mark(&mut self, index: u64) {
        debug_assert!(!self.bitmap[index as usize]);
        self.bitmap[index as usize] = true;
        self.chunks_done += 1;
    }

    /// Read-only copy of the bitmap for publication to the range workers.
    pub fn snapshot_bitmap(&self) -> Vec<bool> {
        self.bitmap.clone()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn chunks_to_fetch(&self) -> u64 {
        self.chunk_count - self.chunks_done
    }

    /// Integer percentage of completed chunks. Truncates after float
    /// division, so 2 of 3 chunks reports 66.
    pub fn percent(&self) -> u32 {
        (self.chunks_done as f32 / self.chunk_count as f32 * 100.0) as u32
    }

    /// Write-through to the side-car: encode into the staging file, then
    /// atomically rename it over the side-car.
    pub async fn persist(&self, dest: &Path) -> std::io::Result<()> {
        let encoded = self.encode_length_delimited_to_vec();
        atomic_write(sidecar_path(dest), staging_path(dest), &encoded).await
    }

    /// Delete the side-car after a completed run. Failing to delete it is an
    /// error: a stale side-car would make the next run of the same URL
    /// believe the file is still partial.
    pub async fn remove(dest: &Path) -> Result<(), DlmError> {
        let path = sidecar_path(dest);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| DlmError::Cleanup { path, e })
    }
}

pub fn sidecar_path(dest: &Path) -> PathBuf {
    suffixed(dest, TEMP_SUFFIX)
}

fn staging_path(dest: &Path) -> PathBuf {
    suffixed(dest, STAGING_SUFFIX)
}

fn suffixed(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
