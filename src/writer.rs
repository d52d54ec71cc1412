use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::chunk::DataChunk;
use crate::error::DlmError;
use crate::metadata::Metadata;

/// The single consumer of the chunk queue. Owns the output file and the
/// metadata: every chunk is written at its offset, recorded in the bitmap
/// and flushed through to the side-car before the next one is taken.
pub(crate) struct FileWriter {
    file: tokio::fs::File,
    metadata: Metadata,
    dest: PathBuf,
    chunk_wait_timeout: Duration,
}

impl FileWriter {
    /// Opens (or creates) the destination file. Never truncates: on resume
    /// the already-written chunks must survive.
    pub(crate) async fn create(
        dest: PathBuf,
        metadata: Metadata,
        chunk_wait_timeout: Duration,
    ) -> Result<Self, DlmError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&dest)
            .await?;
        Ok(Self {
            file,
            metadata,
            dest,
            chunk_wait_timeout,
        })
    }

    /// Drain exactly as many chunks as the bitmap says are missing. The
    /// iteration count is fixed here, before any producer runs.
    pub(crate) async fn run(mut self, rx: async_channel::Receiver<DataChunk>) -> Result<(), DlmError> {
        let chunks_left = self.metadata.chunks_to_fetch();

        for _ in 0..chunks_left {
            let chunk = match tokio::time::timeout(self.chunk_wait_timeout, rx.recv()).await {
                Err(_) => return Err(DlmError::ChunkWaitTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(chunk)) => chunk,
            };
            self.write(chunk).await?;
        }

        Ok(())
    }

    async fn write(&mut self, chunk: DataChunk) -> Result<(), DlmError> {
        let previous_percent = self.metadata.percent();

        self.file.seek(SeekFrom::Start(chunk.offset())).await?;
        self.file.write_all(chunk.data()).await?;

        self.metadata.mark(chunk.index());

        // A failed side-car update is retried by the next chunk's persist;
        // the bytes themselves are already on disk.
        if let Err(e) = self.metadata.persist(&self.dest).await {
            tracing::warn!("Failed to persist metadata: {e}");
        }

        let current_percent = self.metadata.percent();
        if current_percent > previous_percent {
            println!("Downloaded {current_percent}%");
        }

        Ok(())
    }
}
