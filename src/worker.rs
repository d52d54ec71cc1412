use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use reqwest::header::RANGE;
use reqwest::{Client, Url};

use crate::chunk::DataChunk;
use crate::error::DlmError;

/// Downloads one contiguous byte range of the file over a single ranged GET
/// and feeds it, chunk by chunk, into the shared queue.
///
/// Chunks already present in the bitmap snapshot are consumed from the
/// stream and discarded rather than excluded from the Range header: prefix
/// trimming only ever shortens the front of a range, so interior holes left
/// by an earlier run with a different worker count still arrive on the wire
/// and must be skipped to keep the stream aligned with the chunk grid.
pub(crate) struct RangeWorker {
    pub(crate) id: usize,
    pub(crate) url: Url,
    /// Inclusive byte range this worker is responsible for.
    pub(crate) range_start: u64,
    pub(crate) range_end: u64,
    /// Number of chunks inside the range, counting skipped ones.
    pub(crate) chunks: u64,
    pub(crate) is_last: bool,
    pub(crate) chunk_size: u64,
    pub(crate) bitmap: Arc<Vec<bool>>,
    pub(crate) client: Client,
    pub(crate) tx: async_channel::Sender<DataChunk>,
}

impl RangeWorker {
    pub(crate) async fn run(self) -> Result<(), DlmError> {
        // A resumed run may have trimmed this worker's whole range away.
        if self.range_start >= self.range_end {
            println!("[{}] Finished. This range was already covered.", self.id);
            return Ok(());
        }

        println!(
            "[{}] Start downloading range ({} - {}) from:\n{}",
            self.id, self.range_start, self.range_end, self.url
        );

        let resp = self
            .client
            .get(self.url.clone())
            .header(
                RANGE,
                format!("bytes={}-{}", self.range_start, self.range_end),
            )
            .send()
            .await?
            .error_for_status()?;

        let mut body = BodyReader::new(resp);
        let start_idx = self.range_start / self.chunk_size;
        let end_idx = start_idx + self.chunks;

        for i in start_idx..end_idx {
            let file_offset = i * self.chunk_size;
            let this_chunk_size = if self.is_last && i == end_idx - 1 {
                // The file's final chunk is whatever is left of the range.
                (self.range_end + 1) - file_offset
            } else {
                self.chunk_size
            };

            if self.bitmap[i as usize] {
                body.discard(this_chunk_size).await?;
                continue;
            }

            let data = body.read_exact(this_chunk_size).await?;
            self.tx
                .send(DataChunk::new(data, file_offset, i))
                .await
                .map_err(|_| DlmError::ChannelClosed)?;
        }

        println!("[{}] Finished downloading", self.id);
        Ok(())
    }
}

/// Adapts the response body's arbitrary network framing to the exact-size
/// reads the chunk grid needs.
struct BodyReader {
    resp: reqwest::Response,
    pending: Bytes,
}

impl BodyReader {
    fn new(resp: reqwest::Response) -> Self {
        Self {
            resp,
            pending: Bytes::new(),
        }
    }

    /// Pull the next frame off the wire. Returns false on end of stream.
    async fn refill(&mut self) -> Result<bool, DlmError> {
        match self.resp.chunk().await? {
            Some(frame) => {
                self.pending = frame;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read exactly `n` bytes, looping over as many network reads as it
    /// takes. EOF before the buffer fills is a short read.
    async fn read_exact(&mut self, n: u64) -> Result<Bytes, DlmError> {
        let n = n as usize;
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            if self.pending.is_empty() && !self.refill().await? {
                return Err(DlmError::ShortRead {
                    missing: (n - buf.len()) as u64,
                });
            }
            let take = (n - buf.len()).min(self.pending.len());
            buf.extend_from_slice(&self.pending.split_to(take));
        }
        Ok(buf.freeze())
    }

    /// Consume and drop exactly `n` bytes.
    async fn discard(&mut self, n: u64) -> Result<(), DlmError> {
        let mut left = n as usize;
        while left > 0 {
            if self.pending.is_empty() && !self.refill().await? {
                return Err(DlmError::ShortRead { missing: left as u64 });
            }
            let take = left.min(self.pending.len());
            self.pending.advance(take);
            left -= take;
        }
        Ok(())
    }
}
