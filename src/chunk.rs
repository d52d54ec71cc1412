use bytes::Bytes;

/// A chunk of downloaded data on its way from a range worker to the writer.
///
/// `index` is the chunk's position in the file bitmap; `offset` is the byte
/// offset the data must be written at, always `index * chunk_size`. The
/// payload is full chunk size for every chunk except possibly the file's
/// last one.
#[derive(Debug, Clone)]
pub struct DataChunk {
    data: Bytes,
    offset: u64,
    index: u64,
}

impl DataChunk {
    pub fn new(data: Bytes, offset: u64, index: u64) -> Self {
        Self {
            data,
            offset,
            index,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}
