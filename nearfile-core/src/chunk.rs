//! Chunk manager: split a file into indexed chunks, store received chunks by index, reassemble.

use std::collections::BTreeMap;

/// Datagram-link chunk size. Base64 inflates a chunk by a third, so a
/// FILE_DATA message for this many bytes still fits in one UDP datagram.
pub const DEFAULT_CHUNK_SIZE: u32 = 48_000;

/// Radio-link chunk payload size.
pub const RADIO_CHUNK_SIZE: u32 = 20;

/// One chunk: index plus byte range `[start, end)` within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSpan {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Borrow this chunk's bytes out of the whole file.
    pub fn slice<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        &file[self.start as usize..self.end as usize]
    }
}

/// Number of chunks needed for `total_len` bytes.
pub fn chunk_count(total_len: u64, chunk_size: u32) -> u64 {
    let size = effective_size(chunk_size) as u64;
    total_len.div_ceil(size)
}

/// Split `total_len` bytes into fixed-size chunks; the last may be shorter.
pub fn split_into_chunks(total_len: u64, chunk_size: u32) -> Vec<ChunkSpan> {
    let size = effective_size(chunk_size) as u64;
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut index = 0u32;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkSpan { index, start, end });
        start = end;
        index += 1;
    }
    out
}

fn effective_size(chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Outcome of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    /// First copy of this index.
    New,
    /// Index already held; the stored bytes are kept.
    Duplicate,
}

/// Received chunks keyed by index. Arrival order does not matter.
#[derive(Debug, Default)]
pub struct Reassembly {
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u32, bytes: Vec<u8>) -> ChunkInsert {
        if self.chunks.contains_key(&index) {
            return ChunkInsert::Duplicate;
        }
        self.received_bytes += bytes.len() as u64;
        self.chunks.insert(index, bytes);
        ChunkInsert::New
    }

    pub fn contains(&self, index: u32) -> bool {
        self.chunks.contains_key(&index)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Indices below `count` that have not arrived.
    pub fn missing(&self, count: u32) -> Vec<u32> {
        (0..count).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// Concatenate all chunks in index order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for bytes in self.chunks.values() {
            out.extend_from_slice(bytes);
        }
        out
    }
}
