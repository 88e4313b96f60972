//! Point stream output

use crate::copc::{CopcInfo, HierarchyEntry};
use crate::core::types::Result;
use crate::core::Error;

use super::buffer::PointBuffer;

/// Chunked point writer.
///
/// Points written between two `chunk()` calls form one independently
/// decodable chunk; `tell()` is the byte offset the hierarchy records.
pub trait PointSink {
    fn write_point(&mut self, record: &[u8]) -> Result<()>;

    /// Current byte offset in the output
    fn tell(&self) -> u64;

    /// Seal the points written since the previous call into one chunk
    fn chunk(&mut self) -> Result<()>;

    /// Provide the final COPC info and hierarchy, written at close
    fn update_header(&mut self, info: &CopcInfo, hierarchy: &[HierarchyEntry]) -> Result<()>;

    /// Finish the output, returning its total size in bytes
    fn close(&mut self) -> Result<u64>;

    /// Points written so far
    fn npoints(&self) -> u64;
}

/// Sink that keeps every chunk in memory. The "codec" is the identity, so
/// a chunk's byte size is its raw record length.
#[derive(Debug, Default)]
pub struct MemorySink {
    record_len: usize,
    pending: Option<PointBuffer>,
    chunks: Vec<(u64, PointBuffer)>,
    position: u64,
    npoints: u64,
    info: Option<CopcInfo>,
    hierarchy: Vec<HierarchyEntry>,
    closed: bool,
}

impl MemorySink {
    pub fn new(record_len: usize) -> Self {
        Self { record_len, ..Default::default() }
    }

    /// Sealed chunks with their starting offsets
    pub fn chunks(&self) -> &[(u64, PointBuffer)] {
        &self.chunks
    }

    /// Chunk starting at `offset`, as addressed by a hierarchy entry
    pub fn chunk_at(&self, offset: u64) -> Option<&PointBuffer> {
        self.chunks.iter().find(|(o, _)| *o == offset).map(|(_, c)| c)
    }

    pub fn info(&self) -> Option<&CopcInfo> {
        self.info.as_ref()
    }

    pub fn hierarchy(&self) -> &[HierarchyEntry] {
        &self.hierarchy
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PointSink for MemorySink {
    fn write_point(&mut self, record: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Invariant("write to a closed sink".into()));
        }
        let record_len = self.record_len;
        self.pending
            .get_or_insert_with(|| PointBuffer::new(record_len))
            .push(record);
        self.npoints += 1;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn chunk(&mut self) -> Result<()> {
        if let Some(chunk) = self.pending.take() {
            let size = chunk.as_bytes().len() as u64;
            self.chunks.push((self.position, chunk));
            self.position += size;
        }
        Ok(())
    }

    fn update_header(&mut self, info: &CopcInfo, hierarchy: &[HierarchyEntry]) -> Result<()> {
        self.info = Some(*info);
        self.hierarchy = hierarchy.to_vec();
        Ok(())
    }

    fn close(&mut self) -> Result<u64> {
        self.chunk()?;
        self.closed = true;
        Ok(self.position)
    }

    fn npoints(&self) -> u64 {
        self.npoints
    }
}
