//! Chunked COPC-layout container
//!
//! File layout:
//!
//! ```text
//! header (136 bytes) | COPC info (160 bytes) | chunk* | EVLR header (60 bytes) | hierarchy entries
//! ```
//!
//! Each chunk is the raw point records of one octant compressed with LZ4
//! (`compress_prepend_size`). The header and info record are written as
//! placeholders and backfilled when the container is closed.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::trace;

use crate::core::types::{DVec3, Result};
use crate::core::{Error, IoResultExt};
use crate::math::Aabb;
use crate::point::{CloudHeader, PointBuffer, PointFormat, PointSink, Scaling};

use super::hierarchy::HierarchyEntry;
use super::info::CopcInfo;

pub const MAGIC: [u8; 8] = *b"COPCLZ4\0";
pub const VERSION: u32 = 1;

const HEADER_SIZE: usize = 136;
const EVLR_HEADER_SIZE: usize = 60;
const HIERARCHY_USER_ID: &[u8] = b"copc";
const HIERARCHY_RECORD_ID: u16 = 1000;
const HIERARCHY_DESCRIPTION: &[u8] = b"EPT hierarchy";

/// Fixed header at the start of a container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerHeader {
    pub version: u32,
    pub format: PointFormat,
    pub point_count: u64,
    pub scaling: Scaling,
    pub bounds: Aabb,
    pub info_offset: u64,
    pub evlr_offset: u64,
}

impl ContainerHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.format.id);
        out.push(0);
        out.extend_from_slice(&self.format.record_len.to_le_bytes());
        out.extend_from_slice(&self.point_count.to_le_bytes());
        for v in [self.scaling.scale, self.scaling.offset, self.bounds.min, self.bounds.max] {
            for c in v.to_array() {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.info_offset.to_le_bytes());
        out.extend_from_slice(&self.evlr_offset.to_le_bytes());

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&out);
        header
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[0..8] != MAGIC {
            return Err(Error::Format("not a COPC container (bad magic)".into()));
        }
        let u64_at = |o: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[o..o + 8]);
            u64::from_le_bytes(w)
        };
        let f64_at = |o: usize| f64::from_bits(u64_at(o));
        let vec_at = |o: usize| DVec3::new(f64_at(o), f64_at(o + 8), f64_at(o + 16));

        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != VERSION {
            return Err(Error::Format(format!("unsupported container version {}", version)));
        }
        let record_len = u16::from_le_bytes([bytes[14], bytes[15]]);
        let base = PointFormat::base_len(bytes[12])
            .ok_or_else(|| Error::Format(format!("unsupported point format {}", bytes[12])))?;
        let extra = record_len
            .checked_sub(base)
            .ok_or_else(|| Error::Format(format!("record length {} below format minimum {}", record_len, base)))?;

        Ok(Self {
            version,
            format: PointFormat::new(bytes[12], extra)?,
            point_count: u64_at(16),
            scaling: Scaling::new(vec_at(24), vec_at(48)),
            bounds: Aabb::new(vec_at(72), vec_at(96)),
            info_offset: u64_at(120),
            evlr_offset: u64_at(128),
        })
    }
}

fn evlr_header(payload_len: u64) -> [u8; EVLR_HEADER_SIZE] {
    let mut out = [0u8; EVLR_HEADER_SIZE];
    out[2..2 + HIERARCHY_USER_ID.len()].copy_from_slice(HIERARCHY_USER_ID);
    out[18..20].copy_from_slice(&HIERARCHY_RECORD_ID.to_le_bytes());
    out[20..28].copy_from_slice(&payload_len.to_le_bytes());
    out[28..28 + HIERARCHY_DESCRIPTION.len()].copy_from_slice(HIERARCHY_DESCRIPTION);
    out
}

/// Point sink writing a container file
pub struct ContainerSink {
    path: PathBuf,
    writer: BufWriter<File>,
    header: ContainerHeader,
    pending: Vec<u8>,
    position: u64,
    npoints: u64,
    chunks: u64,
    info: Option<CopcInfo>,
    hierarchy: Vec<HierarchyEntry>,
    closed: bool,
}

impl ContainerSink {
    /// Create the output and reserve space for the header and info record
    pub fn create(path: impl AsRef<Path>, cloud: &CloudHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).with_path(&path)?;
        let mut writer = BufWriter::new(file);
        let header = ContainerHeader {
            version: VERSION,
            format: cloud.format,
            point_count: 0,
            scaling: cloud.scaling,
            bounds: cloud.bounds,
            info_offset: HEADER_SIZE as u64,
            evlr_offset: 0,
        };
        writer.write_all(&header.encode()).with_path(&path)?;
        writer.write_all(&[0u8; CopcInfo::SIZE]).with_path(&path)?;
        Ok(Self {
            path,
            writer,
            header,
            pending: Vec::new(),
            position: (HEADER_SIZE + CopcInfo::SIZE) as u64,
            npoints: 0,
            chunks: 0,
            info: None,
            hierarchy: Vec::new(),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chunks sealed so far
    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Invariant(format!("write to closed output {}", self.path.display())))
        } else {
            Ok(())
        }
    }
}

impl PointSink for ContainerSink {
    fn write_point(&mut self, record: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if record.len() != self.header.format.record_len() {
            return Err(Error::Format(format!(
                "record of {} bytes written to a container of {}-byte records",
                record.len(),
                self.header.format.record_len()
            )));
        }
        self.pending.extend_from_slice(record);
        self.npoints += 1;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn chunk(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress_prepend_size(&self.pending);
        self.writer.write_all(&compressed).with_path(&self.path)?;
        trace!(
            "Chunk {} at {}: {} -> {} bytes",
            self.chunks,
            self.position,
            self.pending.len(),
            compressed.len()
        );
        self.position += compressed.len() as u64;
        self.chunks += 1;
        self.pending.clear();
        Ok(())
    }

    fn update_header(&mut self, info: &CopcInfo, hierarchy: &[HierarchyEntry]) -> Result<()> {
        self.ensure_open()?;
        self.info = Some(*info);
        self.hierarchy = hierarchy.to_vec();
        Ok(())
    }

    fn close(&mut self) -> Result<u64> {
        self.chunk()?;
        let mut info = self
            .info
            .ok_or_else(|| Error::Invariant(format!("{} closed without COPC info", self.path.display())))?;

        let mut payload = Vec::with_capacity(self.hierarchy.len() * HierarchyEntry::SIZE);
        for entry in &self.hierarchy {
            entry.write_to(&mut payload);
        }

        let evlr_offset = self.position;
        self.writer.write_all(&evlr_header(payload.len() as u64)).with_path(&self.path)?;
        self.writer.write_all(&payload).with_path(&self.path)?;
        let total = evlr_offset + (EVLR_HEADER_SIZE + payload.len()) as u64;

        info.root_hier_offset = evlr_offset + EVLR_HEADER_SIZE as u64;
        info.root_hier_size = payload.len() as u64;
        self.header.point_count = self.npoints;
        self.header.evlr_offset = evlr_offset;

        self.writer.seek(SeekFrom::Start(0)).with_path(&self.path)?;
        self.writer.write_all(&self.header.encode()).with_path(&self.path)?;
        self.writer.write_all(&info.to_bytes()).with_path(&self.path)?;
        self.writer.flush().with_path(&self.path)?;

        self.info = Some(info);
        self.closed = true;
        Ok(total)
    }

    fn npoints(&self) -> u64 {
        self.npoints
    }
}

/// Random-access reader for container files
pub struct ContainerReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: ContainerHeader,
    info: CopcInfo,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_path(&path)?;
        let mut reader = BufReader::new(file);

        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).with_path(&path)?;
        let header = ContainerHeader::decode(&raw)?;

        let mut raw_info = [0u8; CopcInfo::SIZE];
        reader.seek(SeekFrom::Start(header.info_offset)).with_path(&path)?;
        reader.read_exact(&mut raw_info).with_path(&path)?;
        let info = CopcInfo::from_bytes(&raw_info)?;

        Ok(Self { path, reader, header, info })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn info(&self) -> &CopcInfo {
        &self.info
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        self.reader.read_exact(&mut buf).with_path(&self.path)?;
        Ok(buf)
    }

    /// Hierarchy entries, after checking the EVLR that holds them
    pub fn hierarchy(&mut self) -> Result<Vec<HierarchyEntry>> {
        let evlr = self.read_at(self.header.evlr_offset, EVLR_HEADER_SIZE)?;
        let record_id = u16::from_le_bytes([evlr[18], evlr[19]]);
        if &evlr[2..2 + HIERARCHY_USER_ID.len()] != HIERARCHY_USER_ID || record_id != HIERARCHY_RECORD_ID {
            return Err(Error::Format(format!("{} has no COPC hierarchy record", self.path.display())));
        }
        let len = usize::try_from(self.info.root_hier_size)
            .map_err(|_| Error::Format("hierarchy too large".into()))?;
        let payload = self.read_at(self.info.root_hier_offset, len)?;
        HierarchyEntry::parse_all(&payload)
    }

    /// Decode the chunk an entry points at
    pub fn read_chunk(&mut self, entry: &HierarchyEntry) -> Result<PointBuffer> {
        let record_len = self.header.format.record_len();
        if entry.point_count <= 0 {
            return Ok(PointBuffer::new(record_len));
        }
        let size = usize::try_from(entry.byte_size)
            .map_err(|_| Error::Format(format!("octant {} has byte size {}", entry.key, entry.byte_size)))?;
        let compressed = self.read_at(entry.offset, size)?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| Error::Format(format!("chunk of octant {}: {}", entry.key, e)))?;
        let points = PointBuffer::from_bytes(record_len, raw)
            .ok_or_else(|| Error::Format(format!("chunk of octant {} is truncated", entry.key)))?;
        if points.len() != entry.point_count as usize {
            return Err(Error::Format(format!(
                "chunk of octant {} holds {} points, hierarchy says {}",
                entry.key,
                points.len(),
                entry.point_count
            )));
        }
        Ok(points)
    }
}
