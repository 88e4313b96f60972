//! Point stream input

use crate::core::types::{DVec3, Result};
use crate::core::Error;
use crate::math::Aabb;

use super::buffer::PointBuffer;
use super::format::{CloudHeader, PointFormat, PointView, Scaling};

/// Sequential, rewindable stream of point records
pub trait PointSource {
    /// Header describing the stream, available before the first read
    fn header(&self) -> &CloudHeader;

    /// Next record, or `None` at the end of the stream
    fn read_point(&mut self) -> Result<Option<PointView<'_>>>;

    /// Reposition so the next read returns the point with this index
    fn seek(&mut self, index: u64) -> Result<()>;

    /// Name used in diagnostics
    fn name(&self) -> String {
        "<stream>".to_string()
    }
}

/// Point source over records already in memory
pub struct MemorySource {
    header: CloudHeader,
    points: PointBuffer,
    cursor: usize,
}

impl MemorySource {
    /// Build a source, deriving the header bounds and count from the records
    pub fn new(format: PointFormat, scaling: Scaling, points: PointBuffer) -> Result<Self> {
        if points.record_len() != format.record_len() {
            return Err(Error::Format(format!(
                "records are {} bytes but format {} needs {}",
                points.record_len(),
                format.id,
                format.record_len()
            )));
        }
        let mut bounds = Aabb::empty();
        for i in 0..points.len() {
            bounds.expand(points.view(i).position(&scaling));
        }
        if bounds.is_empty() {
            bounds = Aabb::new(DVec3::ZERO, DVec3::ZERO);
        }
        let header = CloudHeader {
            format,
            scaling,
            bounds,
            point_count: points.len() as u64,
            has_gps_time: true,
        };
        Ok(Self { header, points, cursor: 0 })
    }

    /// Encode world positions as format 6 records; GPS time is the point index
    pub fn from_positions(scaling: Scaling, positions: &[DVec3]) -> Result<Self> {
        let format = PointFormat::pdrf6();
        let mut points = PointBuffer::with_capacity(format.record_len(), positions.len());
        for (i, &p) in positions.iter().enumerate() {
            let record = super::format::PointRecord::new(format)
                .with_position(&scaling, p)?
                .with_returns(1, 1)
                .with_gps_time(i as f64);
            points.push(record.as_bytes());
        }
        Self::new(format, scaling, points)
    }

    pub fn points(&self) -> &PointBuffer {
        &self.points
    }
}

impl PointSource for MemorySource {
    fn header(&self) -> &CloudHeader {
        &self.header
    }

    fn read_point(&mut self) -> Result<Option<PointView<'_>>> {
        if self.cursor >= self.points.len() {
            return Ok(None);
        }
        let view = self.points.view(self.cursor);
        self.cursor += 1;
        Ok(Some(view))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        self.cursor = (index as usize).min(self.points.len());
        Ok(())
    }

    fn name(&self) -> String {
        "<memory>".to_string()
    }
}
