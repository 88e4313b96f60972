//! Point record layout
//!
//! Records follow the LAS 1.4 point data record formats 6, 7 and 8. The
//! builder only looks at a handful of fields (coordinates, GPS time, scanner
//! channel, return number); everything else is carried as opaque bytes.

use crate::core::types::{DVec3, IVec3, Result};
use crate::core::Error;
use crate::math::Aabb;

/// Byte offsets inside a format 6/7/8 record
pub mod layout {
    pub const X: usize = 0;
    pub const Y: usize = 4;
    pub const Z: usize = 8;
    pub const INTENSITY: usize = 12;
    pub const RETURNS: usize = 14;
    pub const FLAGS: usize = 15;
    pub const CLASSIFICATION: usize = 16;
    pub const USER_DATA: usize = 17;
    pub const SCAN_ANGLE: usize = 18;
    pub const POINT_SOURCE_ID: usize = 20;
    pub const GPS_TIME: usize = 22;
}

/// Point data record format and total record length (extra bytes included)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointFormat {
    pub id: u8,
    pub record_len: u16,
}

impl PointFormat {
    /// Create a format, checking the record is long enough for its core fields
    pub fn new(id: u8, extra_bytes: u16) -> Result<Self> {
        let base = Self::base_len(id)
            .ok_or_else(|| Error::Format(format!("unsupported point data format {}", id)))?;
        Ok(Self { id, record_len: base + extra_bytes })
    }

    /// Format 6, no extra bytes
    pub fn pdrf6() -> Self {
        Self { id: 6, record_len: 30 }
    }

    /// Core record length of a supported format
    pub fn base_len(id: u8) -> Option<u16> {
        match id {
            6 => Some(30),
            7 => Some(36),
            8 => Some(38),
            _ => None,
        }
    }

    pub fn record_len(&self) -> usize {
        self.record_len as usize
    }
}

/// Integer-to-world coordinate transform
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scaling {
    pub scale: DVec3,
    pub offset: DVec3,
}

impl Default for Scaling {
    fn default() -> Self {
        Self { scale: DVec3::splat(0.001), offset: DVec3::ZERO }
    }
}

impl Scaling {
    pub fn new(scale: DVec3, offset: DVec3) -> Self {
        Self { scale, offset }
    }

    pub fn to_world(&self, raw: IVec3) -> DVec3 {
        raw.as_dvec3() * self.scale + self.offset
    }

    /// Quantize a world coordinate, failing if it does not fit in 32 bits
    pub fn to_raw(&self, world: DVec3) -> Result<IVec3> {
        let q = ((world - self.offset) / self.scale).round();
        let limit = i32::MAX as f64;
        if !q.is_finite() || q.abs().max_element() > limit {
            return Err(Error::Format(format!(
                "coordinate {:?} does not fit the scale {:?} / offset {:?}",
                world, self.scale, self.offset
            )));
        }
        Ok(IVec3::new(q.x as i32, q.y as i32, q.z as i32))
    }
}

/// Summary of a point stream, known before the first point is read
#[derive(Clone, Debug, PartialEq)]
pub struct CloudHeader {
    pub format: PointFormat,
    pub scaling: Scaling,
    pub bounds: Aabb,
    pub point_count: u64,
    pub has_gps_time: bool,
}

impl CloudHeader {
    /// Heuristic for geographic (long/lat) coordinates, which the octree cannot index.
    ///
    /// Flags a header whose z spread dwarfs its horizontal spread, whose
    /// extent fits within ±90/±180 and whose xy precision is finer than 1e-4.
    pub fn looks_geographic(&self) -> bool {
        let size = self.bounds.size();
        let weird_z = 1000.0 * size.x < size.z || 1000.0 * size.y < size.z;
        let accurate = self.scaling.scale.x < 0.0001 || self.scaling.scale.y < 0.0001;
        let longlat_extent = self.bounds.max.x <= 90.0
            && self.bounds.min.x >= -90.0
            && self.bounds.max.y <= 180.0
            && self.bounds.min.y >= -180.0;
        weird_z && longlat_extent && accurate
    }
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// Read-only view over one encoded point record
#[derive(Clone, Copy, Debug)]
pub struct PointView<'a> {
    bytes: &'a [u8],
}

impl<'a> PointView<'a> {
    /// Wrap a record. The slice must be at least 30 bytes long.
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= 30, "record shorter than a format 6 point");
        Self { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn raw_xyz(&self) -> IVec3 {
        IVec3::new(
            i32::from_le_bytes(read_array(self.bytes, layout::X)),
            i32::from_le_bytes(read_array(self.bytes, layout::Y)),
            i32::from_le_bytes(read_array(self.bytes, layout::Z)),
        )
    }

    /// World position under the given scaling
    pub fn position(&self, scaling: &Scaling) -> DVec3 {
        scaling.to_world(self.raw_xyz())
    }

    pub fn intensity(&self) -> u16 {
        u16::from_le_bytes(read_array(self.bytes, layout::INTENSITY))
    }

    pub fn return_number(&self) -> u8 {
        self.bytes[layout::RETURNS] & 0x0F
    }

    pub fn number_of_returns(&self) -> u8 {
        self.bytes[layout::RETURNS] >> 4
    }

    pub fn scanner_channel(&self) -> u8 {
        (self.bytes[layout::FLAGS] >> 4) & 0x03
    }

    pub fn classification(&self) -> u8 {
        self.bytes[layout::CLASSIFICATION]
    }

    pub fn gps_time(&self) -> f64 {
        f64::from_le_bytes(read_array(self.bytes, layout::GPS_TIME))
    }

    /// Key used to order a chunk before it is handed to the codec
    pub fn compression_order(&self) -> (f64, u8, u8) {
        (self.gps_time(), self.scanner_channel(), self.return_number())
    }
}

/// Builder for an encoded point record
#[derive(Clone, Debug)]
pub struct PointRecord {
    bytes: Vec<u8>,
}

impl PointRecord {
    /// Zeroed record of the given format
    pub fn new(format: PointFormat) -> Self {
        Self { bytes: vec![0; format.record_len()] }
    }

    pub fn with_raw_xyz(mut self, raw: IVec3) -> Self {
        self.bytes[layout::X..layout::X + 4].copy_from_slice(&raw.x.to_le_bytes());
        self.bytes[layout::Y..layout::Y + 4].copy_from_slice(&raw.y.to_le_bytes());
        self.bytes[layout::Z..layout::Z + 4].copy_from_slice(&raw.z.to_le_bytes());
        self
    }

    /// Quantize and store a world position
    pub fn with_position(self, scaling: &Scaling, world: DVec3) -> Result<Self> {
        let raw = scaling.to_raw(world)?;
        Ok(self.with_raw_xyz(raw))
    }

    pub fn with_intensity(mut self, intensity: u16) -> Self {
        self.bytes[layout::INTENSITY..layout::INTENSITY + 2].copy_from_slice(&intensity.to_le_bytes());
        self
    }

    pub fn with_returns(mut self, return_number: u8, number_of_returns: u8) -> Self {
        self.bytes[layout::RETURNS] = (return_number & 0x0F) | (number_of_returns << 4);
        self
    }

    pub fn with_scanner_channel(mut self, channel: u8) -> Self {
        let flags = self.bytes[layout::FLAGS] & !0x30;
        self.bytes[layout::FLAGS] = flags | ((channel & 0x03) << 4);
        self
    }

    pub fn with_classification(mut self, class: u8) -> Self {
        self.bytes[layout::CLASSIFICATION] = class;
        self
    }

    pub fn with_gps_time(mut self, gps_time: f64) -> Self {
        self.bytes[layout::GPS_TIME..layout::GPS_TIME + 8].copy_from_slice(&gps_time.to_le_bytes());
        self
    }

    pub fn view(&self) -> PointView<'_> {
        PointView::new(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
