//! Whitespace-separated text point reader
//!
//! One point per line: `x y z [gps_time [intensity [return_number [channel]]]]`.
//! Blank lines and lines starting with `#` are skipped. The file is scanned
//! once on open to populate the header (bounds, count, GPS presence).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::core::types::{DVec3, Result};
use crate::core::{Error, IoResultExt};
use crate::math::Aabb;

use super::format::{CloudHeader, PointFormat, PointRecord, PointView, Scaling};
use super::source::PointSource;

/// Options for reading text point clouds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextOptions {
    /// Quantization step for all three axes
    pub scale: f64,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self { scale: 0.001 }
    }
}

/// Fields parsed from one line
#[derive(Clone, Copy, Debug, PartialEq)]
struct TextPoint {
    position: DVec3,
    gps_time: Option<f64>,
    intensity: u16,
    return_number: u8,
    channel: u8,
}

fn parse_field<T: std::str::FromStr>(field: &str, what: &str, path: &Path, line_no: u64) -> Result<T> {
    field.parse::<T>().map_err(|_| {
        Error::Format(format!("{}:{}: cannot parse {} '{}'", path.display(), line_no, what, field))
    })
}

fn parse_line(line: &str, path: &Path, line_no: u64) -> Result<Option<TextPoint>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|f| !f.is_empty())
        .collect();
    if fields.len() < 3 {
        return Err(Error::Format(format!(
            "{}:{}: expected at least x y z, found {} fields",
            path.display(),
            line_no,
            fields.len()
        )));
    }
    let x = parse_field::<f64>(fields[0], "x", path, line_no)?;
    let y = parse_field::<f64>(fields[1], "y", path, line_no)?;
    let z = parse_field::<f64>(fields[2], "z", path, line_no)?;
    let gps_time = match fields.get(3) {
        Some(f) => Some(parse_field::<f64>(f, "gps time", path, line_no)?),
        None => None,
    };
    let intensity = match fields.get(4) {
        Some(f) => parse_field::<u16>(f, "intensity", path, line_no)?,
        None => 0,
    };
    let return_number = match fields.get(5) {
        Some(f) => parse_field::<u8>(f, "return number", path, line_no)?,
        None => 1,
    };
    let channel = match fields.get(6) {
        Some(f) => parse_field::<u8>(f, "scanner channel", path, line_no)?,
        None => 0,
    };
    Ok(Some(TextPoint {
        position: DVec3::new(x, y, z),
        gps_time,
        intensity,
        return_number,
        channel,
    }))
}

/// Point source reading a text file
pub struct TextSource {
    path: PathBuf,
    header: CloudHeader,
    reader: BufReader<File>,
    line: String,
    line_no: u64,
    record: Vec<u8>,
}

impl TextSource {
    pub fn open(path: impl AsRef<Path>, options: TextOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !(options.scale > 0.0) {
            return Err(Error::Config(format!("invalid coordinate scale {}", options.scale)));
        }

        // Populate the header
        let mut bounds = Aabb::empty();
        let mut point_count = 0u64;
        let mut has_gps_time = true;
        let file = File::open(&path).with_path(&path)?;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_path(&path)?;
            if let Some(point) = parse_line(&line, &path, i as u64 + 1)? {
                bounds.expand(point.position);
                has_gps_time &= point.gps_time.is_some();
                point_count += 1;
            }
        }
        if point_count == 0 {
            bounds = Aabb::new(DVec3::ZERO, DVec3::ZERO);
            has_gps_time = false;
        }

        let offset = bounds.min.floor();
        let scaling = Scaling::new(DVec3::splat(options.scale), offset);
        // Quantized extremes, so the header matches what reads return
        let bounds = Aabb::new(
            scaling.to_world(scaling.to_raw(bounds.min)?),
            scaling.to_world(scaling.to_raw(bounds.max)?),
        );

        let format = PointFormat::pdrf6();
        let header = CloudHeader { format, scaling, bounds, point_count, has_gps_time };
        let reader = BufReader::new(File::open(&path).with_path(&path)?);
        Ok(Self {
            path,
            header,
            reader,
            line: String::new(),
            line_no: 0,
            record: Vec::with_capacity(format.record_len()),
        })
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader = BufReader::new(File::open(&self.path).with_path(&self.path)?);
        self.line_no = 0;
        Ok(())
    }

    fn next_text_point(&mut self) -> Result<Option<TextPoint>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).with_path(&self.path)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if let Some(point) = parse_line(&self.line, &self.path, self.line_no)? {
                return Ok(Some(point));
            }
        }
    }
}

impl PointSource for TextSource {
    fn header(&self) -> &CloudHeader {
        &self.header
    }

    fn read_point(&mut self) -> Result<Option<PointView<'_>>> {
        let Some(point) = self.next_text_point()? else {
            return Ok(None);
        };
        let record = PointRecord::new(self.header.format)
            .with_position(&self.header.scaling, point.position)?
            .with_gps_time(point.gps_time.unwrap_or(0.0))
            .with_intensity(point.intensity)
            .with_returns(point.return_number, point.return_number.max(1))
            .with_scanner_channel(point.channel);
        self.record = record.into_bytes();
        Ok(Some(PointView::new(&self.record)))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        self.rewind()?;
        for _ in 0..index {
            if self.next_text_point()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}
