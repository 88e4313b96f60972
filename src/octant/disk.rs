//! On-disk octant store
//!
//! Points are appended to one spill file per octant through a small pending
//! buffer. A deactivated octant keeps no open handle and no occupancy in
//! memory: the occupancy map goes to a side file until the next `activate`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::core::types::Result;
use crate::core::{Error, IoResultExt};
use crate::octree::{CellId, SpatialKey};
use crate::point::PointBuffer;
use crate::streaming::{disk_io, FileBudget};

use super::{Occupancy, OctantStore, VoxelRecord};

/// Pending appends are written out once they reach this many bytes
const PENDING_FLUSH_BYTES: usize = 16 * 1024;

/// Octant whose points are spilled to `points-d-x-y-z.bin`
#[derive(Debug)]
pub struct DiskOctant {
    key: SpatialKey,
    record_len: usize,
    points_path: PathBuf,
    occupancy_path: PathBuf,
    budget: Rc<FileBudget>,
    file: Option<File>,
    /// Records not yet written to the file
    pending: Vec<u8>,
    /// Records already in the file
    flushed: usize,
    occupancy: Occupancy,
    active: bool,
    loaded: Option<PointBuffer>,
}

impl DiskOctant {
    /// Create (or truncate) the spill file for `key` in `dir`
    pub fn create(dir: &Path, key: SpatialKey, record_len: usize, budget: Rc<FileBudget>) -> Result<Self> {
        let points_path = disk_io::points_path(dir, &key);
        {
            let _guard = budget.hold()?;
            File::create(&points_path).with_path(&points_path)?;
        }
        Ok(Self {
            key,
            record_len,
            occupancy_path: disk_io::occupancy_path(dir, &key),
            points_path,
            budget,
            file: None,
            pending: Vec::new(),
            flushed: 0,
            occupancy: Occupancy::default(),
            active: true,
            loaded: None,
        })
    }

    pub fn key(&self) -> SpatialKey {
        self.key
    }

    pub fn points_path(&self) -> &Path {
        &self.points_path
    }

    fn handle(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.budget.acquire()?;
            match OpenOptions::new().read(true).write(true).create(true).open(&self.points_path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    self.budget.release();
                    return Err(Error::file(&self.points_path, e));
                }
            }
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::Invariant(format!("octant {} lost its file handle", self.key)))
    }

    fn close_handle(&mut self) {
        if self.file.take().is_some() {
            self.budget.release();
        }
    }

    /// Give the handle back when nobody else could open one
    fn relax(&mut self) {
        if self.budget.is_saturated() {
            self.close_handle();
        }
    }

    fn ensure_active(&mut self) -> Result<()> {
        if self.active { Ok(()) } else { self.activate() }
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let path = self.points_path.clone();
        let file = self.handle()?;
        file.seek(SeekFrom::End(0)).with_path(&path)?;
        file.write_all(&pending).with_path(&path)?;
        self.flushed += pending.len() / self.record_len;
        self.pending = pending;
        self.pending.clear();
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        let expected = self.flushed * self.record_len;
        let mut bytes = Vec::with_capacity(expected + self.pending.len());
        if self.flushed > 0 {
            let path = self.points_path.clone();
            let file = self.handle()?;
            file.seek(SeekFrom::Start(0)).with_path(&path)?;
            file.read_to_end(&mut bytes).with_path(&path)?;
            if bytes.len() != expected {
                return Err(Error::Format(format!(
                    "spill file {} holds {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    expected
                )));
            }
        }
        bytes.extend_from_slice(&self.pending);
        Ok(bytes)
    }
}

impl OctantStore for DiskOctant {
    fn insert(&mut self, record: &[u8], cell: Option<CellId>, buffer_id: u16) -> Result<()> {
        if record.len() != self.record_len {
            return Err(Error::Invariant(format!(
                "record of {} bytes inserted into octant {} of {}-byte records",
                record.len(),
                self.key,
                self.record_len
            )));
        }
        self.ensure_active()?;
        let position = i32::try_from(self.npoints())
            .map_err(|_| Error::Invariant(format!("octant {} exceeds i32::MAX points", self.key)))?;
        self.pending.extend_from_slice(record);
        if let Some(cell) = cell {
            self.occupancy.insert(cell, VoxelRecord { buffer_id, position });
        }
        if self.pending.len() >= PENDING_FLUSH_BYTES {
            self.flush_pending()?;
            self.relax();
        }
        Ok(())
    }

    fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    fn occupancy_mut(&mut self) -> &mut Occupancy {
        &mut self.occupancy
    }

    fn swap(&mut self, incoming: &mut [u8], position: i32) -> Result<()> {
        let index = usize::try_from(position)
            .ok()
            .filter(|&i| i < self.npoints() && incoming.len() == self.record_len)
            .ok_or_else(|| Error::Invariant(format!(
                "swap at position {} of octant {} holding {} points",
                position,
                self.key,
                self.npoints()
            )))?;
        self.ensure_active()?;

        if index >= self.flushed {
            let start = (index - self.flushed) * self.record_len;
            self.pending[start..start + self.record_len].swap_with_slice(incoming);
            return Ok(());
        }

        let offset = (index * self.record_len) as u64;
        let mut stored = vec![0u8; self.record_len];
        let path = self.points_path.clone();
        let file = self.handle()?;
        file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        file.read_exact(&mut stored).with_path(&path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        file.write_all(incoming).with_path(&path)?;
        incoming.copy_from_slice(&stored);
        self.relax();
        Ok(())
    }

    fn npoints(&self) -> usize {
        self.flushed + self.pending.len() / self.record_len
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Err(Error::Invariant(format!("octant {} loaded twice", self.key)));
        }
        let bytes = self.read_all()?;
        self.close_handle();
        let points = PointBuffer::from_bytes(self.record_len, bytes)
            .ok_or_else(|| Error::Format(format!("spill file of octant {} is truncated", self.key)))?;
        self.loaded = Some(points);
        Ok(())
    }

    fn sort(&mut self) -> Result<()> {
        match self.loaded.as_mut() {
            Some(points) => {
                points.sort_for_compression();
                Ok(())
            }
            None => Err(Error::Invariant(format!("octant {} sorted before load", self.key))),
        }
    }

    fn points(&self) -> Result<&PointBuffer> {
        self.loaded
            .as_ref()
            .ok_or_else(|| Error::Invariant(format!("octant {} points accessed before load", self.key)))
    }

    fn clean(&mut self) -> Result<()> {
        self.close_handle();
        self.loaded = None;
        self.pending = Vec::new();
        self.flushed = 0;
        self.occupancy.clear();
        self.active = true;
        for path in [&self.points_path, &self.occupancy_path] {
            if path.exists() {
                std::fs::remove_file(path).with_path(path)?;
            }
        }
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        self.occupancy = {
            let _guard = self.budget.hold()?;
            disk_io::take_occupancy(&self.occupancy_path)?
        };
        self.active = true;
        self.handle()?;
        self.relax();
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.flush_pending()?;
        self.pending = Vec::new();
        self.close_handle();
        {
            let _guard = self.budget.hold()?;
            disk_io::save_occupancy(&self.occupancy_path, &self.occupancy)?;
        }
        self.occupancy.clear();
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn has_open_handle(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for DiskOctant {
    fn drop(&mut self) {
        self.close_handle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{PointFormat, PointRecord, PointView};
    use tempfile::TempDir;

    fn record(gps: f64) -> Vec<u8> {
        PointRecord::new(PointFormat::pdrf6()).with_gps_time(gps).into_bytes()
    }

    fn octant(dir: &Path, budget: &Rc<FileBudget>) -> DiskOctant {
        DiskOctant::create(dir, SpatialKey::new(1, 0, 1, 0), 30, Rc::clone(budget)).unwrap()
    }

    #[test]
    fn test_create_makes_spill_file() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let o = octant(tmp.path(), &budget);
        assert!(o.points_path().exists());
        assert_eq!(budget.open_count(), 0);
        assert_eq!(budget.peak(), 1);
    }

    #[test]
    fn test_insert_spills_past_pending_limit() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        let n = PENDING_FLUSH_BYTES / 30 + 10;
        for i in 0..n {
            o.insert(&record(i as f64), Some(i as CellId), 1).unwrap();
        }
        assert_eq!(o.npoints(), n);
        assert!(o.flushed > 0);
        assert!(o.has_open_handle());

        o.load().unwrap();
        assert!(!o.has_open_handle());
        let points = o.points().unwrap();
        assert_eq!(points.len(), n);
        for i in 0..n {
            assert_eq!(points.view(i).gps_time(), i as f64);
        }
    }

    #[test]
    fn test_swap_in_file_and_pending() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        let n = PENDING_FLUSH_BYTES / 30 + 10;
        for i in 0..n {
            o.insert(&record(i as f64), None, 0).unwrap();
        }

        let mut incoming = record(-1.0);
        o.swap(&mut incoming, 0).unwrap();
        assert_eq!(PointView::new(&incoming).gps_time(), 0.0);

        let last = (n - 1) as i32;
        let mut incoming = record(-2.0);
        o.swap(&mut incoming, last).unwrap();
        assert_eq!(PointView::new(&incoming).gps_time(), (n - 1) as f64);

        o.load().unwrap();
        let points = o.points().unwrap();
        assert_eq!(points.view(0).gps_time(), -1.0);
        assert_eq!(points.view(n - 1).gps_time(), -2.0);
    }

    #[test]
    fn test_deactivate_activate_restores_state() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        o.insert(&record(1.0), Some(3), 2).unwrap();
        o.insert(&record(2.0), Some(4), 2).unwrap();

        o.deactivate().unwrap();
        assert!(!o.is_active());
        assert!(!o.has_open_handle());
        assert!(o.occupancy().is_empty());
        assert_eq!(budget.open_count(), 0);
        assert_eq!(o.npoints(), 2);

        o.activate().unwrap();
        assert!(o.is_active());
        assert_eq!(o.occupancy().get(4), Some(&VoxelRecord { buffer_id: 2, position: 1 }));

        o.insert(&record(3.0), None, 3).unwrap();
        o.load().unwrap();
        let times: Vec<f64> = (0..3).map(|i| o.points().unwrap().view(i).gps_time()).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_insert_reactivates() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        o.insert(&record(1.0), Some(1), 0).unwrap();
        o.deactivate().unwrap();
        o.insert(&record(2.0), Some(2), 0).unwrap();
        assert!(o.is_active());
        assert_eq!(o.occupancy().len(), 2);
    }

    #[test]
    fn test_saturated_budget_closes_after_use() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(2);
        let mut a = octant(tmp.path(), &budget);
        let mut b = DiskOctant::create(tmp.path(), SpatialKey::new(1, 1, 1, 1), 30, Rc::clone(&budget)).unwrap();
        let n = PENDING_FLUSH_BYTES / 30 + 1;
        for i in 0..n {
            a.insert(&record(i as f64), None, 0).unwrap();
            b.insert(&record(i as f64), None, 0).unwrap();
            assert!(budget.open_count() <= 2);
        }
        assert!(!(a.has_open_handle() && b.has_open_handle()));
        assert!(budget.peak() <= 2);
    }

    #[test]
    fn test_clean_removes_files() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        o.insert(&record(1.0), Some(1), 0).unwrap();
        o.deactivate().unwrap();
        o.activate().unwrap();
        o.deactivate().unwrap();
        let path = o.points_path().to_path_buf();
        o.clean().unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert_eq!(budget.open_count(), 0);
    }

    #[test]
    fn test_double_load() {
        let tmp = TempDir::new().unwrap();
        let budget = FileBudget::shared(8);
        let mut o = octant(tmp.path(), &budget);
        o.load().unwrap();
        assert!(matches!(o.load(), Err(Error::Invariant(_))));
    }
}
