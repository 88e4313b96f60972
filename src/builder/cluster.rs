//! Two-pass out-of-core octree clustering
//!
//! Pass 1 counts points into the region finalizer and estimates the depth
//! and per-level swap probabilities. Pass 2 streams the points again in
//! shuffled batches, routes each one down the octree, and after every
//! batch writes out the octants whose region can receive no more points.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::copc::{CopcInfo, HierarchyEntry, HierarchyWriter};
use crate::core::types::Result;
use crate::core::Error;
use crate::octant::{Backend, OctantStore, OctreeRegistry};
use crate::octree::{OctreeGeometry, RegionFinalizer, SpatialKey};
use crate::point::{CloudHeader, PointSink, PointSource, PointView};
use crate::stats::{OccupancyGrid, PointInventory};
use crate::streaming::{self, FileBudget};

use super::config::BuildConfig;
use super::descent::{descend, DescentContext};
use super::schedule::SwapSchedule;
use super::shuffle::ShuffleBuffer;

/// Build phases, in the only order they may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pass1Scanning,
    DepthEstimated,
    Pass2Streaming,
    Flushing,
    Closed,
}

/// Outcome of pass 1
#[derive(Debug, Clone)]
pub struct DepthEstimate {
    pub point_count: u64,
    pub max_depth: u32,
    /// Covered horizontal area
    pub area: f64,
    /// Points per square unit over the covered area
    pub density: f64,
    pub schedule: SwapSchedule,
}

/// Summary of a finished build
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub point_count: u64,
    pub max_depth: u32,
    /// Hierarchy entries holding points
    pub chunks: usize,
    /// Hierarchy entries without points
    pub empty_entries: usize,
    pub largest_chunk: u64,
    pub smallest_chunk: u64,
    /// Chunks at or below the minimum octant size
    pub small_chunks: usize,
    pub octants_created: u64,
    pub octants_promoted: u64,
    pub peak_open_files: usize,
    pub output_size: u64,
    pub pass1_time: Duration,
    pub pass2_time: Duration,
}

/// Write one drained octant as a chunk and index it
fn flush_octant<K: PointSink + ?Sized>(
    key: SpatialKey,
    store: &mut dyn OctantStore,
    sink: &mut K,
    hierarchy: &mut HierarchyWriter,
    sort: bool,
) -> Result<()> {
    let offset = sink.tell();
    store.load()?;
    if sort {
        store.sort()?;
    }
    let points = store.points()?;
    for record in points.iter() {
        sink.write_point(record)?;
    }
    let npoints = points.len();
    sink.chunk()?;

    let byte_size = i32::try_from(sink.tell() - offset)
        .map_err(|_| Error::Invariant(format!("chunk of octant {} exceeds 2 GiB", key)))?;
    let point_count = i32::try_from(npoints)
        .map_err(|_| Error::Invariant(format!("octant {} holds {} points", key, npoints)))?;
    store.clean()?;
    trace!("Wrote octant {}: {} points, {} bytes at {}", key, point_count, byte_size, offset);
    hierarchy.record(HierarchyEntry { key, offset, byte_size, point_count })
}

/// Out-of-core octree builder for one input
pub struct ClusterBuilder {
    config: BuildConfig,
    state: BuildState,
    header: Option<CloudHeader>,
    geometry: Option<OctreeGeometry>,
    finalizer: Option<RegionFinalizer>,
    inventory: PointInventory,
    estimate: Option<DepthEstimate>,
    registry: Option<OctreeRegistry>,
    hierarchy: HierarchyWriter,
    rng: ChaCha8Rng,
    spill_dir: Option<PathBuf>,
    sweep_pending: bool,
    streamed: u64,
    report: BuildReport,
}

impl ClusterBuilder {
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            state: BuildState::Pass1Scanning,
            header: None,
            geometry: None,
            finalizer: None,
            inventory: PointInventory::new(),
            estimate: None,
            registry: None,
            hierarchy: HierarchyWriter::new(),
            rng,
            spill_dir: None,
            sweep_pending: false,
            streamed: 0,
            report: BuildReport::default(),
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Header of the scanned input
    pub fn header(&self) -> Option<&CloudHeader> {
        self.header.as_ref()
    }

    pub fn geometry(&self) -> Option<&OctreeGeometry> {
        self.geometry.as_ref()
    }

    pub fn estimate(&self) -> Option<&DepthEstimate> {
        self.estimate.as_ref()
    }

    pub fn hierarchy(&self) -> &HierarchyWriter {
        &self.hierarchy
    }

    fn expect_state(&self, expected: BuildState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Invariant(format!(
                "{} called in state {:?}, expected {:?}",
                operation, self.state, expected
            )))
        }
    }

    fn depth_for(&self, point_count: u64) -> u32 {
        self.config
            .max_depth
            .unwrap_or_else(|| OctreeGeometry::compute_max_depth(point_count, self.config.max_points_per_octant))
            .min(self.config.depth_limit)
    }

    /// Scan every point once and estimate the octree parameters
    pub fn scan<S: PointSource + ?Sized>(&mut self, source: &mut S) -> Result<DepthEstimate> {
        self.expect_state(BuildState::Pass1Scanning, "scan")?;
        let started = Instant::now();
        let mut header = source.header().clone();

        if self.config.units.is_none() && header.looks_geographic() {
            return Err(Error::Config(format!(
                "{} seems to use longitude/latitude coordinates; reproject it or set the units explicitly",
                source.name()
            )));
        }
        if !header.has_gps_time {
            warn!("{} has no GPS time", source.name());
        }

        let mut finalizer = RegionFinalizer::for_depth(&header.bounds, self.depth_for(header.point_count))?;
        debug!(
            "Finalizer grid {:?} with resolution {:.3}",
            finalizer.dims(),
            finalizer.resolution()
        );
        let mut occupancy = OccupancyGrid::new(self.config.effective_occupancy_resolution());

        info!("Pass 1: scanning {}", source.name());
        source.seek(0)?;
        while let Some(point) = source.read_point()? {
            let position = point.position(&header.scaling);
            finalizer.add(position);
            occupancy.add(position);
            self.inventory.add(&point, position);
        }

        let point_count = self.inventory.count();
        if point_count == 0 {
            warn!("{} holds no points", source.name());
        } else if point_count != header.point_count {
            warn!(
                "{} announces {} points but {} were read",
                source.name(),
                header.point_count,
                point_count
            );
        }

        // The octree encloses what was read, whatever the header claimed
        let bounds = *self.inventory.bounds();
        if !bounds.is_empty() {
            if bounds != header.bounds {
                debug!(
                    "Header bounds {:?}..{:?} replaced by scanned {:?}..{:?}",
                    header.bounds.min, header.bounds.max, bounds.min, bounds.max
                );
            }
            header.bounds = bounds;
        }
        header.point_count = point_count;
        let geometry = OctreeGeometry::new(&header.bounds, self.config.root_grid_size);

        let max_depth = self.depth_for(point_count);
        let area = occupancy.area();
        let density = occupancy.density(point_count);
        let schedule = SwapSchedule::new(
            geometry.size(),
            self.config.root_grid_size,
            density,
            self.config.depth_limit,
            self.config.swap_event_probability,
            self.config.min_expected_population,
        );

        info!("Number of points: {}", point_count);
        info!("Area covered: {:.0} ({} cells)", area, occupancy.occupied_cells());
        info!("Point density: {:.2} points per square unit", density);
        info!("Max depth: {}", max_depth);
        for (level, p) in schedule.iter().enumerate().take(max_depth as usize + 1) {
            info!("Swap probability at level {}: {:.4}", level, p);
        }

        let estimate = DepthEstimate { point_count, max_depth, area, density, schedule };
        self.report.pass1_time = started.elapsed();
        self.header = Some(header);
        self.geometry = Some(geometry);
        self.finalizer = Some(finalizer);
        self.estimate = Some(estimate.clone());
        self.state = BuildState::DepthEstimated;
        Ok(estimate)
    }

    fn make_registry(&mut self, geometry: OctreeGeometry, record_len: usize) -> Result<OctreeRegistry> {
        let min_points = self.config.min_points_per_octant;
        match self.config.backend {
            Backend::InMemory => Ok(OctreeRegistry::in_memory(geometry, record_len, min_points)),
            Backend::OnDisk => {
                let dir = streaming::create_spill_dir(&self.config.spill_base())?;
                self.spill_dir = Some(dir.clone());
                let budget = FileBudget::shared(self.config.max_files);
                Ok(OctreeRegistry::on_disk(geometry, record_len, min_points, dir, budget))
            }
        }
    }

    /// Stream every point again through shuffled batches, writing finalized octants
    pub fn stream<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<()>
    where
        S: PointSource + ?Sized,
        K: PointSink + ?Sized,
    {
        self.expect_state(BuildState::DepthEstimated, "stream")?;
        self.state = BuildState::Pass2Streaming;
        let started = Instant::now();

        let (scaling, record_len) = match &self.header {
            Some(h) => (h.scaling, h.format.record_len()),
            None => return Err(Error::Invariant("stream without a scanned header".into())),
        };
        let geometry = self
            .geometry
            .ok_or_else(|| Error::Invariant("stream without octree geometry".into()))?;
        let registry = self.make_registry(geometry, record_len)?;
        self.registry = Some(registry);

        let mut buffer = ShuffleBuffer::new(record_len, self.config.effective_buffer_points());
        info!("Pass 2: clustering {}", source.name());

        if self.config.unordered {
            let root = SpatialKey::root();
            for child in root.children() {
                debug!("Filtered read for octant {}", child);
                source.seek(0)?;
                while let Some(point) = source.read_point()? {
                    if geometry.child_containing(&root, point.position(&scaling)) != child {
                        continue;
                    }
                    if buffer.push(point.bytes()) {
                        self.process_buffer(&mut buffer, sink)?;
                    }
                }
                self.process_buffer(&mut buffer, sink)?;
            }
        } else {
            source.seek(0)?;
            while let Some(point) = source.read_point()? {
                if buffer.push(point.bytes()) {
                    self.process_buffer(&mut buffer, sink)?;
                }
            }
            self.process_buffer(&mut buffer, sink)?;
        }

        self.report.pass2_time = started.elapsed();
        Ok(())
    }

    fn process_buffer<K: PointSink + ?Sized>(&mut self, buffer: &mut ShuffleBuffer, sink: &mut K) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let Self {
            config,
            header,
            geometry,
            finalizer,
            estimate,
            registry,
            hierarchy,
            rng,
            sweep_pending,
            streamed,
            ..
        } = self;
        let (Some(header), Some(geometry), Some(finalizer), Some(estimate), Some(registry)) =
            (header.as_ref(), geometry.as_ref(), finalizer.as_mut(), estimate.as_ref(), registry.as_mut())
        else {
            return Err(Error::Invariant("buffer processed outside pass 2".into()));
        };

        if config.shuffle {
            buffer.shuffle(&mut *rng);
        }

        let mut ctx = DescentContext {
            registry,
            geometry,
            scaling: &header.scaling,
            schedule: &estimate.schedule,
            rng,
            max_depth: estimate.max_depth,
            buffer_id: buffer.id(),
            swap: config.swap,
        };
        let mut point = vec![0u8; header.format.record_len()];
        for record in buffer.points().iter() {
            point.copy_from_slice(record);
            let position = PointView::new(&point).position(&header.scaling);
            if finalizer.remove(position)? {
                *sweep_pending = true;
            }
            descend(&mut point, &mut ctx)?;
        }
        let registry = ctx.registry;

        let processed = buffer.len();
        buffer.rotate();
        *streamed += processed as u64;

        if *sweep_pending {
            *sweep_pending = false;
            for (key, mut store) in registry.drain_finalized(finalizer, hierarchy)? {
                flush_octant(key, store.as_mut(), sink, hierarchy, config.sort)?;
            }
        }
        registry.enforce_file_budget()?;

        debug!(
            "Processed {} points ({} total), {} entries written, {} live octants, {} open files",
            processed,
            streamed,
            hierarchy.len(),
            registry.len(),
            registry.budget().open_count()
        );
        Ok(())
    }

    /// Write every remaining octant, the index and the COPC info, then close the sink
    pub fn finish<K: PointSink + ?Sized>(&mut self, sink: &mut K) -> Result<BuildReport> {
        self.expect_state(BuildState::Pass2Streaming, "finish")?;
        self.state = BuildState::Flushing;

        let registry = self
            .registry
            .as_mut()
            .ok_or_else(|| Error::Invariant("finish without a registry".into()))?;
        for (key, mut store) in registry.drain_all(&mut self.hierarchy)? {
            flush_octant(key, store.as_mut(), sink, &mut self.hierarchy, self.config.sort)?;
        }
        let octants_created = registry.created();
        let octants_promoted = registry.promoted();
        let peak_open_files = registry.budget().peak();

        let expected = self.inventory.count();
        let indexed = self.hierarchy.total_points();
        if indexed != expected || sink.npoints() != expected {
            return Err(Error::Invariant(format!(
                "point count mismatch: {} read in pass 1, {} indexed, {} written",
                expected,
                indexed,
                sink.npoints()
            )));
        }

        let info = self.copc_info()?;
        sink.update_header(&info, self.hierarchy.entries())?;
        let output_size = sink.close()?;
        self.release_spill();
        self.state = BuildState::Closed;

        let entries = self.hierarchy.entries();
        let counts: Vec<u64> = entries
            .iter()
            .filter(|e| e.point_count > 0)
            .map(|e| e.point_count as u64)
            .collect();
        let min_points = self.config.min_points_per_octant as u64;
        let report = BuildReport {
            point_count: expected,
            max_depth: self.estimate.as_ref().map_or(0, |e| e.max_depth),
            chunks: counts.len(),
            empty_entries: entries.len() - counts.len(),
            largest_chunk: counts.iter().copied().max().unwrap_or(0),
            smallest_chunk: counts.iter().copied().min().unwrap_or(0),
            small_chunks: counts.iter().filter(|&&n| n <= min_points).count(),
            octants_created,
            octants_promoted,
            peak_open_files,
            output_size,
            ..self.report.clone()
        };

        info!(
            "Wrote {} chunks and {} empty entries ({} bytes)",
            report.chunks, report.empty_entries, report.output_size
        );
        info!(
            "Largest chunk {} points, smallest {} points, {} at or below {}",
            report.largest_chunk, report.smallest_chunk, report.small_chunks, min_points
        );
        info!(
            "Pass 1 took {:.2?}, pass 2 took {:.2?}",
            report.pass1_time, report.pass2_time
        );
        self.report = report.clone();
        Ok(report)
    }

    fn copc_info(&self) -> Result<CopcInfo> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| Error::Invariant("COPC info without octree geometry".into()))?;
        let (gpstime_minimum, gpstime_maximum) = self.inventory.gps_range();
        Ok(CopcInfo {
            center: geometry.center(),
            halfsize: geometry.halfsize(),
            spacing: geometry.spacing(),
            root_hier_offset: 0,
            root_hier_size: 0,
            gpstime_minimum,
            gpstime_maximum,
        })
    }

    /// Both passes plus the final flush. `make_sink` opens the output once the header is known.
    pub fn run<S, K, F>(&mut self, source: &mut S, make_sink: F) -> Result<(BuildReport, K)>
    where
        S: PointSource + ?Sized,
        K: PointSink,
        F: FnOnce(&CloudHeader) -> Result<K>,
    {
        self.scan(source)?;
        let header = self
            .header
            .clone()
            .ok_or_else(|| Error::Invariant("scan finished without a header".into()))?;
        let mut sink = make_sink(&header)?;
        self.stream(source, &mut sink)?;
        let report = self.finish(&mut sink)?;
        Ok((report, sink))
    }

    fn release_spill(&mut self) {
        self.registry = None;
        if let Some(dir) = self.spill_dir.take() {
            if let Err(e) = streaming::remove_spill_dir(&dir) {
                warn!("Could not remove spill directory: {}", e);
            }
        }
    }
}

impl Drop for ClusterBuilder {
    fn drop(&mut self) {
        self.release_spill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copc::{ContainerReader, ContainerSink};
    use crate::core::types::DVec3;
    use crate::octant::Backend;
    use crate::math::Aabb;
    use crate::point::{MemorySink, MemorySource, Scaling};
    use rand::Rng;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Memory source that counts reads and can announce a different header
    struct TracedSource {
        inner: MemorySource,
        header: Option<CloudHeader>,
        reads: Rc<Cell<u64>>,
    }

    impl TracedSource {
        fn new(inner: MemorySource) -> Self {
            Self { inner, header: None, reads: Rc::new(Cell::new(0)) }
        }
    }

    impl PointSource for TracedSource {
        fn header(&self) -> &CloudHeader {
            self.header.as_ref().unwrap_or(self.inner.header())
        }

        fn read_point(&mut self) -> Result<Option<PointView<'_>>> {
            let point = self.inner.read_point()?;
            if point.is_some() {
                self.reads.set(self.reads.get() + 1);
            }
            Ok(point)
        }

        fn seek(&mut self, index: u64) -> Result<()> {
            self.inner.seek(index)
        }
    }

    /// Memory sink remembering how many points had been read when each chunk was sealed
    struct TracedSink {
        inner: MemorySink,
        reads: Rc<Cell<u64>>,
        reads_at_chunk: HashMap<u64, u64>,
    }

    impl PointSink for TracedSink {
        fn write_point(&mut self, record: &[u8]) -> Result<()> {
            self.inner.write_point(record)
        }

        fn tell(&self) -> u64 {
            self.inner.tell()
        }

        fn chunk(&mut self) -> Result<()> {
            self.reads_at_chunk.insert(self.inner.tell(), self.reads.get());
            self.inner.chunk()
        }

        fn update_header(&mut self, info: &CopcInfo, hierarchy: &[HierarchyEntry]) -> Result<()> {
            self.inner.update_header(info, hierarchy)
        }

        fn close(&mut self) -> Result<u64> {
            self.inner.close()
        }

        fn npoints(&self) -> u64 {
            self.inner.npoints()
        }
    }

    fn encloses(bbox: &Aabb, p: DVec3) -> bool {
        p.cmpge(bbox.min).all() && p.cmple(bbox.max).all()
    }

    fn scaling() -> Scaling {
        Scaling::new(DVec3::splat(0.0001), DVec3::ZERO)
    }

    fn random_cloud(n: usize, seed: u64) -> Vec<DVec3> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| DVec3::new(rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>()))
            .collect()
    }

    fn build(config: BuildConfig, positions: &[DVec3]) -> (BuildReport, MemorySink) {
        let mut source = MemorySource::from_positions(scaling(), positions).unwrap();
        let mut builder = ClusterBuilder::new(config).unwrap();
        builder
            .run(&mut source, |h| Ok(MemorySink::new(h.format.record_len())))
            .unwrap()
    }

    /// Coarse root grid and a dense occupancy estimate so points descend and swap
    fn small_octants() -> BuildConfig {
        BuildConfig {
            root_grid_size: 16,
            occupancy_resolution: Some(1.0),
            max_points_per_octant: 2_000,
            shuffle_buffer_points: 3_000,
            ..Default::default()
        }
    }

    /// GPS times of every written point; `from_positions` numbers points by index
    fn written_ids(sink: &MemorySink) -> Vec<u64> {
        let mut ids: Vec<u64> = sink
            .chunks()
            .iter()
            .flat_map(|(_, chunk)| (0..chunk.len()).map(move |i| chunk.view(i).gps_time() as u64))
            .collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_point_conservation() {
        let n = 20_000;
        let (report, sink) = build(small_octants(), &random_cloud(n, 1));

        assert_eq!(report.point_count, n as u64);
        assert_eq!(report.max_depth, 2);
        assert_eq!(sink.npoints(), n as u64);
        assert!(sink.is_closed());
        let total: i64 = sink.hierarchy().iter().map(|e| e.point_count as i64).sum();
        assert_eq!(total, n as i64);
        assert_eq!(written_ids(&sink), (0..n as u64).collect::<Vec<_>>());

        for entry in sink.hierarchy().iter().filter(|e| e.point_count > 0) {
            let chunk = sink.chunk_at(entry.offset).unwrap();
            assert_eq!(chunk.len(), entry.point_count as usize);
            assert_eq!(entry.byte_size as usize, chunk.len() * 30);
        }
    }

    #[test]
    fn test_depth_bound_and_small_chunk_elimination() {
        let config = small_octants();
        let min = config.min_points_per_octant as i32;
        let (report, sink) = build(config, &random_cloud(20_000, 2));

        for entry in sink.hierarchy() {
            assert!(entry.key.depth as u32 <= report.max_depth);
            if !entry.key.is_root() && entry.point_count > 0 {
                assert!(entry.point_count > min, "{:?}", entry);
            }
        }
        assert_eq!(report.small_chunks, 0);
    }

    #[test]
    fn test_empty_entries_keep_tree_connected() {
        let (_, sink) = build(small_octants(), &random_cloud(20_000, 3));
        let keys: HashMap<SpatialKey, i32> =
            sink.hierarchy().iter().map(|e| (e.key, e.point_count)).collect();
        for key in keys.keys() {
            if let Some(parent) = key.parent() {
                assert!(keys.contains_key(&parent), "{} has no parent entry", key);
            }
        }
    }

    #[test]
    fn test_identical_points() {
        let positions = vec![DVec3::new(5.0, 5.0, 5.0); 1000];
        let config = BuildConfig { max_depth: Some(3), swap: false, ..Default::default() };
        let (report, sink) = build(config, &positions);

        let by_depth: HashMap<u8, i32> =
            sink.hierarchy().iter().map(|e| (e.key.depth, e.point_count)).collect();
        assert_eq!(sink.hierarchy().len(), 4);
        assert_eq!(by_depth[&3], 997);
        assert_eq!(by_depth[&2], 0);
        assert_eq!(by_depth[&1], 0);
        assert_eq!(by_depth[&0], 3);
        assert_eq!(report.empty_entries, 2);
    }

    #[test]
    fn test_unit_cube_light_root() {
        let n = 5_000;
        let config = BuildConfig {
            max_depth: Some(2),
            shuffle: false,
            swap: false,
            ..Default::default()
        }
        .with_root_density(crate::builder::RootDensity::Light);
        let (report, sink) = build(config, &random_cloud(n, 4));

        assert_eq!(report.max_depth, 2);
        assert!(sink.hierarchy().len() <= 1 + 8 + 64);
        assert!(sink.hierarchy().iter().all(|e| e.key.depth <= 2));
        let total: i64 = sink.hierarchy().iter().map(|e| e.point_count as i64).sum();
        assert_eq!(total, n as i64);
    }

    #[test]
    fn test_same_seed_same_output() {
        let positions = random_cloud(10_000, 5);
        let config = BuildConfig { seed: 42, ..small_octants() };
        let (_, a) = build(config.clone(), &positions);
        let (_, b) = build(config, &positions);
        assert_eq!(a.hierarchy(), b.hierarchy());
        assert_eq!(a.chunks(), b.chunks());

        let plain = BuildConfig { shuffle: false, swap: false, ..small_octants() };
        let (_, c) = build(plain.clone(), &positions);
        let (_, d) = build(BuildConfig { seed: 7, ..plain }, &positions);
        assert_eq!(c.hierarchy(), d.hierarchy());
        assert_eq!(c.chunks(), d.chunks());
    }

    #[test]
    fn test_unordered_mode() {
        let n = 8_000;
        let config = BuildConfig { unordered: true, ..small_octants() };
        let (report, sink) = build(config, &random_cloud(n, 6));
        assert_eq!(report.point_count, n as u64);
        assert_eq!(written_ids(&sink), (0..n as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_on_disk_respects_file_budget() {
        let tmp = TempDir::new().unwrap();
        let n = 20_000;
        let config = BuildConfig {
            backend: Backend::OnDisk,
            max_files: 8,
            root_grid_size: 16,
            max_points_per_octant: 500,
            shuffle_buffer_points: 1_000,
            tmpdir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let (report, sink) = build(config, &random_cloud(n, 7));

        assert_eq!(written_ids(&sink), (0..n as u64).collect::<Vec<_>>());
        assert!(report.peak_open_files > 0);
        assert!(report.peak_open_files <= 8);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_backends_agree() {
        let tmp = TempDir::new().unwrap();
        let positions = random_cloud(6_000, 8);
        let memory = BuildConfig { seed: 3, ..small_octants() };
        // On-disk builds double the buffer
        let disk = BuildConfig {
            backend: Backend::OnDisk,
            tmpdir: Some(tmp.path().to_path_buf()),
            shuffle_buffer_points: 1_500,
            ..memory.clone()
        };

        let (_, a) = build(memory, &positions);
        let (_, b) = build(disk, &positions);
        assert_eq!(a.hierarchy(), b.hierarchy());
        assert_eq!(a.chunks(), b.chunks());
    }

    #[test]
    fn test_container_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cloud.copc");
        let n = 12_000;
        let mut source = MemorySource::from_positions(scaling(), &random_cloud(n, 9)).unwrap();
        let mut builder = ClusterBuilder::new(small_octants()).unwrap();
        let (report, _) = builder
            .run(&mut source, |h| ContainerSink::create(&path, h))
            .unwrap();
        assert_eq!(builder.state(), BuildState::Closed);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().point_count, n as u64);
        assert_eq!(reader.info().halfsize, builder.geometry().unwrap().halfsize());
        assert_eq!(report.output_size, std::fs::metadata(&path).unwrap().len());

        let mut total = 0;
        for entry in reader.hierarchy().unwrap() {
            total += reader.read_chunk(&entry).unwrap().len();
        }
        assert_eq!(total, n);
    }

    #[test]
    fn test_state_order_enforced() {
        let mut source = MemorySource::from_positions(scaling(), &random_cloud(10, 10)).unwrap();
        let mut sink = MemorySink::new(30);
        let mut builder = ClusterBuilder::new(BuildConfig::default()).unwrap();

        assert!(matches!(builder.finish(&mut sink), Err(Error::Invariant(_))));
        assert!(matches!(builder.stream(&mut source, &mut sink), Err(Error::Invariant(_))));
        builder.scan(&mut source).unwrap();
        assert_eq!(builder.state(), BuildState::DepthEstimated);
        assert!(matches!(builder.scan(&mut source), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BuildConfig { max_files: 0, ..Default::default() };
        assert!(matches!(ClusterBuilder::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_geographic_input_needs_units() {
        let positions: Vec<DVec3> = (0..100)
            .map(|i| DVec3::new(10.0 + i as f64 * 1e-5, 45.0 + i as f64 * 1e-5, i as f64))
            .collect();
        let fine = Scaling::new(DVec3::new(1e-7, 1e-7, 0.01), DVec3::ZERO);

        let mut source = MemorySource::from_positions(fine, &positions).unwrap();
        let mut builder = ClusterBuilder::new(BuildConfig::default()).unwrap();
        assert!(matches!(builder.scan(&mut source), Err(Error::Config(_))));

        let config = BuildConfig { units: Some(crate::builder::Units::Meters), ..Default::default() };
        let mut builder = ClusterBuilder::new(config).unwrap();
        assert!(builder.scan(&mut source).is_ok());
    }

    #[test]
    fn test_empty_input() {
        let (report, sink) = build(BuildConfig::default(), &[]);
        assert_eq!(report.point_count, 0);
        assert_eq!(report.chunks, 0);
        assert!(sink.hierarchy().is_empty());
        assert!(sink.info().is_some());
    }

    #[test]
    fn test_estimate_reports_density() {
        let mut source = MemorySource::from_positions(scaling(), &random_cloud(1_000, 11)).unwrap();
        let mut builder = ClusterBuilder::new(BuildConfig::default()).unwrap();
        let estimate = builder.scan(&mut source).unwrap();
        assert_eq!(estimate.point_count, 1_000);
        assert_eq!(estimate.max_depth, 0);
        // One 50x50 occupancy cell
        assert!((estimate.density - 1_000.0 / 2_500.0).abs() < 1e-9);
        assert_eq!(estimate.schedule.levels(), 11);
    }

    #[test]
    fn test_octree_encloses_points_beyond_header_bounds() {
        let positions: Vec<DVec3> = (0..2_000)
            .map(|i| DVec3::new((i % 50) as f64 * 2.0, (i / 50) as f64 * 2.0, 0.0))
            .collect();
        let inner = MemorySource::from_positions(scaling(), &positions).unwrap();
        let mut stale = inner.header().clone();
        stale.bounds = Aabb::new(DVec3::ZERO, DVec3::new(10.0, 10.0, 0.0));
        let mut source = TracedSource { header: Some(stale), ..TracedSource::new(inner) };

        let mut builder = ClusterBuilder::new(small_octants()).unwrap();
        let (_, sink) = builder
            .run(&mut source, |h| Ok(MemorySink::new(h.format.record_len())))
            .unwrap();

        let scanned = builder.header().unwrap().bounds;
        assert!((scanned.max.x - 98.0).abs() < 1e-6);
        assert!((scanned.max.y - 78.0).abs() < 1e-6);

        let cube = *builder.geometry().unwrap().cube();
        let padded = Aabb::new(cube.min - 1e-6, cube.max + 1e-6);
        for p in &positions {
            assert!(encloses(&padded, *p), "{:?} outside {:?}", p, cube);
        }
        let info = sink.info().unwrap();
        assert!((info.halfsize - 49.0).abs() < 1e-6);
        assert!((info.center - DVec3::new(49.0, 39.0, 0.0)).length() < 1e-6);
        assert_eq!(written_ids(&sink), (0..2_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_octants_flush_only_after_their_region_is_read() {
        let n = 20_000;
        let mut positions = random_cloud(n, 12);
        positions.sort_by(|a, b| a.x.total_cmp(&b.x));
        let mut source = TracedSource::new(MemorySource::from_positions(scaling(), &positions).unwrap());
        let reads = Rc::clone(&source.reads);

        let mut builder = ClusterBuilder::new(small_octants()).unwrap();
        let (_, sink) = builder
            .run(&mut source, |h| {
                Ok(TracedSink {
                    inner: MemorySink::new(h.format.record_len()),
                    reads,
                    reads_at_chunk: HashMap::new(),
                })
            })
            .unwrap();

        let cube = *builder.geometry().unwrap().cube();
        let decoded: Vec<DVec3> = (0..n)
            .map(|i| source.inner.points().view(i).position(&scaling()))
            .collect();

        let mut early = 0;
        for entry in sink.inner.hierarchy().iter().filter(|e| e.point_count > 0) {
            // Pass 1 read every point once before pass 2 started
            let read = sink.reads_at_chunk[&entry.offset] - n as u64;
            if read < n as u64 {
                early += 1;
            }
            let bbox = entry.key.bbox(&cube);
            for (i, p) in decoded.iter().enumerate() {
                if encloses(&bbox, *p) {
                    assert!((i as u64) < read, "octant {} written before point {} was read", entry.key, i);
                }
            }
        }
        assert!(early > 0);
    }
}
