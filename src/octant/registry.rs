//! Live octants of one build
//!
//! Keys are kept in a `BTreeMap` so a reverse scan visits the deepest
//! octants first: children are drained before their parents, which lets
//! small finalized octants fold their points into a still-live ancestor.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, trace};

use crate::copc::HierarchyWriter;
use crate::core::types::Result;
use crate::core::Error;
use crate::octree::{OctreeGeometry, RegionFinalizer, SpatialKey};
use crate::streaming::FileBudget;

use super::{Backend, DiskOctant, MemoryOctant, OctantStore};

/// A finalized octant removed from the registry, ready to be written
pub type DrainedOctant = (SpatialKey, Box<dyn OctantStore>);

struct Slot {
    store: Box<dyn OctantStore>,
    last_touch: u64,
}

/// Owner of every live octant, keyed by `SpatialKey`
pub struct OctreeRegistry {
    octants: BTreeMap<SpatialKey, Slot>,
    geometry: OctreeGeometry,
    record_len: usize,
    backend: Backend,
    spill_dir: Option<PathBuf>,
    budget: Rc<FileBudget>,
    min_points: usize,
    tick: u64,
    created: u64,
    promoted: u64,
}

impl OctreeRegistry {
    /// Registry of in-memory octants
    pub fn in_memory(geometry: OctreeGeometry, record_len: usize, min_points: usize) -> Self {
        Self {
            octants: BTreeMap::new(),
            geometry,
            record_len,
            backend: Backend::InMemory,
            spill_dir: None,
            budget: FileBudget::shared(usize::MAX),
            min_points,
            tick: 0,
            created: 0,
            promoted: 0,
        }
    }

    /// Registry of octants spilled to `spill_dir`, bounded by `budget`
    pub fn on_disk(
        geometry: OctreeGeometry,
        record_len: usize,
        min_points: usize,
        spill_dir: PathBuf,
        budget: Rc<FileBudget>,
    ) -> Self {
        Self {
            backend: Backend::OnDisk,
            spill_dir: Some(spill_dir),
            budget,
            ..Self::in_memory(geometry, record_len, min_points)
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn geometry(&self) -> &OctreeGeometry {
        &self.geometry
    }

    pub fn budget(&self) -> &Rc<FileBudget> {
        &self.budget
    }

    /// Live octants
    pub fn len(&self) -> usize {
        self.octants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octants.is_empty()
    }

    pub fn contains(&self, key: &SpatialKey) -> bool {
        self.octants.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SpatialKey> {
        self.octants.keys()
    }

    /// Octants instantiated since the start of the build
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Small octants folded into an ancestor
    pub fn promoted(&self) -> u64 {
        self.promoted
    }

    fn make_store(&self, key: &SpatialKey) -> Result<Box<dyn OctantStore>> {
        match (self.backend, &self.spill_dir) {
            (Backend::InMemory, _) => Ok(Box::new(MemoryOctant::new(self.record_len))),
            (Backend::OnDisk, Some(dir)) => Ok(Box::new(DiskOctant::create(
                dir,
                *key,
                self.record_len,
                Rc::clone(&self.budget),
            )?)),
            (Backend::OnDisk, None) => {
                Err(Error::Invariant("on-disk registry without a spill directory".into()))
            }
        }
    }

    /// Octant for `key`, created on first reference and reactivated if needed
    pub fn get_or_create(&mut self, key: SpatialKey) -> Result<&mut dyn OctantStore> {
        if !self.octants.contains_key(&key) {
            let store = self.make_store(&key)?;
            self.octants.insert(key, Slot { store, last_touch: 0 });
            self.created += 1;
            trace!("Created octant {}", key);
        }
        self.touch(key)
    }

    fn touch(&mut self, key: SpatialKey) -> Result<&mut dyn OctantStore> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self
            .octants
            .get_mut(&key)
            .ok_or_else(|| Error::Invariant(format!("octant {} is not live", key)))?;
        slot.last_touch = tick;
        if !slot.store.is_active() {
            slot.store.activate()?;
        }
        Ok(slot.store.as_mut())
    }

    /// Remove every octant whose region is finalized.
    ///
    /// Small non-root octants are folded into their nearest live ancestor
    /// instead of being returned; when such an octant already has a child
    /// in the hierarchy, an empty entry keeps the tree traversable.
    pub fn drain_finalized(
        &mut self,
        finalizer: &RegionFinalizer,
        hierarchy: &mut HierarchyWriter,
    ) -> Result<Vec<DrainedOctant>> {
        let candidates: Vec<SpatialKey> = self
            .octants
            .keys()
            .rev()
            .filter(|key| finalizer.is_finalized(&self.geometry.key_bounds(key)))
            .copied()
            .collect();
        self.drain(candidates, hierarchy)
    }

    /// Remove every remaining octant, applying the same small-chunk rule
    pub fn drain_all(&mut self, hierarchy: &mut HierarchyWriter) -> Result<Vec<DrainedOctant>> {
        let candidates: Vec<SpatialKey> = self.octants.keys().rev().copied().collect();
        self.drain(candidates, hierarchy)
    }

    fn drain(
        &mut self,
        candidates: Vec<SpatialKey>,
        hierarchy: &mut HierarchyWriter,
    ) -> Result<Vec<DrainedOctant>> {
        let mut drained = Vec::new();
        let mut to_flush: HashSet<SpatialKey> = HashSet::new();

        for key in candidates {
            let Some(slot) = self.octants.remove(&key) else {
                continue;
            };
            let mut store = slot.store;

            if !key.is_root() && store.npoints() <= self.min_points {
                if let Some(ancestor) = key.ancestors().find(|a| self.octants.contains_key(a)) {
                    self.promote(key, store.as_mut(), ancestor)?;
                    let has_children = hierarchy.has_child_entries(&key)
                        || key.children().iter().any(|child| to_flush.contains(child));
                    if has_children {
                        hierarchy.record_empty(key);
                    }
                    continue;
                }
            }

            to_flush.insert(key);
            drained.push((key, store));
        }
        Ok(drained)
    }

    /// Move every point of `child` into `ancestor`, then release `child`
    fn promote(&mut self, key: SpatialKey, child: &mut dyn OctantStore, ancestor: SpatialKey) -> Result<()> {
        child.load()?;
        let points = child.points()?;
        trace!("Promoting {} points from {} to {}", points.len(), key, ancestor);
        let target = self.touch(ancestor)?;
        for record in points.iter() {
            target.insert(record, None, 0)?;
        }
        child.clean()?;
        self.promoted += 1;
        Ok(())
    }

    /// Deactivate least recently touched octants while too many files are open.
    ///
    /// Runs at buffer boundaries only. Returns the number of octants deactivated.
    pub fn enforce_file_budget(&mut self) -> Result<usize> {
        if self.backend != Backend::OnDisk || !self.budget.over_soft_limit() {
            return Ok(0);
        }
        let target = self.budget.soft_limit() / 2;
        let mut open: Vec<(u64, SpatialKey)> = self
            .octants
            .iter()
            .filter(|(_, slot)| slot.store.has_open_handle())
            .map(|(key, slot)| (slot.last_touch, *key))
            .collect();
        open.sort_unstable();

        let before = self.budget.open_count();
        let mut deactivated = 0;
        for (_, key) in open {
            if self.budget.open_count() <= target {
                break;
            }
            if let Some(slot) = self.octants.get_mut(&key) {
                slot.store.deactivate()?;
                deactivated += 1;
            }
        }
        debug!(
            "File budget sweep: deactivated {} octants, open files {} -> {} (soft limit {})",
            deactivated,
            before,
            self.budget.open_count(),
            self.budget.soft_limit()
        );
        Ok(deactivated)
    }
}
