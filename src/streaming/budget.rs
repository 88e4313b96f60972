//! File descriptor budget for spilled octants
//!
//! Tracks how many octant spill files are open at once. The hard ceiling is
//! never exceeded; the soft limit (half the ceiling) tells the registry when
//! to start closing the least recently used octants.

use std::cell::Cell;
use std::rc::Rc;

use crate::core::types::Result;
use crate::core::Error;

/// Open-file budget shared by every on-disk octant of one build
///
/// Counters use interior mutability so octants can hold an `Rc` to the
/// budget while the registry inspects it.
#[derive(Debug)]
pub struct FileBudget {
    /// Hard ceiling on simultaneously open handles
    ceiling: usize,
    /// Level above which the registry deactivates octants
    soft_limit: usize,
    /// Currently open handles
    open: Cell<usize>,
    /// Highest value `open` ever reached
    peak: Cell<usize>,
}

impl FileBudget {
    /// Create a new file budget
    ///
    /// # Arguments
    /// * `max_files` - Maximum number of simultaneously open spill files
    pub fn new(max_files: usize) -> Self {
        let ceiling = max_files.max(1);
        Self {
            ceiling,
            soft_limit: (ceiling / 2).max(1),
            open: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    /// Shared handle for octants and the registry
    pub fn shared(max_files: usize) -> Rc<Self> {
        Rc::new(Self::new(max_files))
    }

    // --- Tracking methods ---

    /// Account for one newly opened handle
    ///
    /// Fails when the ceiling is already reached: callers must close a
    /// handle first.
    pub fn acquire(&self) -> Result<()> {
        let open = self.open.get();
        if open >= self.ceiling {
            return Err(Error::Invariant(format!(
                "file budget exhausted: {} of {} handles open",
                open, self.ceiling
            )));
        }
        self.open.set(open + 1);
        self.peak.set(self.peak.get().max(open + 1));
        Ok(())
    }

    /// Account for one closed handle
    pub fn release(&self) {
        self.open.set(self.open.get().saturating_sub(1));
    }

    /// Reserve a handle for the lifetime of the returned guard
    pub fn hold(&self) -> Result<BudgetGuard<'_>> {
        self.acquire()?;
        Ok(BudgetGuard { budget: self })
    }

    // --- Query methods ---

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn open_count(&self) -> usize {
        self.open.get()
    }

    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    // --- Decision methods ---

    /// No further handle may be opened
    pub fn is_saturated(&self) -> bool {
        self.open.get() >= self.ceiling
    }

    /// Open handles exceed the soft limit; octants should be deactivated
    pub fn over_soft_limit(&self) -> bool {
        self.open.get() > self.soft_limit
    }
}

/// A handle reservation released on drop
#[derive(Debug)]
pub struct BudgetGuard<'a> {
    budget: &'a FileBudget,
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        self.budget.release();
    }
}
