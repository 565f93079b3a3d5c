// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Named shared segments and their manager.
//!
//! A segment is a fixed slab of `f64` cells stored as atomic bit patterns.
//! One context writes a segment, any number read it; there are no locks on
//! the cell path. The manager tracks segments by name for the lifetime of
//! the process that owns it; dropping the manager releases every tracked
//! segment that no view still holds.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of a shared segment; the only cross-context identity of shared data.
pub type SegmentName = String;

/// A fixed slab of atomically accessed `f64` cells.
pub struct Segment {
    name: SegmentName,
    cells: Box<[AtomicU64]>,
}

impl Segment {
    fn new(name: SegmentName, len: usize) -> Self {
        let cells = (0..len)
            .map(|_| AtomicU64::new(f64::NAN.to_bits()))
            .collect();
        Self { name, cells }
    }

    /// The segment's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the segment has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reads one cell. Release/acquire pairing with [`Segment::store`] makes
    /// a value committed before a notification visible to the notified
    /// reader; whole-record reads may still tear across cells.
    #[must_use]
    pub fn load(&self, cell: usize) -> f64 {
        f64::from_bits(self.cells[cell].load(Ordering::Acquire))
    }

    /// Writes one cell.
    pub fn store(&self, cell: usize, value: f64) {
        self.cells[cell].store(value.to_bits(), Ordering::Release);
    }
}

/// Allocates named segments and tracks their lifetime.
///
/// Cloning the manager clones a handle to the same registry, which is how
/// the orchestrator and every context worker see the same segments.
#[derive(Clone, Default)]
pub struct SegmentManager {
    segments: Arc<Mutex<HashMap<SegmentName, Arc<Segment>>>>,
}

impl SegmentManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a NaN-filled segment of `len` cells under a fresh name.
    #[must_use]
    pub fn create(&self, len: usize) -> Arc<Segment> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("seg-{}", &id[..12]);
        let segment = Arc::new(Segment::new(name.clone(), len));
        let _ = self.segments.lock().insert(name, segment.clone());
        segment
    }

    /// Resolves a tracked segment by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSegment`] when the name is not tracked.
    pub fn open(&self, name: &str) -> Result<Arc<Segment>, Error> {
        self.segments
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownSegment {
                name: name.to_owned(),
            })
    }

    /// Stops tracking a segment. Views already holding the segment keep it
    /// alive; new `open` calls fail.
    pub fn release(&self, name: &str) {
        let _ = self.segments.lock().remove(name);
    }

    /// Number of tracked segments.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.segments.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_release() {
        let manager = SegmentManager::new();
        let segment = manager.create(4);
        assert_eq!(segment.len(), 4);
        assert!(segment.load(0).is_nan());

        let view = manager.open(segment.name()).expect("tracked");
        view.store(2, 7.5);
        assert_eq!(segment.load(2), 7.5);

        manager.release(segment.name());
        assert!(matches!(
            manager.open(segment.name()),
            Err(Error::UnknownSegment { .. })
        ));
        // The released segment stays usable through live views.
        assert_eq!(view.load(2), 7.5);
    }

    #[test]
    fn clones_share_the_registry() {
        let manager = SegmentManager::new();
        let peer = manager.clone();
        let segment = manager.create(1);
        assert!(peer.open(segment.name()).is_ok());
        assert_eq!(peer.tracked(), 1);
    }

    #[test]
    fn names_are_unique() {
        let manager = SegmentManager::new();
        let a = manager.create(1);
        let b = manager.create(1);
        assert_ne!(a.name(), b.name());
    }
}
