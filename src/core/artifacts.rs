//! Per-run artifact aggregation.
//!
//! Every task call reserves a slot when it is issued; its artifacts are filled
//! in when it completes. `all()` flattens the slots in reservation order, so
//! the list follows call order even when concurrent tasks finish out of order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::domain::Artifact;

/// Position reserved for one contributor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArtifactSlot(u64);

/// Append-only, ordered artifact list for one run
#[derive(Debug, Default)]
pub struct ArtifactAggregator {
    inner: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    next: u64,
    filled: BTreeMap<u64, Vec<Artifact>>,
}

impl ArtifactAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next position in call order
    pub fn reserve(&self) -> ArtifactSlot {
        let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = ArtifactSlot(slots.next);
        slots.next += 1;
        slot
    }

    /// Add artifacts at a reserved position
    pub fn fill(&self, slot: ArtifactSlot, artifacts: Vec<Artifact>) {
        if artifacts.is_empty() {
            return;
        }
        let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.filled.entry(slot.0).or_default().extend(artifacts);
    }

    /// Append artifacts at the end of the current order
    pub fn append(&self, artifacts: Vec<Artifact>) {
        let slot = self.reserve();
        self.fill(slot, artifacts);
    }

    /// Every artifact collected so far, in order, duplicates included
    pub fn all(&self) -> Vec<Artifact> {
        let slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.filled.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.filled.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
