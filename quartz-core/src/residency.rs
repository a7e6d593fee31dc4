// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Residency tracking.
//!
//! Every allocation an encoded instruction references must be made
//! resident before the buffer executes. The tracker is an ordered,
//! duplicate-free set keyed by allocation identity; every encode call
//! that touches memory inserts here as a side effect.

use std::collections::HashSet;

use quartz_common::AllocationHandle;

/// Ordered duplicate-free set of allocations for one command list.
#[derive(Default)]
pub struct ResidencyTracker {
    order: Vec<AllocationHandle>,
    seen: HashSet<u64>,
}

impl ResidencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Returns `true` if the handle was new.
    pub fn add(&mut self, handle: AllocationHandle) -> bool {
        if self.seen.insert(handle.id) {
            self.order.push(handle);
            true
        } else {
            false
        }
    }

    pub fn has(&self, handle: &AllocationHandle) -> bool {
        self.seen.contains(&handle.id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The deduplicated sequence consumed by queue submission.
    pub fn snapshot(&self) -> &[AllocationHandle] {
        &self.order
    }

    /// Discard everything; used only by list reset.
    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_common::AllocKind;

    fn handle(id: u64) -> AllocationHandle {
        AllocationHandle {
            id,
            gpu_addr: 0x1000 * id,
            size: 0x100,
            kind: AllocKind::DeviceLocal,
        }
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut tracker = ResidencyTracker::new();
        assert!(tracker.add(handle(1)));
        assert!(!tracker.add(handle(1)));
        assert!(tracker.add(handle(2)));
        assert!(!tracker.add(handle(1)));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_snapshot_preserves_insert_order() {
        let mut tracker = ResidencyTracker::new();
        tracker.add(handle(3));
        tracker.add(handle(1));
        tracker.add(handle(2));
        let ids: Vec<u64> = tracker.snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_has_and_clear() {
        let mut tracker = ResidencyTracker::new();
        tracker.add(handle(7));
        assert!(tracker.has(&handle(7)));
        assert!(!tracker.has(&handle(8)));
        tracker.clear();
        assert!(tracker.is_empty());
        assert!(!tracker.has(&handle(7)));
    }
}
