// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deferred printf output registry.
//!
//! Kernels in flight that produced console output are held by weak
//! reference until the next synchronization point. A destroyed kernel
//! resolves to a no-op removal; a device hang is passed through to the
//! drain so output is marked rather than silently dropped.

use std::sync::{Arc, Weak};

use crate::kernel::Kernel;

#[derive(Default)]
pub struct PrintfRegistry {
    entries: Vec<Weak<Kernel>>,
}

impl PrintfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weak insert, deduplicated by kernel identity. Returns `true` if
    /// the kernel was newly registered.
    pub fn register_if_absent(&mut self, kernel: &Arc<Kernel>) -> bool {
        let weak = Arc::downgrade(kernel);
        if self.entries.iter().any(|e| e.ptr_eq(&weak)) {
            return false;
        }
        self.entries.push(weak);
        true
    }

    /// Merge registrations from another container (queue submission path).
    pub fn extend_from(&mut self, entries: &[Weak<Kernel>]) {
        for weak in entries {
            if !self.entries.iter().any(|e| e.ptr_eq(weak)) {
                self.entries.push(weak.clone());
            }
        }
    }

    pub fn entries(&self) -> &[Weak<Kernel>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every live kernel's drain routine, then clear the registry.
    /// Returns the number of kernels drained.
    pub fn drain_all(&mut self, hang_detected: bool) -> usize {
        let mut drained = 0;
        for weak in self.entries.drain(..) {
            if let Some(kernel) = weak.upgrade() {
                kernel.print_output(hang_detected);
                drained += 1;
            }
        }
        drained
    }

    /// Drop all registrations without draining; used only by list reset.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
