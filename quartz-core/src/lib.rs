// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command-submission runtime core.
//!
//! Command lists encode kernel launches, copies, fills and synchronization
//! into a chained linear instruction stream; command queues submit closed
//! lists to the device in FIFO order; events track completion and
//! timestamps; the printf registry defers kernel console output to the
//! next synchronization point.

pub mod cmdlist;
pub mod device;
pub mod event;
pub mod kernel;
pub mod memory;
pub mod printf;
pub mod queue;
pub mod residency;
pub mod stream;

pub use cmdlist::{CommandList, ExecutionMode, OrderingMode};
pub use device::{Device, DeviceBackend, SoftDevice};
pub use event::{Event, EventPool, EventPoolDesc, EventScope};
pub use kernel::{Kernel, KernelDescriptor, Module};
pub use memory::{DeviceAllocator, Memory, SystemAllocator};
pub use queue::CommandQueue;
pub use residency::ResidencyTracker;
