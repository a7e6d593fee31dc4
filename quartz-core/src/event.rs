// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Events and event pools.
//!
//! An event pool owns one host-visible allocation subdivided into
//! fixed-size packets. Each event spans a fixed number of consecutive
//! packets; a binding operation may consume fewer packets than allocated,
//! never more. The completion field of a host-visible event is a plain
//! memory address the host polls without device interaction.
//!
//! ## Packet Layout (64 bytes)
//!
//! | Offset | Field          |
//! |--------|----------------|
//! | 0      | completion u32 |
//! | 8      | global-start   |
//! | 16     | context-start  |
//! | 24     | global-end     |
//! | 32     | context-end    |

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use quartz_common::settings::PacketPolicy;
use quartz_common::{AllocKind, AllocationHandle, GpuAddr, Result, Status};
use quartz_hw::FlushScope;

use crate::device::Device;
use crate::kernel::Kernel;
use crate::memory::DeviceAllocator;

/// Bytes per completion-tracking packet.
pub const PACKET_SIZE: u64 = 64;

pub const OFF_COMPLETION: u64 = 0;
pub const OFF_GLOBAL_START: u64 = 8;
pub const OFF_CTX_START: u64 = 16;
pub const OFF_GLOBAL_END: u64 = 24;
pub const OFF_CTX_END: u64 = 32;

/// Completion field value while the event is unsignaled.
pub const STATE_CLEARED: u32 = 0xFFFF_FFFF;
/// Completion field value written by a plain signal.
pub const STATE_SIGNALED: u32 = 1;

/// Visibility scope of an event signal or wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    None,
    DeviceOnly,
    HostVisible,
}

impl EventScope {
    /// Flush scope the signaling write uses.
    pub fn flush(self) -> FlushScope {
        match self {
            EventScope::None => FlushScope::None,
            EventScope::DeviceOnly => FlushScope::Device,
            EventScope::HostVisible => FlushScope::Host,
        }
    }

    pub fn needs_flush(self) -> bool {
        self != EventScope::None
    }
}

#[derive(Debug, Clone)]
pub struct EventPoolDesc {
    pub events: u32,
    pub packets_per_event: u32,
    pub host_visible: bool,
    pub timestamps: bool,
}

impl Default for EventPoolDesc {
    fn default() -> Self {
        Self {
            events: 1,
            packets_per_event: 1,
            host_visible: true,
            timestamps: false,
        }
    }
}

/// Pool of event packets backed by one allocation.
pub struct EventPool {
    device: Arc<Device>,
    alloc: AllocationHandle,
    desc: EventPoolDesc,
    policy: PacketPolicy,
    slots: Mutex<Vec<bool>>,
}

impl EventPool {
    pub fn new(device: &Arc<Device>, desc: EventPoolDesc) -> Result<Arc<EventPool>> {
        if desc.events == 0 || desc.packets_per_event == 0 {
            return Err(Status::InvalidArgument);
        }
        let kind = if desc.host_visible {
            AllocKind::HostVisible
        } else {
            AllocKind::DeviceLocal
        };
        let size = desc.events as u64 * desc.packets_per_event as u64 * PACKET_SIZE;
        let alloc = device.allocator().allocate(size, PACKET_SIZE, kind)?;
        // All completion fields start cleared. Timestamp pools track
        // completion in the context-end slot, so clear that one too.
        for packet in 0..desc.events as u64 * desc.packets_per_event as u64 {
            let base = alloc.gpu_addr + packet * PACKET_SIZE;
            device.memory().write_u32(base + OFF_COMPLETION, STATE_CLEARED);
            if desc.timestamps {
                device.memory().write_u32(base + OFF_CTX_END, STATE_CLEARED);
            }
        }
        let policy = device.packet_policy();
        Ok(Arc::new(Self {
            device: device.clone(),
            alloc,
            slots: Mutex::new(vec![false; desc.events as usize]),
            desc,
            policy,
        }))
    }

    pub fn allocation(&self) -> AllocationHandle {
        self.alloc
    }

    pub fn packet_policy(&self) -> PacketPolicy {
        self.policy
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn host_visible(&self) -> bool {
        self.desc.host_visible
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        self.device.allocator().free(&self.alloc);
    }
}

/// Timestamps captured around a profiled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTimestamps {
    pub global_start: u64,
    pub context_start: u64,
    pub global_end: u64,
    pub context_end: u64,
}

impl KernelTimestamps {
    /// Wall-clock ticks, wrap-safe.
    pub fn global_duration(&self) -> u64 {
        self.global_end.wrapping_sub(self.global_start)
    }

    /// Ticks while this context was active on the engine, wrap-safe.
    pub fn context_duration(&self) -> u64 {
        self.context_end.wrapping_sub(self.context_start)
    }
}

/// One completion-tracking event carved from a pool slot.
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    packet_count: u32,
    packets_in_use: AtomicU32,
    signal_scope: EventScope,
    wait_scope: EventScope,
    /// Kernel whose printf buffer must drain when this event completes.
    printf_kernel: Mutex<Option<Weak<Kernel>>>,
    /// Id of the command list currently holding this event as a signal
    /// target; 0 when unbound.
    binder: AtomicU64,
}

impl Event {
    pub fn create(
        pool: &Arc<EventPool>,
        index: u32,
        signal_scope: EventScope,
        wait_scope: EventScope,
    ) -> Result<Arc<Event>> {
        if index >= pool.desc.events {
            return Err(Status::InvalidArgument);
        }
        {
            let mut slots = pool.slots.lock();
            if slots[index as usize] {
                return Err(Status::InvalidArgument);
            }
            slots[index as usize] = true;
        }
        Ok(Arc::new(Self {
            pool: pool.clone(),
            index,
            packet_count: pool.desc.packets_per_event,
            packets_in_use: AtomicU32::new(1),
            signal_scope,
            wait_scope,
            printf_kernel: Mutex::new(None),
            binder: AtomicU64::new(0),
        }))
    }

    pub fn signal_scope(&self) -> EventScope {
        self.signal_scope
    }

    pub fn wait_scope(&self) -> EventScope {
        self.wait_scope
    }

    pub fn has_timestamps(&self) -> bool {
        self.pool.desc.timestamps
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub fn allocation(&self) -> AllocationHandle {
        self.pool.alloc
    }

    /// Base device address of this event's first packet.
    pub fn base_addr(&self) -> GpuAddr {
        self.pool.alloc.gpu_addr + self.index as u64 * self.packet_count as u64 * PACKET_SIZE
    }

    pub fn packet_addr(&self, packet: u32) -> GpuAddr {
        self.base_addr() + packet as u64 * PACKET_SIZE
    }

    /// Offset of the completion field inside a packet. Timestamp events
    /// reuse the context-end slot as their completion field.
    pub fn completion_offset(&self) -> u64 {
        if self.has_timestamps() {
            OFF_CTX_END
        } else {
            OFF_COMPLETION
        }
    }

    /// Address the signal writes and wait predicates compare against.
    pub fn completion_addr(&self, packet: u32) -> GpuAddr {
        self.packet_addr(packet) + self.completion_offset()
    }

    pub fn max_packets(&self) -> u32 {
        self.packet_count
    }

    pub fn packets_in_use(&self) -> u32 {
        self.packets_in_use.load(Ordering::Acquire)
    }

    /// Record how many packets a binding operation consumed, clamped to
    /// the fixed packet count.
    pub(crate) fn consume_packets(&self, ops: u32, policy: PacketPolicy) -> u32 {
        let used = match policy {
            PacketPolicy::FirstPacketOnly => 1,
            PacketPolicy::SignalAll => ops.clamp(1, self.packet_count),
        };
        self.packets_in_use.store(used, Ordering::Release);
        used
    }

    pub(crate) fn set_printf_kernel(&self, kernel: Weak<Kernel>) {
        *self.printf_kernel.lock() = Some(kernel);
    }

    /// Claim this event as the signal target of list `list_id`.
    pub(crate) fn try_bind(&self, list_id: u64) -> Result<()> {
        match self
            .binder
            .compare_exchange(0, list_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == list_id => Ok(()),
            Err(_) => {
                log::warn!("event {}: already bound as a signal target", self.index);
                Err(Status::InvalidArgument)
            }
        }
    }

    pub(crate) fn release_binding(&self, list_id: u64) {
        let _ = self
            .binder
            .compare_exchange(list_id, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Non-blocking completion check.
    pub fn query_status(&self) -> Result<()> {
        let memory = self.pool.device.memory();
        let used = self.packets_in_use();
        for packet in 0..used {
            if memory.read_u32(self.completion_addr(packet)) == STATE_CLEARED {
                return Err(Status::NotReady);
            }
        }
        Ok(())
    }

    /// Block until signaled, the timeout expires, or the device is lost.
    ///
    /// On success (and on hang) any registered printf back-reference is
    /// drained and cleared.
    pub fn host_synchronize(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pool.device.is_lost() {
                self.drain_printf(true);
                return Err(Status::DeviceLost);
            }
            if self.query_status().is_ok() {
                self.drain_printf(false);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Status::NotReady);
            }
            std::thread::yield_now();
        }
    }

    /// Signal from the host, bypassing the device.
    pub fn host_signal(&self) {
        let memory = self.pool.device.memory();
        for packet in 0..self.packet_count {
            memory.write_u32(self.completion_addr(packet), STATE_SIGNALED);
        }
    }

    /// Return the event to its initial state.
    pub fn host_reset(&self) {
        let memory = self.pool.device.memory();
        for packet in 0..self.packet_count {
            memory.write_u32(self.completion_addr(packet), STATE_CLEARED);
        }
        self.packets_in_use.store(1, Ordering::Release);
        *self.printf_kernel.lock() = None;
        self.binder.store(0, Ordering::Release);
    }

    /// Captured timestamps: start from the first packet, end from the
    /// last consumed packet.
    pub fn kernel_timestamps(&self) -> KernelTimestamps {
        let memory = self.pool.device.memory();
        let first = self.packet_addr(0);
        let last = self.packet_addr(self.packets_in_use().saturating_sub(1));
        KernelTimestamps {
            global_start: memory.read_u64(first + OFF_GLOBAL_START),
            context_start: memory.read_u64(first + OFF_CTX_START),
            global_end: memory.read_u64(last + OFF_GLOBAL_END),
            context_end: memory.read_u64(last + OFF_CTX_END),
        }
    }

    fn drain_printf(&self, hang_detected: bool) {
        let taken = self.printf_kernel.lock().take();
        if let Some(weak) = taken {
            if let Some(kernel) = weak.upgrade() {
                kernel.print_output(hang_detected);
            }
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.pool.slots.lock()[self.index as usize] = false;
    }
}
