// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command queue: FIFO submission and host synchronization.
//!
//! Closed command lists are handed to the device in submission order
//! under an internal ordering lock. Each submission appends a fence
//! write the host polls in `synchronize`. Printf registrations migrate
//! from the submitted lists to the queue and are drained at the next
//! synchronization point — with the hang flag when the device was lost.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use quartz_common::{AllocKind, AllocationHandle, EngineClass, GpuAddr, Result, Status};
use quartz_hw::{DataWidth, FlushScope, Instruction};

use crate::cmdlist::CommandList;
use crate::device::Device;
use crate::kernel::Kernel;
use crate::memory::DeviceAllocator;
use crate::printf::PrintfRegistry;

struct QueueInner {
    printf: PrintfRegistry,
    /// Monotonic submission counter; the fence in memory trails it until
    /// the device catches up.
    submitted: u64,
}

pub struct CommandQueue {
    device: Arc<Device>,
    engine: EngineClass,
    relaxed: bool,
    /// Host-visible fence cell the device writes the task count into.
    fence: AllocationHandle,
    /// Static ordering-barrier stream submitted between lists.
    barrier_stream: AllocationHandle,
    /// Small stream rewritten per submission with the fence write.
    fence_stream: AllocationHandle,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new(device: &Arc<Device>, engine: EngineClass) -> Result<Arc<CommandQueue>> {
        let allocator = device.allocator();
        let fence = allocator.allocate(64, 64, AllocKind::HostVisible)?;
        device.memory().write_u64(fence.gpu_addr, 0);

        let barrier_stream = allocator.allocate(64, 64, AllocKind::Internal)?;
        let mut bytes = Vec::new();
        let barrier = if engine.is_copy_only() {
            Instruction::MemWrite {
                addr: 0,
                value: 0,
                width: DataWidth::Bits32,
                flush: FlushScope::Device,
            }
        } else {
            Instruction::Barrier {
                dc_flush: true,
                texture_invalidate: false,
                hdc_flush: false,
                post_sync: None,
            }
        };
        barrier.encode(&mut bytes);
        Instruction::BatchEnd.encode(&mut bytes);
        device.memory().write(barrier_stream.gpu_addr, &bytes);

        let fence_stream = allocator.allocate(64, 64, AllocKind::Internal)?;

        Ok(Arc::new(CommandQueue {
            device: device.clone(),
            engine,
            relaxed: device.settings().relaxed_ordering,
            fence,
            barrier_stream,
            fence_stream,
            inner: Mutex::new(QueueInner {
                printf: PrintfRegistry::new(),
                submitted: 0,
            }),
        }))
    }

    pub fn engine(&self) -> EngineClass {
        self.engine
    }

    /// Submissions accepted so far.
    pub fn task_count(&self) -> u64 {
        self.inner.lock().submitted
    }

    /// Kernels currently awaiting a printf drain on this queue.
    pub fn printf_registration_count(&self) -> usize {
        self.inner.lock().printf.len()
    }

    /// Submit closed lists in FIFO order.
    ///
    /// Validation failures are returned synchronously; an execution hang
    /// is only observable at the next `synchronize`.
    pub fn execute_command_lists(&self, lists: &[&CommandList]) -> Result<()> {
        if lists.is_empty() {
            return Err(Status::InvalidArgument);
        }
        for list in lists {
            if !list.is_closed() {
                return Err(Status::InvalidArgument);
            }
            if list.engine() != self.engine {
                return Err(Status::InvalidArgument);
            }
        }
        if self.device.is_lost() {
            return Err(Status::DeviceLost);
        }

        let mut inner = self.inner.lock();

        let mut residency: Vec<AllocationHandle> = Vec::new();
        for list in lists {
            residency.extend_from_slice(list.residency().snapshot());
        }
        self.device.allocator().make_resident(&residency)?;

        for list in lists {
            inner.printf.extend_from(list.printf_entries());
        }

        let streams: Vec<GpuAddr> = lists.iter().map(|l| l.stream_start()).collect();
        self.submit_locked(&mut inner, &streams);
        Ok(())
    }

    /// Submission path for an already-encoded stream (immediate lists).
    pub(crate) fn submit_encoded(
        &self,
        start: GpuAddr,
        residency: &[AllocationHandle],
        printf: &[Weak<Kernel>],
    ) -> Result<()> {
        if self.device.is_lost() {
            return Err(Status::DeviceLost);
        }
        let mut inner = self.inner.lock();
        self.device.allocator().make_resident(residency)?;
        inner.printf.extend_from(printf);
        self.submit_locked(&mut inner, &[start]);
        Ok(())
    }

    fn submit_locked(&self, inner: &mut QueueInner, streams: &[GpuAddr]) {
        for (i, &start) in streams.iter().enumerate() {
            if i > 0 && !self.relaxed && self.device.submit(self.barrier_stream.gpu_addr).is_err()
            {
                break;
            }
            log::debug!("queue: submitting stream 0x{start:X}");
            if self.device.submit(start).is_err() {
                // The hang is reported at the next synchronize; the
                // device-lost flag is already sticky.
                break;
            }
        }
        inner.submitted += 1;
        let task = inner.submitted;
        if !self.device.is_lost() {
            let mut bytes = Vec::new();
            Instruction::MemWrite {
                addr: self.fence.gpu_addr,
                value: task,
                width: DataWidth::Bits64,
                flush: FlushScope::Host,
            }
            .encode(&mut bytes);
            Instruction::BatchEnd.encode(&mut bytes);
            self.device.memory().write(self.fence_stream.gpu_addr, &bytes);
            let _ = self.device.submit(self.fence_stream.gpu_addr);
        }
    }

    /// Block until every accepted submission completed, the timeout
    /// expires, or the device is lost. Completion (and loss) drains the
    /// queue's printf registrations.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.device.is_lost() {
                let drained = self.inner.lock().printf.drain_all(true);
                if drained > 0 {
                    log::warn!("queue: drained {drained} printf kernel(s) after device loss");
                }
                return Err(Status::DeviceLost);
            }
            let expected = self.inner.lock().submitted;
            let completed = self.device.memory().read_u64(self.fence.gpu_addr);
            if completed >= expected {
                self.inner.lock().printf.drain_all(false);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Status::NotReady);
            }
            std::thread::yield_now();
        }
    }
}


impl Drop for CommandQueue {
    fn drop(&mut self) {
        let allocator = self.device.allocator();
        allocator.free(&self.fence);
        allocator.free(&self.barrier_stream);
        allocator.free(&self.fence_stream);
    }
}
