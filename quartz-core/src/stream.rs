// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Segmented command stream.
//!
//! An arena of fixed-capacity buffer segments with an explicit current
//! cursor. When a segment cannot fit the next operation, a BATCH_START
//! jump chains it to a freshly allocated segment. Reset truncates back to
//! segment 0 so the first allocation is reused across encode cycles.

use quartz_common::{AllocKind, AllocationHandle, GpuAddr, Result};
use quartz_hw::Instruction;

use crate::memory::{DeviceAllocator, Memory};

/// Default capacity of one stream segment.
pub const DEFAULT_SEGMENT_BYTES: usize = 0x4000;

/// Bytes kept free at the tail of every segment for the chain jump plus
/// the stream terminator.
const CHAIN_RESERVE: usize = 16;

pub struct StreamSegment {
    pub alloc: AllocationHandle,
    bytes: Vec<u8>,
    capacity: usize,
}

impl StreamSegment {
    fn available(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub struct CommandStream {
    segments: Vec<StreamSegment>,
    current: usize,
    segment_bytes: usize,
    log_instructions: bool,
}

impl CommandStream {
    pub fn new(
        allocator: &dyn DeviceAllocator,
        segment_bytes: usize,
        log_instructions: bool,
    ) -> Result<Self> {
        let first = Self::alloc_segment(allocator, segment_bytes)?;
        Ok(Self {
            segments: vec![first],
            current: 0,
            segment_bytes,
            log_instructions,
        })
    }

    fn alloc_segment(
        allocator: &dyn DeviceAllocator,
        segment_bytes: usize,
    ) -> Result<StreamSegment> {
        let alloc = allocator.allocate(segment_bytes as u64, 64, AllocKind::Internal)?;
        Ok(StreamSegment {
            alloc,
            bytes: Vec::with_capacity(segment_bytes),
            capacity: segment_bytes,
        })
    }

    /// Device address of the first instruction.
    pub fn start_addr(&self) -> GpuAddr {
        self.segments[0].alloc.gpu_addr
    }

    /// Total encoded bytes across all segments.
    pub fn used_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[StreamSegment] {
        &self.segments
    }

    /// Make room for `bytes` of upcoming instructions, chaining to a new
    /// segment if the current one cannot hold them plus the reserved
    /// terminator tail. Returns `true` if a new segment was chained.
    pub fn ensure_space(&mut self, allocator: &dyn DeviceAllocator, bytes: usize) -> Result<bool> {
        debug_assert!(bytes + CHAIN_RESERVE <= self.segment_bytes);
        if self.segments[self.current].available() >= bytes + CHAIN_RESERVE {
            return Ok(false);
        }
        let next = Self::alloc_segment(allocator, self.segment_bytes)?;
        let next_addr = next.alloc.gpu_addr;
        log::debug!(
            "stream: segment {} exhausted, chaining to 0x{:X}",
            self.current,
            next_addr
        );
        self.emit(&Instruction::BatchStart { addr: next_addr });
        self.segments.push(next);
        self.current = self.segments.len() - 1;
        Ok(true)
    }

    /// Append one instruction to the current segment.
    ///
    /// Space must have been ensured beforehand; the reserved tail keeps
    /// the chain jump itself from overflowing.
    pub fn emit(&mut self, instr: &Instruction) {
        if self.log_instructions {
            log::trace!("stream[{}]+{}: {:?}", self.current, self.used_bytes(), instr);
        }
        let seg = &mut self.segments[self.current];
        debug_assert!(seg.available() >= instr.encoded_len());
        instr.encode(&mut seg.bytes);
    }

    /// Write every segment's bytes into device-visible memory.
    pub fn flush(&self, memory: &Memory) {
        for seg in &self.segments {
            memory.write(seg.alloc.gpu_addr, &seg.bytes);
        }
    }

    /// Truncate to segment 0, freeing every chained segment.
    pub fn reset(&mut self, allocator: &dyn DeviceAllocator) {
        for seg in self.segments.drain(1..) {
            allocator.free(&seg.alloc);
        }
        self.segments[0].bytes.clear();
        self.current = 0;
    }
}
