// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command list: the instruction encoder state machine.
//!
//! A list accumulates append operations into its segmented stream while
//! tracking residency, printf registrations, pending cache hazards and
//! programmed pipeline state. Deferred lists are closed once and handed
//! to a queue; immediate lists submit and synchronize after every append
//! through a privately owned queue.
//!
//! Host-side encoding is single-writer: callers serialize appends to one
//! list, which is why the encoder state needs no internal locking.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use quartz_common::{
    align_up, AllocKind, AllocationHandle, EngineClass, GpuAddr, GroupCount, Result, Status,
};
use quartz_hw::{
    isa, ArbitrationPolicy, CompareOp, DataWidth, FlushScope, Instruction, MathOp, MathOperand,
};

use crate::device::Device;
use crate::event::{Event, OFF_CTX_END, OFF_CTX_START, OFF_GLOBAL_END, OFF_GLOBAL_START,
    STATE_CLEARED, STATE_SIGNALED};
use crate::kernel::{Kernel, COPY_MIDDLE_ELEMENT};
use crate::memory::DeviceAllocator;
use crate::printf::PrintfRegistry;
use crate::queue::CommandQueue;
use crate::residency::ResidencyTracker;
use crate::stream::{CommandStream, DEFAULT_SEGMENT_BYTES};

/// Largest fill handled by the immediate-fill instruction before the
/// encoder falls back to a kernel dispatch.
const IMMEDIATE_FILL_MAX: u64 = 0x1_0000;

/// Synchronous-submission timeout used by immediate lists.
const IMMEDIATE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Deferred,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingMode {
    OutOfOrder,
    InOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Open,
    Closed,
}

pub struct CommandList {
    device: Arc<Device>,
    id: u64,
    engine: EngineClass,
    mode: ExecutionMode,
    ordering: OrderingMode,
    state: ListState,
    stream: CommandStream,
    residency: ResidencyTracker,
    printf: PrintfRegistry,
    /// A prior dispatch wrote images; the next dispatch must flush the
    /// texture cache first on generations that require it.
    pending_image_hazard: bool,
    /// The copy engine has already executed its one-time priming blit.
    dma_primed: bool,
    programmed_arbitration: Option<ArbitrationPolicy>,
    programmed_scratch: u32,
    inorder_counter: Option<AllocationHandle>,
    inorder_value: u32,
    /// Per-append allocations (payload heaps, staged patterns) released
    /// on reset.
    transient: Vec<AllocationHandle>,
    /// Events bound as signal targets, released on reset.
    bound_events: Vec<Arc<Event>>,
    immediate_queue: Option<Arc<CommandQueue>>,
}

impl CommandList {
    /// Deferred list bound to a device engine.
    pub fn create(
        device: &Arc<Device>,
        engine: EngineClass,
        ordering: OrderingMode,
    ) -> Result<CommandList> {
        Self::build(device, engine, ordering, ExecutionMode::Deferred, DEFAULT_SEGMENT_BYTES)
    }

    /// Immediate list: every append submits through a private queue and
    /// synchronizes before returning.
    pub fn create_immediate(
        device: &Arc<Device>,
        engine: EngineClass,
        ordering: OrderingMode,
    ) -> Result<CommandList> {
        let mut list = Self::build(
            device,
            engine,
            ordering,
            ExecutionMode::Immediate,
            DEFAULT_SEGMENT_BYTES,
        )?;
        list.immediate_queue = Some(CommandQueue::new(device, engine)?);
        Ok(list)
    }

    /// Deferred list with a custom segment capacity.
    pub fn create_with_segment_size(
        device: &Arc<Device>,
        engine: EngineClass,
        ordering: OrderingMode,
        segment_bytes: usize,
    ) -> Result<CommandList> {
        Self::build(device, engine, ordering, ExecutionMode::Deferred, segment_bytes)
    }

    fn build(
        device: &Arc<Device>,
        engine: EngineClass,
        ordering: OrderingMode,
        mode: ExecutionMode,
        segment_bytes: usize,
    ) -> Result<CommandList> {
        let stream = CommandStream::new(
            &**device.allocator(),
            segment_bytes,
            device.settings().log_encoded_streams,
        )?;
        Ok(CommandList {
            device: device.clone(),
            id: device.next_list_id(),
            engine,
            mode,
            ordering,
            state: ListState::Open,
            stream,
            residency: ResidencyTracker::new(),
            printf: PrintfRegistry::new(),
            pending_image_hazard: false,
            dma_primed: false,
            programmed_arbitration: None,
            programmed_scratch: 0,
            inorder_counter: None,
            inorder_value: 0,
            transient: Vec::new(),
            bound_events: Vec::new(),
            immediate_queue: None,
        })
    }

    pub fn engine(&self) -> EngineClass {
        self.engine
    }

    pub fn ordering(&self) -> OrderingMode {
        self.ordering
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.state == ListState::Closed
    }

    pub fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }

    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    /// Number of kernels currently registered for deferred output.
    pub fn printf_registration_count(&self) -> usize {
        self.printf.len()
    }

    pub(crate) fn printf_entries(&self) -> &[Weak<Kernel>] {
        self.printf.entries()
    }

    pub(crate) fn stream_start(&self) -> GpuAddr {
        self.stream.start_addr()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Finalize residency and lock the byte stream.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ListState::Closed {
            return Ok(());
        }
        self.finalize_stream()?;
        self.state = ListState::Closed;
        log::debug!(
            "list {}: closed, {} bytes in {} segment(s), {} resident",
            self.id,
            self.stream.used_bytes(),
            self.stream.segment_count(),
            self.residency.len()
        );
        Ok(())
    }

    /// Return to the initial empty state, keeping the first stream
    /// segment allocation for reuse.
    pub fn reset(&mut self) -> Result<()> {
        let allocator = self.device.allocator().clone();
        for alloc in self.transient.drain(..) {
            allocator.free(&alloc);
        }
        self.stream.reset(&*allocator);
        self.residency.clear();
        self.printf.clear();
        self.pending_image_hazard = false;
        self.dma_primed = false;
        self.programmed_arbitration = None;
        self.programmed_scratch = 0;
        self.inorder_value = 0;
        if let Some(counter) = self.inorder_counter {
            self.device.memory().write_u32(counter.gpu_addr, 0);
        }
        for event in self.bound_events.drain(..) {
            event.release_binding(self.id);
        }
        self.state = ListState::Open;
        Ok(())
    }

    fn finalize_stream(&mut self) -> Result<()> {
        let allocator = self.device.allocator().clone();
        self.stream
            .ensure_space(&*allocator, Instruction::BatchEnd.encoded_len())?;
        self.stream.emit(&Instruction::BatchEnd);
        // The terminator may itself have chained a fresh segment, so
        // segment residency is recorded only now.
        let segments: Vec<AllocationHandle> =
            self.stream.segments().iter().map(|s| s.alloc).collect();
        for alloc in segments {
            self.residency.add(alloc);
        }
        self.stream.flush(self.device.memory());
        Ok(())
    }

    fn require_open(&self) -> Result<()> {
        if self.state == ListState::Open {
            Ok(())
        } else {
            Err(Status::InvalidState)
        }
    }

    fn emit_all(&mut self, instrs: &[Instruction]) -> Result<()> {
        let allocator = self.device.allocator().clone();
        for instr in instrs {
            self.stream.ensure_space(&*allocator, instr.encoded_len())?;
            self.stream.emit(instr);
        }
        Ok(())
    }

    /// Engine-appropriate plain flush: the copy engine only has the
    /// flush-write primitive, the compute engine a pipeline barrier.
    fn flush_instr(&self) -> Instruction {
        if self.engine.is_copy_only() {
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
        }
    }

    /// Submit-and-wait cycle for immediate lists; no-op on deferred ones.
    fn flush_immediate(&mut self) -> Result<()> {
        if self.mode != ExecutionMode::Immediate {
            return Ok(());
        }
        let queue = self
            .immediate_queue
            .clone()
            .ok_or(Status::InvalidState)?;
        self.finalize_stream()?;
        let submit = queue.submit_encoded(
            self.stream_start(),
            self.residency.snapshot(),
            self.printf.entries(),
        );
        let sync = match submit {
            Ok(()) => queue.synchronize(IMMEDIATE_SYNC_TIMEOUT),
            Err(e) => Err(e),
        };
        self.reset()?;
        sync
    }

    // ── Event helpers ────────────────────────────────────────────────────

    /// Encode poll-based waits for every used packet of every event.
    fn encode_wait_events(&mut self, events: &[&Arc<Event>]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut instrs = Vec::new();
        let mut flush_needed = false;
        for event in events {
            self.residency.add(event.allocation());
            for packet in 0..event.packets_in_use() {
                instrs.push(Instruction::SemWait {
                    addr: event.completion_addr(packet),
                    value: STATE_CLEARED as u64,
                    op: CompareOp::NotEqual,
                    width: DataWidth::Bits32,
                });
            }
            flush_needed |= event.wait_scope().needs_flush();
        }
        if flush_needed {
            instrs.push(self.flush_instr());
        }
        self.emit_all(&instrs)
    }

    /// Claim `event` as this list's signal target before any encoding.
    fn bind_signal(&mut self, event: &Arc<Event>) -> Result<()> {
        event.try_bind(self.id)?;
        if !self.bound_events.iter().any(|e| Arc::ptr_eq(e, event)) {
            self.bound_events.push(event.clone());
        }
        Ok(())
    }

    /// Post-operation signal: completion writes (or the end timestamp
    /// bracket), one per consumed packet.
    fn encode_signal(&mut self, event: &Arc<Event>, ops: u32) -> Result<()> {
        self.residency.add(event.allocation());
        let used = event.consume_packets(ops, self.device.packet_policy());
        let mut instrs = Vec::new();
        if event.has_timestamps() {
            self.encode_timestamp_end(&mut instrs, event, used);
        } else {
            let flush = event.signal_scope().flush();
            for packet in 0..used {
                let addr = event.completion_addr(packet);
                if self.engine.is_copy_only() {
                    instrs.push(Instruction::MemWrite {
                        addr,
                        value: STATE_SIGNALED as u64,
                        width: DataWidth::Bits32,
                        flush,
                    });
                } else {
                    instrs.push(Instruction::Barrier {
                        dc_flush: event.signal_scope().needs_flush(),
                        texture_invalidate: false,
                        hdc_flush: false,
                        post_sync: Some((addr, STATE_SIGNALED)),
                    });
                }
            }
        }
        self.emit_all(&instrs)
    }

    /// Clock stores for one packet location pair.
    fn push_clock_stores(&self, instrs: &mut Vec<Instruction>, global_addr: GpuAddr, ctx_addr: GpuAddr) {
        if self.device.caps().wide_timestamp_read {
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::GLOBAL_TIMESTAMP,
                addr: global_addr,
                masked_low: false,
            });
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::CTX_TIMESTAMP,
                addr: ctx_addr,
                masked_low: false,
            });
        } else {
            // Narrow reads: hi/lo pair plus a masked low re-read so a
            // rollover between the two halves cannot be observed.
            for (lo, hi, addr) in [
                (isa::reg::GLOBAL_TIMESTAMP_LO, isa::reg::GLOBAL_TIMESTAMP_HI, global_addr),
                (isa::reg::CTX_TIMESTAMP_LO, isa::reg::CTX_TIMESTAMP_HI, ctx_addr),
            ] {
                instrs.push(Instruction::RegStoreMem {
                    reg: lo,
                    addr,
                    masked_low: false,
                });
                instrs.push(Instruction::RegStoreMem {
                    reg: hi,
                    addr: addr + 4,
                    masked_low: false,
                });
                instrs.push(Instruction::RegStoreMem {
                    reg: lo,
                    addr,
                    masked_low: true,
                });
            }
        }
    }

    fn encode_timestamp_start(&mut self, event: &Arc<Event>) -> Result<()> {
        self.residency.add(event.allocation());
        let mut instrs = Vec::new();
        let base = event.packet_addr(0);
        self.push_clock_stores(&mut instrs, base + OFF_GLOBAL_START, base + OFF_CTX_START);
        self.emit_all(&instrs)
    }

    fn encode_timestamp_end(&self, instrs: &mut Vec<Instruction>, event: &Arc<Event>, used: u32) {
        // Outstanding writes must land before the end clocks are read.
        instrs.push(self.flush_instr());
        for packet in 0..used {
            let base = event.packet_addr(packet);
            self.push_clock_stores(instrs, base + OFF_GLOBAL_END, base + OFF_CTX_END);
        }
        if event.signal_scope().needs_flush() && !self.engine.is_copy_only() {
            instrs.push(Instruction::Barrier {
                dc_flush: true,
                texture_invalidate: false,
                hdc_flush: false,
                post_sync: None,
            });
        }
    }

    // ── Kernel launch ────────────────────────────────────────────────────

    pub fn append_launch_kernel(
        &mut self,
        kernel: &Arc<Kernel>,
        dims: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if !dims.is_valid() {
            return Err(Status::InvalidArgument);
        }
        self.encode_wait_events(waits)?;
        self.launch_with_params(kernel, Some(dims), None, signal, false)?;
        self.flush_immediate()
    }

    /// Cooperative launch: all groups execute concurrently. Copy engines
    /// cannot dispatch, and generations without wait predication cannot
    /// combine a cooperative launch with wait events.
    pub fn append_launch_cooperative_kernel(
        &mut self,
        kernel: &Arc<Kernel>,
        dims: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if self.engine.is_copy_only() {
            return Err(Status::Unsupported);
        }
        if !waits.is_empty() && !self.device.caps().cooperative_wait_predication {
            return Err(Status::InvalidArgument);
        }
        if !dims.is_valid() {
            return Err(Status::InvalidArgument);
        }
        self.encode_wait_events(waits)?;
        self.launch_with_params(kernel, Some(dims), None, signal, true)?;
        self.flush_immediate()
    }

    /// Launch whose group counts live in device memory and are read at
    /// execution time.
    pub fn append_launch_kernel_indirect(
        &mut self,
        kernel: &Arc<Kernel>,
        dispatch_args_addr: GpuAddr,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        let args = self
            .device
            .allocator()
            .resolve(dispatch_args_addr, 12)
            .ok_or(Status::OutOfDeviceMemory)?;
        self.encode_wait_events(waits)?;
        self.launch_with_params(kernel, None, Some((args, dispatch_args_addr)), signal, false)?;
        self.flush_immediate()
    }

    fn launch_with_params(
        &mut self,
        kernel: &Arc<Kernel>,
        dims: Option<GroupCount>,
        indirect: Option<(AllocationHandle, GpuAddr)>,
        signal: Option<&Arc<Event>>,
        cooperative: bool,
    ) -> Result<()> {
        if self.engine.is_copy_only() {
            return Err(Status::Unsupported);
        }
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }

        let desc = kernel.descriptor().clone();
        let caps = self.device.caps().clone();
        let mut instrs: Vec<Instruction> = Vec::new();

        // Flush the texture-cache hazard a prior image-writing dispatch left.
        if self.pending_image_hazard && caps.requires_post_image_write_flush {
            instrs.push(Instruction::Barrier {
                dc_flush: false,
                texture_invalidate: true,
                hdc_flush: true,
                post_sync: None,
            });
            self.pending_image_hazard = false;
        }

        // Pipeline state deltas against what this list already programmed.
        let policy = desc.arbitration.unwrap_or(caps.default_arbitration);
        if self.programmed_arbitration != Some(policy) {
            instrs.push(Instruction::RegLoadImm {
                reg: isa::reg::ARBITRATION_POLICY,
                value: policy as u32,
            });
            self.programmed_arbitration = Some(policy);
        }
        if desc.scratch_size > self.programmed_scratch {
            self.programmed_scratch = desc.scratch_size;
            instrs.push(Instruction::RegLoadImm {
                reg: isa::reg::SCRATCH_SIZE,
                value: self.programmed_scratch,
            });
        }

        // Per-dispatch cross-thread payload, written host-side now.
        let payload_size = align_up(desc.payload_size.max(8) as u64, 64);
        let payload = self
            .device
            .allocator()
            .allocate(payload_size, 64, AllocKind::Internal)?;
        self.transient.push(payload);
        self.device
            .memory()
            .write(payload.gpu_addr, &kernel.payload_image());
        self.residency.add(payload);
        for handle in kernel.residency() {
            self.residency.add(handle);
        }

        // In-order lists gate every dispatch on the previous one.
        if self.ordering == OrderingMode::InOrder {
            let counter = self.inorder_counter()?;
            if self.inorder_value > 0 {
                instrs.push(Instruction::SemWait {
                    addr: counter.gpu_addr,
                    value: self.inorder_value as u64,
                    op: CompareOp::GreaterOrEqual,
                    width: DataWidth::Bits32,
                });
            }
        }

        self.emit_all(&instrs)?;
        instrs.clear();

        if let Some(event) = signal {
            if event.has_timestamps() {
                self.encode_timestamp_start(event)?;
            }
        }

        if kernel.uses_printf() {
            if self.printf.register_if_absent(kernel) {
                log::trace!("list {}: registered printf kernel {}", self.id, desc.name);
            }
            if let Some(event) = signal {
                event.set_printf_kernel(Arc::downgrade(kernel));
            }
        }

        let group_size = kernel.group_size();
        if let Some((args_alloc, args_addr)) = indirect {
            self.residency.add(args_alloc);
            Self::encode_indirect_params(&mut instrs, args_addr, payload.gpu_addr, &desc, group_size);
        }

        instrs.push(Instruction::Dispatch {
            kernel_addr: kernel.isa_addr(),
            payload_addr: payload.gpu_addr,
            group_count: dims.map(|d| [d.x, d.y, d.z]).unwrap_or([0, 0, 0]),
            group_size,
            indirect: indirect.is_some(),
            cooperative,
        });

        if desc.writes_images {
            self.pending_image_hazard = true;
        }

        if self.ordering == OrderingMode::InOrder {
            let counter = self.inorder_counter()?;
            let next = self.inorder_value + 1;
            instrs.push(Instruction::MemWrite {
                addr: counter.gpu_addr,
                value: next as u64,
                width: DataWidth::Bits32,
                flush: FlushScope::Device,
            });
            self.inorder_value = next;
        }

        self.emit_all(&instrs)?;

        if let Some(event) = signal {
            self.encode_signal(event, 1)?;
        }
        Ok(())
    }

    fn inorder_counter(&mut self) -> Result<AllocationHandle> {
        if let Some(counter) = self.inorder_counter {
            return Ok(counter);
        }
        let counter = self
            .device
            .allocator()
            .allocate(64, 64, AllocKind::HostVisible)?;
        self.device.memory().write_u32(counter.gpu_addr, 0);
        self.inorder_counter = Some(counter);
        self.residency.add(counter);
        Ok(counter)
    }

    /// Register loads and add/shift/or arithmetic that fill in the
    /// launch parameters a direct dispatch would know at encode time:
    /// group counts into the dispatch registers, then work dimension and
    /// global sizes stored into the payload.
    fn encode_indirect_params(
        instrs: &mut Vec<Instruction>,
        args_addr: GpuAddr,
        payload_addr: GpuAddr,
        desc: &crate::kernel::KernelDescriptor,
        group_size: [u32; 3],
    ) {
        const ACC: u16 = 0;
        const TMP: u16 = 1;
        const SCRATCH: u16 = 2;
        const BIT_Y: u16 = 3;
        const BIT_Z: u16 = 4;

        for (dim, reg) in [
            isa::reg::DISPATCH_DIM_X,
            isa::reg::DISPATCH_DIM_Y,
            isa::reg::DISPATCH_DIM_Z,
        ]
        .into_iter()
        .enumerate()
        {
            instrs.push(Instruction::RegLoadMem {
                reg,
                addr: args_addr + 4 * dim as u64,
            });
        }

        if let Some(gso) = desc.global_size_offset {
            // global_size = group_count * group_size, as a shift-and-add
            // over the set bits of the encode-time group size.
            for dim in 0..3usize {
                instrs.push(Instruction::RegLoadMem {
                    reg: SCRATCH,
                    addr: args_addr + 4 * dim as u64,
                });
                instrs.push(Instruction::RegLoadImm { reg: ACC, value: 0 });
                for bit in 0..32 {
                    if group_size[dim] >> bit & 1 == 1 {
                        instrs.push(Instruction::RegMath {
                            op: MathOp::Shl,
                            dst: TMP,
                            src_a: SCRATCH,
                            src_b: MathOperand::Imm(bit),
                        });
                        instrs.push(Instruction::RegMath {
                            op: MathOp::Add,
                            dst: ACC,
                            src_a: ACC,
                            src_b: MathOperand::Gpr(TMP),
                        });
                    }
                }
                instrs.push(Instruction::RegStoreMem {
                    reg: ACC,
                    addr: payload_addr + gso as u64 + 4 * dim as u64,
                    masked_low: false,
                });
            }
        }

        if let Some(wdo) = desc.work_dim_offset {
            // work_dim = 1 + (y>1 | z>1) + (z>1), with each flag computed
            // as an or-reduce of count-1 down to a single bit.
            for (dim, flag_reg) in [(1u64, BIT_Y), (2u64, BIT_Z)] {
                instrs.push(Instruction::RegLoadMem {
                    reg: SCRATCH,
                    addr: args_addr + 4 * dim,
                });
                instrs.push(Instruction::RegMath {
                    op: MathOp::Add,
                    dst: SCRATCH,
                    src_a: SCRATCH,
                    src_b: MathOperand::Imm(0xFFFF_FFFF),
                });
                instrs.push(Instruction::RegMath {
                    op: MathOp::And,
                    dst: SCRATCH,
                    src_a: SCRATCH,
                    src_b: MathOperand::Imm(0xFFFF_FFFF),
                });
                for shift in [16u32, 8, 4, 2, 1] {
                    instrs.push(Instruction::RegMath {
                        op: MathOp::Shr,
                        dst: TMP,
                        src_a: SCRATCH,
                        src_b: MathOperand::Imm(shift),
                    });
                    instrs.push(Instruction::RegMath {
                        op: MathOp::Or,
                        dst: SCRATCH,
                        src_a: SCRATCH,
                        src_b: MathOperand::Gpr(TMP),
                    });
                }
                instrs.push(Instruction::RegMath {
                    op: MathOp::And,
                    dst: flag_reg,
                    src_a: SCRATCH,
                    src_b: MathOperand::Imm(1),
                });
            }
            instrs.push(Instruction::RegMath {
                op: MathOp::Or,
                dst: ACC,
                src_a: BIT_Y,
                src_b: MathOperand::Gpr(BIT_Z),
            });
            instrs.push(Instruction::RegMath {
                op: MathOp::Add,
                dst: ACC,
                src_a: ACC,
                src_b: MathOperand::Gpr(BIT_Z),
            });
            instrs.push(Instruction::RegMath {
                op: MathOp::Add,
                dst: ACC,
                src_a: ACC,
                src_b: MathOperand::Imm(1),
            });
            instrs.push(Instruction::RegStoreMem {
                reg: ACC,
                addr: payload_addr + wdo as u64,
                masked_low: false,
            });
        }
    }

    // ── Memory operations ────────────────────────────────────────────────

    pub fn append_memory_copy(
        &mut self,
        dst: GpuAddr,
        src: GpuAddr,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if size == 0 {
            return Err(Status::InvalidArgument);
        }
        let dst_alloc = self
            .device
            .allocator()
            .resolve(dst, size)
            .ok_or(Status::OutOfDeviceMemory)?;
        let src_alloc = self
            .device
            .allocator()
            .resolve(src, size)
            .ok_or(Status::OutOfDeviceMemory)?;
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }
        self.encode_wait_events(waits)?;
        self.residency.add(dst_alloc);
        self.residency.add(src_alloc);

        if let Some(event) = signal {
            if event.has_timestamps() {
                self.encode_timestamp_start(event)?;
            }
        }

        let ops = if self.engine.is_copy_only() {
            self.encode_blit_copy(dst, src, size)?
        } else {
            self.encode_kernel_copy(dst, src, size)?
        };

        if let Some(event) = signal {
            self.encode_signal(event, ops)?;
        }
        if dst_alloc.kind == AllocKind::HostVisible && !self.engine.is_copy_only() {
            let flush = self.flush_instr();
            self.emit_all(&[flush])?;
        }
        self.flush_immediate()
    }

    /// One-time dummy transfer generations with the priming workaround
    /// need before the first real blit of a stream.
    fn prime_blit_if_needed(&mut self, instrs: &mut Vec<Instruction>) {
        let required = self.device.caps().requires_dma_priming
            || self.device.settings().force_dma_priming;
        if required && !self.dma_primed {
            instrs.push(Instruction::CopyBlit {
                src: 0,
                dst: 0,
                size: 0,
                prime: true,
            });
            self.dma_primed = true;
        }
    }

    /// Blit-engine copy: one-time priming where required, an unaligned
    /// head folded into its own transfer, then span-bounded body blits.
    fn encode_blit_copy(&mut self, dst: GpuAddr, src: GpuAddr, size: u64) -> Result<u32> {
        let caps = self.device.caps().clone();
        let mut instrs = Vec::new();
        let mut ops = 0u32;

        self.prime_blit_if_needed(&mut instrs);

        let mut s = src;
        let mut d = dst;
        let mut remaining = size;

        let head = ((caps.blit_alignment - d % caps.blit_alignment) % caps.blit_alignment)
            .min(remaining);
        if head > 0 {
            instrs.push(Instruction::CopyBlit {
                src: s,
                dst: d,
                size: head as u32,
                prime: false,
            });
            s += head;
            d += head;
            remaining -= head;
            ops += 1;
        }
        while remaining > 0 {
            let chunk = remaining.min(u32::MAX as u64 & !3);
            instrs.push(Instruction::CopyBlit {
                src: s,
                dst: d,
                size: chunk as u32,
                prime: false,
            });
            s += chunk;
            d += chunk;
            remaining -= chunk;
            ops += 1;
        }
        self.emit_all(&instrs)?;
        Ok(ops)
    }

    /// Compute-engine copy: unaligned edges go through the byte-granular
    /// builtin, the cacheline-aligned middle through the 16-byte-element
    /// builtin, split so no dispatch addresses more than the span limit.
    fn encode_kernel_copy(&mut self, dst: GpuAddr, src: GpuAddr, size: u64) -> Result<u32> {
        let caps = self.device.caps().clone();
        let align = caps.cacheline_size;

        let mut left = ((align - dst % align) % align).min(size);
        let right = ((dst + size) % align).min(size - left);
        let mut middle = size - left - right;
        if (src + left) % 4 != 0 {
            // Misaligned source defeats the vectorized middle path.
            left += middle;
            middle = 0;
        }

        let device = self.device.clone();
        let builtins = device.builtins();
        let _ownership = builtins.acquire();

        let mut ops = 0u32;
        let mut offset = 0u64;
        if left > 0 {
            self.dispatch_builtin_copy(&builtins.copy_side, dst, src, offset, left, 1)?;
            offset += left;
            ops += 1;
        }
        let mut remaining = middle;
        while remaining > 0 {
            let span = remaining.min(caps.max_copy_dispatch_span);
            self.dispatch_builtin_copy(
                &builtins.copy_middle,
                dst,
                src,
                offset,
                span,
                COPY_MIDDLE_ELEMENT,
            )?;
            offset += span;
            remaining -= span;
            ops += 1;
        }
        if right > 0 {
            self.dispatch_builtin_copy(&builtins.copy_side, dst, src, offset, right, 1)?;
            ops += 1;
        }
        Ok(ops)
    }

    fn dispatch_builtin_copy(
        &mut self,
        kernel: &Arc<Kernel>,
        dst: GpuAddr,
        src: GpuAddr,
        offset: u64,
        bytes: u64,
        element: u64,
    ) -> Result<()> {
        let simd = kernel.descriptor().simd_width;
        kernel.set_group_size(simd, 1, 1)?;
        let elems = (bytes / element) as u32;
        kernel.set_arg_value(0, &(dst + offset).to_le_bytes())?;
        kernel.set_arg_value(1, &(src + offset).to_le_bytes())?;
        kernel.set_arg_value(2, &elems.to_le_bytes())?;
        kernel.set_arg_value(3, &0u32.to_le_bytes())?;
        kernel.set_arg_value(4, &0u32.to_le_bytes())?;

        let per_group = simd as u64 * element;
        let groups = (bytes + per_group - 1) / per_group;
        self.launch_with_params(
            kernel,
            Some(GroupCount::new(groups as u32, 1, 1)),
            None,
            None,
            false,
        )
    }

    /// Copy of a 3D sub-region, one encoded operation per slice; slice
    /// pitch advances the per-slice base addresses.
    #[allow(clippy::too_many_arguments)]
    pub fn append_memory_copy_region(
        &mut self,
        dst: GpuAddr,
        dst_region: &quartz_common::CopyRegion,
        dst_pitch: u32,
        dst_slice_pitch: u32,
        src: GpuAddr,
        src_region: &quartz_common::CopyRegion,
        src_pitch: u32,
        src_slice_pitch: u32,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if !dst_region.is_valid()
            || !src_region.is_valid()
            || dst_region.width != src_region.width
            || dst_region.height != src_region.height
            || dst_region.depth != src_region.depth
        {
            return Err(Status::InvalidArgument);
        }
        let dst_alloc = self
            .device
            .allocator()
            .resolve(dst, 1)
            .ok_or(Status::OutOfDeviceMemory)?;
        let src_alloc = self
            .device
            .allocator()
            .resolve(src, 1)
            .ok_or(Status::OutOfDeviceMemory)?;
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }
        self.encode_wait_events(waits)?;
        self.residency.add(dst_alloc);
        self.residency.add(src_alloc);
        if let Some(event) = signal {
            if event.has_timestamps() {
                self.encode_timestamp_start(event)?;
            }
        }

        let depth = src_region.depth;
        let src_base = src + src_region.base_offset(src_pitch, src_slice_pitch);
        let dst_base = dst + dst_region.base_offset(dst_pitch, dst_slice_pitch);

        if self.engine.is_copy_only() {
            let mut instrs = Vec::new();
            self.prime_blit_if_needed(&mut instrs);
            let row_contiguous =
                src_region.width == src_pitch && dst_region.width == dst_pitch;
            for z in 0..depth as u64 {
                let s = src_base + z * src_slice_pitch as u64;
                let d = dst_base + z * dst_slice_pitch as u64;
                if row_contiguous {
                    instrs.push(Instruction::CopyBlit {
                        src: s,
                        dst: d,
                        size: src_region.height * src_pitch,
                        prime: false,
                    });
                } else {
                    for row in 0..src_region.height as u64 {
                        instrs.push(Instruction::CopyBlit {
                            src: s + row * src_pitch as u64,
                            dst: d + row * dst_pitch as u64,
                            size: src_region.width,
                            prime: false,
                        });
                    }
                }
            }
            self.emit_all(&instrs)?;
        } else {
            let device = self.device.clone();
            let builtins = device.builtins();
            let _ownership = builtins.acquire();
            let kernel = &builtins.copy_rect2d;
            let extent = GroupCount::new(src_region.width, src_region.height, 1);
            let [gx, gy, _] = kernel.suggest_group_size(extent);
            kernel.set_group_size(gx, gy, 1)?;
            for z in 0..depth as u64 {
                kernel.set_arg_value(0, &(src_base + z * src_slice_pitch as u64).to_le_bytes())?;
                kernel.set_arg_value(1, &(dst_base + z * dst_slice_pitch as u64).to_le_bytes())?;
                kernel.set_arg_value(2, &[0u8; 8])?;
                kernel.set_arg_value(3, &[0u8; 8])?;
                kernel.set_arg_value(4, &src_pitch.to_le_bytes())?;
                kernel.set_arg_value(5, &dst_pitch.to_le_bytes())?;
                self.launch_with_params(
                    kernel,
                    Some(GroupCount::new(src_region.width / gx, src_region.height / gy, 1)),
                    None,
                    None,
                    false,
                )?;
            }
        }

        if let Some(event) = signal {
            self.encode_signal(event, depth)?;
        }
        if dst_alloc.kind == AllocKind::HostVisible && !self.engine.is_copy_only() {
            let flush = self.flush_instr();
            self.emit_all(&[flush])?;
        }
        self.flush_immediate()
    }

    pub fn append_memory_fill(
        &mut self,
        dst: GpuAddr,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if pattern.is_empty()
            || !pattern.len().is_power_of_two()
            || size == 0
            || size % pattern.len() as u64 != 0
        {
            return Err(Status::InvalidArgument);
        }
        let dst_alloc = self
            .device
            .allocator()
            .resolve(dst, size)
            .ok_or(Status::OutOfDeviceMemory)?;
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }
        self.encode_wait_events(waits)?;
        self.residency.add(dst_alloc);
        if let Some(event) = signal {
            if event.has_timestamps() {
                self.encode_timestamp_start(event)?;
            }
        }

        let immediate_ok = pattern.len() <= 4 && dst % 4 == 0 && size % 4 == 0;
        let ops = if immediate_ok && (self.engine.is_copy_only() || size <= IMMEDIATE_FILL_MAX) {
            let mut word = [0u8; 4];
            for i in 0..4 {
                word[i] = pattern[i % pattern.len()];
            }
            self.emit_all(&[Instruction::FillImm {
                dst,
                value: u32::from_le_bytes(word),
                size: size as u32,
            }])?;
            1
        } else if self.engine.is_copy_only() {
            // The blit engine has no dispatch path for wide patterns.
            return Err(Status::Unsupported);
        } else {
            self.encode_kernel_fill(dst, pattern, size)?
        };

        if let Some(event) = signal {
            self.encode_signal(event, ops)?;
        }
        if dst_alloc.kind == AllocKind::HostVisible && !self.engine.is_copy_only() {
            let flush = self.flush_instr();
            self.emit_all(&[flush])?;
        }
        self.flush_immediate()
    }

    /// Pattern fill through the builtin kernel; the remainder that does
    /// not fill a whole group gets a trailing reduced-group dispatch.
    fn encode_kernel_fill(&mut self, dst: GpuAddr, pattern: &[u8], size: u64) -> Result<u32> {
        let staged = self
            .device
            .allocator()
            .allocate(pattern.len() as u64, 64, AllocKind::Internal)?;
        self.device.memory().write(staged.gpu_addr, pattern);
        self.transient.push(staged);
        self.residency.add(staged);

        let device = self.device.clone();
        let builtins = device.builtins();
        let _ownership = builtins.acquire();
        let kernel = &builtins.fill_pattern;
        let simd = kernel.descriptor().simd_width;

        let items = size / pattern.len() as u64;
        let groups = items / simd as u64;
        let remainder = items % simd as u64;
        let mut ops = 0u32;

        let configure = |item_offset: u64| -> Result<()> {
            kernel.set_arg_value(
                0,
                &(dst + item_offset * pattern.len() as u64).to_le_bytes(),
            )?;
            kernel.set_arg_value(1, &0u32.to_le_bytes())?;
            kernel.set_arg_value(2, &staged.gpu_addr.to_le_bytes())?;
            kernel.set_arg_value(3, &(pattern.len() as u32).to_le_bytes())?;
            Ok(())
        };

        if groups > 0 {
            kernel.set_group_size(simd, 1, 1)?;
            configure(0)?;
            self.launch_with_params(
                kernel,
                Some(GroupCount::new(groups as u32, 1, 1)),
                None,
                None,
                false,
            )?;
            ops += 1;
        }
        if remainder > 0 {
            kernel.set_group_size(remainder as u32, 1, 1)?;
            configure(groups * simd as u64)?;
            self.launch_with_params(kernel, Some(GroupCount::new(1, 1, 1)), None, None, false)?;
            ops += 1;
        }
        Ok(ops)
    }

    // ── Direct synchronization primitives ───────────────────────────────

    /// Poll a device address until the comparison holds. 64-bit compares
    /// on generations without native support lower to two register loads
    /// plus a masked register-compare wait.
    pub fn append_wait_on_memory(
        &mut self,
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        width: DataWidth,
    ) -> Result<()> {
        self.require_open()?;
        let len = if width.is_wide() { 8 } else { 4 };
        let alloc = self
            .device
            .allocator()
            .resolve(addr, len)
            .ok_or(Status::OutOfDeviceMemory)?;
        self.residency.add(alloc);

        let instrs = if width.is_wide() && !self.device.caps().native_64bit_compare {
            vec![
                Instruction::RegLoadMem { reg: 0, addr },
                Instruction::RegLoadMem {
                    reg: 1,
                    addr: addr + 4,
                },
                Instruction::SemWaitReg {
                    base_gpr: 0,
                    value,
                    mask: u64::MAX,
                    op,
                },
            ]
        } else {
            vec![Instruction::SemWait {
                addr,
                value,
                op,
                width,
            }]
        };
        self.emit_all(&instrs)?;
        self.flush_immediate()
    }

    /// Immediate-value write with a selectable flush scope.
    pub fn append_write_to_memory(
        &mut self,
        addr: GpuAddr,
        value: u64,
        width: DataWidth,
        flush: FlushScope,
    ) -> Result<()> {
        self.require_open()?;
        let len = if width.is_wide() { 8 } else { 4 };
        let alloc = self
            .device
            .allocator()
            .resolve(addr, len)
            .ok_or(Status::OutOfDeviceMemory)?;
        self.residency.add(alloc);
        self.emit_all(&[Instruction::MemWrite {
            addr,
            value,
            width,
            flush,
        }])?;
        self.flush_immediate()
    }

    // ── Barriers and event operations ───────────────────────────────────

    pub fn append_barrier(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }
        self.encode_wait_events(waits)?;
        let flush = self.flush_instr();
        self.emit_all(&[flush])?;
        if let Some(event) = signal {
            self.encode_signal(event, 1)?;
        }
        self.flush_immediate()
    }

    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> Result<()> {
        self.require_open()?;
        self.bind_signal(event)?;
        self.encode_signal(event, 1)?;
        self.flush_immediate()
    }

    pub fn append_wait_on_events(&mut self, events: &[&Arc<Event>]) -> Result<()> {
        self.require_open()?;
        if events.is_empty() {
            return Err(Status::InvalidArgument);
        }
        self.encode_wait_events(events)?;
        self.flush_immediate()
    }

    /// Device-side event reset: completion fields return to the cleared
    /// state once prior work drains.
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> Result<()> {
        self.require_open()?;
        self.residency.add(event.allocation());
        let mut instrs = Vec::new();
        let flush = event.signal_scope().flush();
        for packet in 0..event.max_packets() {
            let addr = event.completion_addr(packet);
            if self.engine.is_copy_only() {
                instrs.push(Instruction::MemWrite {
                    addr,
                    value: STATE_CLEARED as u64,
                    width: DataWidth::Bits32,
                    flush,
                });
            } else {
                instrs.push(Instruction::Barrier {
                    dc_flush: event.signal_scope().needs_flush(),
                    texture_invalidate: false,
                    hdc_flush: false,
                    post_sync: Some((addr, STATE_CLEARED)),
                });
            }
        }
        self.emit_all(&instrs)?;
        self.flush_immediate()
    }

    /// Capture the global clock into caller-visible memory.
    pub fn append_write_global_timestamp(
        &mut self,
        dst: GpuAddr,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<()> {
        self.require_open()?;
        let alloc = self
            .device
            .allocator()
            .resolve(dst, 8)
            .ok_or(Status::OutOfDeviceMemory)?;
        if let Some(event) = signal {
            self.bind_signal(event)?;
        }
        self.encode_wait_events(waits)?;
        self.residency.add(alloc);

        let mut instrs = Vec::new();
        if self.device.caps().wide_timestamp_read {
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::GLOBAL_TIMESTAMP,
                addr: dst,
                masked_low: false,
            });
        } else {
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::GLOBAL_TIMESTAMP_LO,
                addr: dst,
                masked_low: false,
            });
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::GLOBAL_TIMESTAMP_HI,
                addr: dst + 4,
                masked_low: false,
            });
            instrs.push(Instruction::RegStoreMem {
                reg: isa::reg::GLOBAL_TIMESTAMP_LO,
                addr: dst,
                masked_low: true,
            });
        }
        self.emit_all(&instrs)?;
        if let Some(event) = signal {
            self.encode_signal(event, 1)?;
        }
        self.flush_immediate()
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        let allocator = self.device.allocator().clone();
        for alloc in self.transient.drain(..) {
            allocator.free(&alloc);
        }
        if let Some(counter) = self.inorder_counter.take() {
            allocator.free(&counter);
        }
        self.stream.reset(&*allocator);
        allocator.free(&self.stream.segments()[0].alloc);
        for event in self.bound_events.drain(..) {
            event.release_binding(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPool, EventPoolDesc, EventScope};
    use crate::kernel::{KernelDescriptor, Module};
    use quartz_common::RuntimeSettings;
    use quartz_hw::Generation;

    fn device(gen: Generation) -> Arc<Device> {
        Device::new(gen, RuntimeSettings::default()).unwrap()
    }

    fn decoded(list: &CommandList) -> Vec<Instruction> {
        let mut out = Vec::new();
        for seg in list.stream().segments() {
            out.extend(quartz_hw::decoder::decode_all(seg.bytes()).unwrap());
        }
        out
    }

    fn kernel_from(device: &Arc<Device>, desc: KernelDescriptor) -> Arc<Kernel> {
        let name = desc.name.clone();
        let module = Module::new(device.allocator().clone(), vec![desc]).unwrap();
        Kernel::create(&module, &name).unwrap()
    }

    fn plain_kernel(device: &Arc<Device>) -> Arc<Kernel> {
        kernel_from(device, KernelDescriptor::new("k"))
    }

    fn printf_kernel(device: &Arc<Device>) -> Arc<Kernel> {
        let mut desc = KernelDescriptor::new("printer");
        desc.uses_printf = true;
        kernel_from(device, desc)
    }

    fn event_with(
        device: &Arc<Device>,
        packets: u32,
        timestamps: bool,
    ) -> (Arc<EventPool>, Arc<Event>) {
        let pool = EventPool::new(
            device,
            EventPoolDesc {
                events: 2,
                packets_per_event: packets,
                host_visible: true,
                timestamps,
            },
        )
        .unwrap();
        let event =
            Event::create(&pool, 0, EventScope::HostVisible, EventScope::None).unwrap();
        (pool, event)
    }

    fn buffer(device: &Arc<Device>, size: u64) -> AllocationHandle {
        device
            .allocator()
            .allocate(size, 64, AllocKind::DeviceLocal)
            .unwrap()
    }

    fn dispatch_count(instrs: &[Instruction]) -> usize {
        instrs
            .iter()
            .filter(|i| matches!(i, Instruction::Dispatch { .. }))
            .count()
    }

    #[test]
    fn test_launch_rejects_zero_dims_and_stays_usable() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            list.append_launch_kernel(&kernel, GroupCount::new(0, 1, 1), None, &[]),
            Err(Status::InvalidArgument)
        );
        // A validation failure leaves the list open and usable.
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.close().unwrap();
    }

    #[test]
    fn test_wait_event_predicate_roundtrip() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let (_pool, event) = event_with(&device, 1, false);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(4, 1, 1), None, &[&event])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        let waits: Vec<&Instruction> = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::SemWait { .. }))
            .collect();
        assert_eq!(waits.len(), 1);
        match waits[0] {
            Instruction::SemWait {
                addr, value, op, ..
            } => {
                assert_eq!(*addr, event.completion_addr(0));
                assert_eq!(*value, STATE_CLEARED as u64);
                assert_eq!(*op, CompareOp::NotEqual);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_residency_dedup_after_close() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x1000);
        let src = buffer(&device, 0x1000);
        let mut list =
            CommandList::create(&device, EngineClass::Copy, OrderingMode::OutOfOrder).unwrap();
        for _ in 0..3 {
            list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x100, None, &[])
                .unwrap();
        }
        list.close().unwrap();

        let snapshot = list.residency().snapshot();
        assert_eq!(snapshot.iter().filter(|h| h.id == dst.id).count(), 1);
        assert_eq!(snapshot.iter().filter(|h| h.id == src.id).count(), 1);
    }

    #[test]
    fn test_printf_registered_once_per_list() {
        let device = device(Generation::Gen2);
        let kernel = printf_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        for _ in 0..4 {
            list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
                .unwrap();
        }
        assert_eq!(list.printf_registration_count(), 1);
        list.reset().unwrap();
        assert_eq!(list.printf_registration_count(), 0);
    }

    #[test]
    fn test_copy_split_matches_span_ceiling() {
        let device = device(Generation::Gen2);
        let span = device.caps().max_copy_dispatch_span;
        // Aligned start and size: the whole copy goes through the middle
        // path, so the dispatch count is exactly ceil(size / span).
        let size = span * 2 + span / 2;
        let dst = buffer(&device, size);
        let src = buffer(&device, size);
        let (_pool, event) = event_with(&device, 4, true);

        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_copy(dst.gpu_addr, src.gpu_addr, size, Some(&event), &[])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        assert_eq!(dispatch_count(&instrs), 3);

        // One timestamp bracket around the whole copy, not one per
        // dispatch: two wide clock stores before, two after.
        let clock_stores = instrs
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    Instruction::RegStoreMem { reg, .. }
                        if *reg == isa::reg::GLOBAL_TIMESTAMP || *reg == isa::reg::CTX_TIMESTAMP
                )
            })
            .count();
        assert_eq!(clock_stores, 4);
    }

    #[test]
    fn test_reset_reencode_matches_fresh_list() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let dst = buffer(&device, 0x2000);
        let src = buffer(&device, 0x2000);

        let encode = |list: &mut CommandList| {
            list.append_launch_kernel(&kernel, GroupCount::new(8, 1, 1), None, &[])
                .unwrap();
            list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x800, None, &[])
                .unwrap();
            list.close().unwrap();
        };

        let mut recycled =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        encode(&mut recycled);
        recycled.reset().unwrap();
        assert_eq!(recycled.stream().used_bytes(), 0);
        assert!(recycled.residency().is_empty());
        encode(&mut recycled);

        let mut fresh =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        encode(&mut fresh);

        assert_eq!(recycled.stream().used_bytes(), fresh.stream().used_bytes());
        assert_eq!(recycled.residency().len(), fresh.residency().len());
    }

    #[test]
    fn test_copy_engine_two_copies_one_signal_each() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x1000);
        let src = buffer(&device, 0x1000);
        let (_pool, event) = event_with(&device, 2, false);

        let mut list =
            CommandList::create(&device, EngineClass::Copy, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x400, Some(&event), &[])
            .unwrap();
        list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x400, Some(&event), &[])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        // Exactly one host-scoped flush-write per call, no duplicate
        // residency for the shared allocations.
        let signals = instrs
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    Instruction::MemWrite { flush: FlushScope::Host, .. }
                )
            })
            .count();
        assert_eq!(signals, 2);
        let snapshot = list.residency().snapshot();
        assert_eq!(snapshot.iter().filter(|h| h.id == dst.id).count(), 1);
        assert_eq!(snapshot.iter().filter(|h| h.id == src.id).count(), 1);
    }

    #[test]
    fn test_immediate_list_drains_printf_per_append() {
        let device = device(Generation::Gen2);
        let kernel = printf_kernel(&device);
        let mut list =
            CommandList::create_immediate(&device, EngineClass::Compute, OrderingMode::OutOfOrder)
                .unwrap();

        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        assert_eq!(kernel.printf_output_count(), 1);
        assert_eq!(list.printf_registration_count(), 0);

        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        assert_eq!(kernel.printf_output_count(), 2);
        assert_eq!(list.printf_registration_count(), 0);
    }

    #[test]
    fn test_indirect_launch_emits_register_program() {
        let device = device(Generation::Gen2);
        let mut desc = KernelDescriptor::new("indirect");
        desc.payload_size = 96;
        desc.work_dim_offset = Some(64);
        desc.global_size_offset = Some(68);
        let kernel = kernel_from(&device, desc);

        let args = buffer(&device, 64);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel_indirect(&kernel, args.gpu_addr, None, &[])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instruction::RegLoadMem { reg, addr }
                if *reg == isa::reg::DISPATCH_DIM_X && *addr == args.gpu_addr
        )));
        assert!(instrs
            .iter()
            .any(|i| matches!(i, Instruction::RegMath { op: MathOp::Shl, .. })));
        assert!(instrs
            .iter()
            .any(|i| matches!(i, Instruction::Dispatch { indirect: true, .. })));
        assert!(list.residency().has(&args));
    }

    #[test]
    fn test_indirect_unresolved_args() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            list.append_launch_kernel_indirect(&kernel, 0xDEAD_0000, None, &[]),
            Err(Status::OutOfDeviceMemory)
        );
    }

    #[test]
    fn test_cooperative_launch_constraints() {
        let gen1 = device(Generation::Gen1);
        let kernel = plain_kernel(&gen1);
        let (_pool, event) = event_with(&gen1, 1, false);
        let mut list =
            CommandList::create(&gen1, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        // No wait predication on this generation.
        assert_eq!(
            list.append_launch_cooperative_kernel(
                &kernel,
                GroupCount::new(1, 1, 1),
                None,
                &[&event]
            ),
            Err(Status::InvalidArgument)
        );
        list.append_launch_cooperative_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();

        let mut copy_list =
            CommandList::create(&gen1, EngineClass::Copy, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            copy_list.append_launch_cooperative_kernel(
                &kernel,
                GroupCount::new(1, 1, 1),
                None,
                &[]
            ),
            Err(Status::Unsupported)
        );
    }

    #[test]
    fn test_wide_wait_lowering_per_generation() {
        let target = |device: &Arc<Device>| {
            device
                .allocator()
                .allocate(64, 64, AllocKind::HostVisible)
                .unwrap()
        };

        let gen1 = device(Generation::Gen1);
        let buf = target(&gen1);
        let mut list =
            CommandList::create(&gen1, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_wait_on_memory(buf.gpu_addr, 5, CompareOp::GreaterOrEqual, DataWidth::Bits64)
            .unwrap();
        list.close().unwrap();
        let instrs = decoded(&list);
        let loads = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::RegLoadMem { .. }))
            .count();
        assert_eq!(loads, 2);
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instruction::SemWaitReg { op: CompareOp::GreaterOrEqual, value: 5, .. }
        )));

        let gen2 = device(Generation::Gen2);
        let buf = target(&gen2);
        let mut list =
            CommandList::create(&gen2, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_wait_on_memory(buf.gpu_addr, 5, CompareOp::GreaterOrEqual, DataWidth::Bits64)
            .unwrap();
        list.close().unwrap();
        let instrs = decoded(&list);
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instruction::SemWait { width: DataWidth::Bits64, .. }
        )));
        assert!(!instrs
            .iter()
            .any(|i| matches!(i, Instruction::RegLoadMem { .. })));
    }

    #[test]
    fn test_wait_on_memory_unresolved_is_oom() {
        let device = device(Generation::Gen2);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            list.append_wait_on_memory(0xBAD0_0000, 1, CompareOp::Equal, DataWidth::Bits32),
            Err(Status::OutOfDeviceMemory)
        );
    }

    #[test]
    fn test_fill_strategies() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x40000);

        // Small aligned single-word pattern: immediate fill.
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_fill(dst.gpu_addr, &[0xAB, 0xCD, 0xEF, 0x01], 0x100, None, &[])
            .unwrap();
        list.close().unwrap();
        let instrs = decoded(&list);
        assert!(instrs
            .iter()
            .any(|i| matches!(i, Instruction::FillImm { size: 0x100, .. })));
        assert_eq!(dispatch_count(&instrs), 0);

        // Wide pattern: kernel dispatch with a trailing remainder group.
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        let pattern = [0u8; 8];
        // 33 * 8-byte items over SIMD 32: one full dispatch + remainder.
        list.append_memory_fill(dst.gpu_addr, &pattern, 33 * 8, None, &[])
            .unwrap();
        list.close().unwrap();
        let instrs = decoded(&list);
        assert_eq!(dispatch_count(&instrs), 2);

        // Misaligned pattern length is rejected.
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            list.append_memory_fill(dst.gpu_addr, &[0u8; 3], 9, None, &[]),
            Err(Status::InvalidArgument)
        );
    }

    #[test]
    fn test_blit_priming_emitted_once() {
        let device = device(Generation::Gen1);
        let dst = buffer(&device, 0x1000);
        let src = buffer(&device, 0x1000);
        let mut list =
            CommandList::create(&device, EngineClass::Copy, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x200, None, &[])
            .unwrap();
        list.append_memory_copy(dst.gpu_addr, src.gpu_addr, 0x200, None, &[])
            .unwrap();
        list.close().unwrap();

        let primes = decoded(&list)
            .iter()
            .filter(|i| matches!(i, Instruction::CopyBlit { prime: true, .. }))
            .count();
        assert_eq!(primes, 1);
    }

    #[test]
    fn test_image_hazard_flush_between_dispatches() {
        let gen1 = device(Generation::Gen1);
        let mut desc = KernelDescriptor::new("imgwrite");
        desc.writes_images = true;
        let kernel = kernel_from(&gen1, desc.clone());

        let mut list =
            CommandList::create(&gen1, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.close().unwrap();
        let hazard_flushes = decoded(&list)
            .iter()
            .filter(|i| matches!(i, Instruction::Barrier { texture_invalidate: true, .. }))
            .count();
        assert_eq!(hazard_flushes, 1);

        // A generation without the workaround encodes nothing extra.
        let gen2 = device(Generation::Gen2);
        let kernel = kernel_from(&gen2, desc);
        let mut list =
            CommandList::create(&gen2, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.close().unwrap();
        assert_eq!(
            decoded(&list)
                .iter()
                .filter(|i| matches!(i, Instruction::Barrier { texture_invalidate: true, .. }))
                .count(),
            0
        );
    }

    #[test]
    fn test_arbitration_programmed_on_delta_only() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.close().unwrap();

        let programs = decoded(&list)
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    Instruction::RegLoadImm { reg, .. } if *reg == isa::reg::ARBITRATION_POLICY
                )
            })
            .count();
        assert_eq!(programs, 1);
    }

    #[test]
    fn test_inorder_dispatches_are_chained() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::InOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        let counter = list.inorder_counter.unwrap();
        // Second dispatch waits for the first one's completion write.
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instruction::SemWait {
                addr, value: 1, op: CompareOp::GreaterOrEqual, ..
            } if *addr == counter.gpu_addr
        )));
        let counter_writes = instrs
            .iter()
            .filter(|i| matches!(
                i,
                Instruction::MemWrite { addr, .. } if *addr == counter.gpu_addr
            ))
            .count();
        assert_eq!(counter_writes, 2);
    }

    #[test]
    fn test_closed_list_rejects_appends() {
        let device = device(Generation::Gen2);
        let kernel = plain_kernel(&device);
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.close().unwrap();
        assert_eq!(
            list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[]),
            Err(Status::InvalidState)
        );
        // Close is idempotent.
        list.close().unwrap();
        list.reset().unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
            .unwrap();
    }

    #[test]
    fn test_signal_event_exclusive_to_one_list() {
        let device = device(Generation::Gen2);
        let (_pool, event) = event_with(&device, 1, false);
        let mut a =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        let mut b =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        a.append_signal_event(&event).unwrap();
        assert_eq!(b.append_signal_event(&event), Err(Status::InvalidArgument));
        a.reset().unwrap();
        b.append_signal_event(&event).unwrap();
    }

    #[test]
    fn test_region_copy_one_operation_per_slice() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x10000);
        let src = buffer(&device, 0x10000);
        let region = quartz_common::CopyRegion {
            origin_x: 0,
            origin_y: 0,
            origin_z: 0,
            width: 64,
            height: 4,
            depth: 3,
        };

        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_copy_region(
            dst.gpu_addr,
            &region,
            64,
            256,
            src.gpu_addr,
            &region,
            64,
            256,
            None,
            &[],
        )
        .unwrap();
        list.close().unwrap();
        assert_eq!(dispatch_count(&decoded(&list)), 3);

        // Copy engine with row-contiguous pitches: one blit per slice,
        // each advanced by the slice pitch.
        let mut list =
            CommandList::create(&device, EngineClass::Copy, OrderingMode::OutOfOrder).unwrap();
        list.append_memory_copy_region(
            dst.gpu_addr,
            &region,
            64,
            256,
            src.gpu_addr,
            &region,
            64,
            256,
            None,
            &[],
        )
        .unwrap();
        list.close().unwrap();
        let blits: Vec<(u64, u64)> = decoded(&list)
            .iter()
            .filter_map(|i| match i {
                Instruction::CopyBlit {
                    src, dst, prime: false, ..
                } => Some((*src, *dst)),
                _ => None,
            })
            .collect();
        assert_eq!(blits.len(), 3);
        assert_eq!(blits[1].0, blits[0].0 + 256);
        assert_eq!(blits[2].1, blits[0].1 + 512);
    }

    #[test]
    fn test_region_extent_mismatch_rejected() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x1000);
        let src = buffer(&device, 0x1000);
        let a = quartz_common::CopyRegion::linear(64);
        let mut b = a;
        b.width = 32;
        let mut list =
            CommandList::create(&device, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        assert_eq!(
            list.append_memory_copy_region(
                dst.gpu_addr,
                &a,
                64,
                64,
                src.gpu_addr,
                &b,
                64,
                64,
                None,
                &[]
            ),
            Err(Status::InvalidArgument)
        );
    }

    #[test]
    fn test_narrow_timestamp_generation_emits_masked_reread() {
        let gen1 = device(Generation::Gen1);
        let kernel = plain_kernel(&gen1);
        let (_pool, event) = event_with(&gen1, 1, true);
        let mut list =
            CommandList::create(&gen1, EngineClass::Compute, OrderingMode::OutOfOrder).unwrap();
        list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), Some(&event), &[])
            .unwrap();
        list.close().unwrap();

        let instrs = decoded(&list);
        let masked = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::RegStoreMem { masked_low: true, .. }))
            .count();
        // One masked low re-read per clock per bracket side: 2 clocks x 2 sides.
        assert_eq!(masked, 4);
        assert!(!instrs.iter().any(|i| matches!(
            i,
            Instruction::RegStoreMem { reg, .. }
                if *reg == isa::reg::GLOBAL_TIMESTAMP || *reg == isa::reg::CTX_TIMESTAMP
        )));
    }

    #[test]
    fn test_segment_chaining_mid_list() {
        let device = device(Generation::Gen2);
        let dst = buffer(&device, 0x1000);
        let mut list = CommandList::create_with_segment_size(
            &device,
            EngineClass::Compute,
            OrderingMode::OutOfOrder,
            256,
        )
        .unwrap();
        for _ in 0..24 {
            list.append_write_to_memory(dst.gpu_addr, 1, DataWidth::Bits32, FlushScope::None)
                .unwrap();
        }
        list.close().unwrap();
        assert!(list.stream().segment_count() > 1);

        let chains = decoded(&list)
            .iter()
            .filter(|i| matches!(i, Instruction::BatchStart { .. }))
            .count();
        assert_eq!(chains, list.stream().segment_count() - 1);
        // Every segment allocation is resident.
        for seg in list.stream().segments() {
            assert!(list.residency().has(&seg.alloc));
        }
    }
}
