// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device assembly and the execution backend.
//!
//! A `Device` bundles a capability table, an allocator, the shared memory
//! model, the builtin-kernel library and a backend. `SoftDevice` is the
//! reference backend: it decodes the wire stream against the shared
//! memory model, evaluates semaphore predicates with a bounded spin
//! budget, and reads monotonic fake clocks for timestamp stores. Device
//! loss is sticky once observed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use quartz_common::settings::PacketPolicy;
use quartz_common::{GpuAddr, Result, RuntimeSettings, Status};
use quartz_hw::{isa, Capabilities, DataWidth, Generation, Instruction, StreamReader};

use crate::kernel::BuiltinLibrary;
use crate::memory::{DeviceAllocator, Memory, SystemAllocator};

/// Backend the queue hands chained instruction streams to.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the stream starting at `start`, following BATCH_START
    /// jumps until BATCH_END. Returns `DeviceLost` on a detected hang.
    fn submit(&self, start: GpuAddr, memory: &Memory) -> Result<()>;
}

/// Upper bound on instructions per submission; a stream that runs past
/// this is treated as hung.
const MAX_INSTRUCTIONS: u32 = 1 << 22;

struct GprFile {
    values: [u64; 256],
    /// Source address of the last REG_LOAD_MEM into each register. A
    /// semaphore wait in register-compare mode re-fetches these each
    /// poll iteration (hardware poll-mode semantics).
    source: [Option<GpuAddr>; 256],
}

/// Software interpreter backend.
pub struct SoftDevice {
    hang_spin_budget: u32,
    global_clock: AtomicU64,
    ctx_clock: AtomicU64,
    gprs: Mutex<GprFile>,
}

impl SoftDevice {
    pub fn new(hang_spin_budget: u32) -> Self {
        Self {
            hang_spin_budget,
            global_clock: AtomicU64::new(0x1000),
            ctx_clock: AtomicU64::new(0x100),
            gprs: Mutex::new(GprFile {
                values: [0; 256],
                source: [None; 256],
            }),
        }
    }

    fn fetch(&self, memory: &Memory, pc: GpuAddr) -> Result<(Instruction, u64)> {
        let header = memory.read_u32(pc);
        let total = 4 * (1 + isa::header_len(header) as usize);
        let mut bytes = vec![0u8; total];
        memory.read(pc, &mut bytes);
        let mut reader = StreamReader::new(&bytes);
        match reader.next() {
            Ok(Some(instr)) => Ok((instr, total as u64)),
            Ok(None) | Err(_) => {
                log::warn!("soft device: undecodable stream at 0x{pc:X}");
                Err(Status::DeviceLost)
            }
        }
    }

    fn read_operand(memory: &Memory, addr: GpuAddr, width: DataWidth) -> u64 {
        match width {
            DataWidth::Bits32 => memory.read_u32(addr) as u64,
            DataWidth::Bits64 => memory.read_u64(addr),
        }
    }

    fn store_register(&self, memory: &Memory, reg: u16, addr: GpuAddr) {
        let global = self.global_clock.load(Ordering::Acquire);
        let ctx = self.ctx_clock.load(Ordering::Acquire);
        match reg {
            isa::reg::GLOBAL_TIMESTAMP_LO => memory.write_u32(addr, global as u32),
            isa::reg::GLOBAL_TIMESTAMP_HI => memory.write_u32(addr, (global >> 32) as u32),
            isa::reg::GLOBAL_TIMESTAMP => memory.write_u64(addr, global),
            isa::reg::CTX_TIMESTAMP_LO => memory.write_u32(addr, ctx as u32),
            isa::reg::CTX_TIMESTAMP_HI => memory.write_u32(addr, (ctx >> 32) as u32),
            isa::reg::CTX_TIMESTAMP => memory.write_u64(addr, ctx),
            r => {
                let value = if (r as usize) < 256 {
                    self.gprs.lock().values[r as usize]
                } else {
                    0
                };
                memory.write_u32(addr, value as u32);
            }
        }
    }
}

impl DeviceBackend for SoftDevice {
    fn name(&self) -> &str {
        "soft"
    }

    fn submit(&self, start: GpuAddr, memory: &Memory) -> Result<()> {
        let mut pc = start;
        let mut executed = 0u32;
        log::debug!("soft device: submit stream at 0x{start:X}");
        loop {
            executed += 1;
            if executed > MAX_INSTRUCTIONS {
                log::warn!("soft device: runaway stream at 0x{pc:X}");
                return Err(Status::DeviceLost);
            }
            let (instr, size) = self.fetch(memory, pc)?;
            pc += size;
            self.global_clock.fetch_add(1, Ordering::AcqRel);
            self.ctx_clock.fetch_add(1, Ordering::AcqRel);

            match instr {
                Instruction::Nop => {}
                Instruction::BatchEnd => return Ok(()),
                Instruction::BatchStart { addr } => {
                    pc = addr;
                }
                Instruction::SemWait {
                    addr,
                    value,
                    op,
                    width,
                } => {
                    let mut satisfied = false;
                    for _ in 0..self.hang_spin_budget {
                        if op.evaluate(Self::read_operand(memory, addr, width), value) {
                            satisfied = true;
                            break;
                        }
                        std::thread::yield_now();
                    }
                    if !satisfied {
                        log::warn!(
                            "soft device: semaphore at 0x{addr:X} never satisfied ({op:?} {value:#X})"
                        );
                        return Err(Status::DeviceLost);
                    }
                }
                Instruction::SemWaitReg {
                    base_gpr,
                    value,
                    mask,
                    op,
                } => {
                    let lo_idx = base_gpr as usize;
                    let hi_idx = lo_idx + 1;
                    if hi_idx >= 256 {
                        return Err(Status::DeviceLost);
                    }
                    let mut satisfied = false;
                    for _ in 0..self.hang_spin_budget {
                        let observed = {
                            let mut gprs = self.gprs.lock();
                            // Poll mode: re-fetch registers loaded from memory.
                            for idx in [lo_idx, hi_idx] {
                                if let Some(src) = gprs.source[idx] {
                                    gprs.values[idx] = memory.read_u32(src) as u64;
                                }
                            }
                            gprs.values[hi_idx] << 32 | (gprs.values[lo_idx] & 0xFFFF_FFFF)
                        };
                        if op.evaluate(observed & mask, value & mask) {
                            satisfied = true;
                            break;
                        }
                        std::thread::yield_now();
                    }
                    if !satisfied {
                        log::warn!("soft device: register semaphore never satisfied");
                        return Err(Status::DeviceLost);
                    }
                }
                Instruction::MemWrite {
                    addr, value, width, ..
                } => match width {
                    DataWidth::Bits32 => {
                        if addr != 0 {
                            memory.write_u32(addr, value as u32)
                        }
                    }
                    DataWidth::Bits64 => memory.write_u64(addr, value),
                },
                Instruction::Barrier { post_sync, .. } => {
                    if let Some((addr, value)) = post_sync {
                        memory.write_u32(addr, value);
                    }
                }
                Instruction::Dispatch {
                    kernel_addr,
                    group_count,
                    indirect,
                    ..
                } => {
                    // Kernel execution itself is opaque to the runtime.
                    if indirect {
                        let gprs = self.gprs.lock();
                        log::trace!(
                            "soft device: indirect dispatch of 0x{kernel_addr:X} dims [{}, {}, {}]",
                            gprs.values[isa::reg::DISPATCH_DIM_X as usize],
                            gprs.values[isa::reg::DISPATCH_DIM_Y as usize],
                            gprs.values[isa::reg::DISPATCH_DIM_Z as usize],
                        );
                    } else {
                        log::trace!(
                            "soft device: dispatch of 0x{kernel_addr:X} dims {group_count:?}"
                        );
                    }
                }
                Instruction::RegLoadMem { reg, addr } => {
                    let idx = reg as usize;
                    if idx < 256 {
                        let mut gprs = self.gprs.lock();
                        gprs.values[idx] = memory.read_u32(addr) as u64;
                        gprs.source[idx] = Some(addr);
                    }
                }
                Instruction::RegLoadImm { reg, value } => {
                    let idx = reg as usize;
                    if idx < 256 {
                        let mut gprs = self.gprs.lock();
                        gprs.values[idx] = value as u64;
                        gprs.source[idx] = None;
                    }
                }
                Instruction::RegMath {
                    op, dst, src_a, src_b,
                } => {
                    let dst_idx = dst as usize;
                    if dst_idx < 256 {
                        let mut gprs = self.gprs.lock();
                        let a = gprs.values[src_a as usize & 0xFF];
                        let b = match src_b {
                            quartz_hw::MathOperand::Gpr(r) => gprs.values[r as usize & 0xFF],
                            quartz_hw::MathOperand::Imm(v) => v as u64,
                        };
                        gprs.values[dst_idx] = op.apply(a, b);
                        gprs.source[dst_idx] = None;
                    }
                }
                Instruction::RegStoreMem { reg, addr, .. } => {
                    self.store_register(memory, reg, addr);
                }
                Instruction::CopyBlit {
                    src, dst, size, prime,
                } => {
                    if !prime && size > 0 {
                        memory.copy(src, dst, size as u64);
                    }
                }
                Instruction::FillImm { dst, value, size } => {
                    memory.fill_u32(dst, value, size as u64);
                }
            }
        }
    }
}

/// A logical device: capability table, allocator, memory, backend and
/// builtins, plus the sticky device-lost flag.
pub struct Device {
    caps: Capabilities,
    settings: RuntimeSettings,
    memory: Arc<Memory>,
    allocator: Arc<dyn DeviceAllocator>,
    backend: Arc<dyn DeviceBackend>,
    builtins: BuiltinLibrary,
    lost: AtomicBool,
    next_list_id: AtomicU64,
}

impl Device {
    /// Device over the reference allocator and soft backend.
    pub fn new(generation: Generation, settings: RuntimeSettings) -> Result<Arc<Device>> {
        let memory = Arc::new(Memory::new());
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(SystemAllocator::new());
        let backend: Arc<dyn DeviceBackend> = Arc::new(SoftDevice::new(settings.hang_spin_budget));
        Self::with_parts(
            Capabilities::for_generation(generation),
            settings,
            memory,
            allocator,
            backend,
        )
    }

    /// Assemble a device from externally supplied parts.
    pub fn with_parts(
        caps: Capabilities,
        settings: RuntimeSettings,
        memory: Arc<Memory>,
        allocator: Arc<dyn DeviceAllocator>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Arc<Device>> {
        let builtins = BuiltinLibrary::new(allocator.clone())?;
        log::debug!(
            "device: {:?} on `{}` backend",
            caps.generation,
            backend.name()
        );
        Ok(Arc::new(Self {
            caps,
            settings,
            memory,
            allocator,
            backend,
            builtins,
            lost: AtomicBool::new(false),
            next_list_id: AtomicU64::new(1),
        }))
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    pub fn builtins(&self) -> &BuiltinLibrary {
        &self.builtins
    }

    /// Effective packet signal policy: settings override, else the
    /// capability table default.
    pub fn packet_policy(&self) -> PacketPolicy {
        self.settings
            .packet_policy
            .unwrap_or(self.caps.default_packet_policy)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::warn!("device: marked lost");
        }
    }

    pub(crate) fn next_list_id(&self) -> u64 {
        self.next_list_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Hand a stream to the backend, folding hangs into the sticky flag.
    pub(crate) fn submit(&self, start: GpuAddr) -> Result<()> {
        if self.is_lost() {
            return Err(Status::DeviceLost);
        }
        match self.backend.submit(start, &self.memory) {
            Err(Status::DeviceLost) => {
                self.mark_lost();
                Err(Status::DeviceLost)
            }
            other => other,
        }
    }
}
