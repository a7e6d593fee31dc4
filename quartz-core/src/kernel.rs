// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kernel and module objects.
//!
//! A module owns the device-resident ISA for a set of kernels. A kernel
//! carries its immutable descriptor plus mutable launch state (group
//! size, argument payload, per-kernel residency). Kernels with deferred
//! console output own a printf buffer that the runtime drains at
//! synchronization points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use quartz_common::{AllocKind, AllocationHandle, GpuAddr, GroupCount, Result, Status};
use quartz_hw::ArbitrationPolicy;

use crate::memory::DeviceAllocator;

/// Size of the deferred-output buffer allocated per printf kernel.
pub const PRINTF_BUFFER_SIZE: u64 = 0x40_0000;

/// ISA region reserved per kernel inside a module allocation.
const ISA_SLOT_BYTES: u64 = 0x1000;

/// Immutable kernel metadata supplied by the kernel-binary producer.
#[derive(Debug, Clone)]
pub struct KernelDescriptor {
    pub name: String,
    pub simd_width: u32,
    /// Cross-thread data size in bytes.
    pub payload_size: u32,
    /// Byte offset of each argument inside the payload.
    pub arg_offsets: Vec<u32>,
    pub scratch_size: u32,
    pub uses_printf: bool,
    pub writes_images: bool,
    /// Payload offset the work dimension is stored at for indirect launches.
    pub work_dim_offset: Option<u32>,
    /// Payload offset of three consecutive u32 global sizes for indirect launches.
    pub global_size_offset: Option<u32>,
    /// Arbitration policy this kernel requires, if any.
    pub arbitration: Option<ArbitrationPolicy>,
}

impl KernelDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            simd_width: 32,
            payload_size: 64,
            arg_offsets: Vec::new(),
            scratch_size: 0,
            uses_printf: false,
            writes_images: false,
            work_dim_offset: None,
            global_size_offset: None,
            arbitration: None,
        }
    }
}

struct ModuleKernel {
    desc: KernelDescriptor,
    isa_offset: u64,
}

/// A loaded kernel binary: one ISA allocation shared by its kernels.
pub struct Module {
    allocator: Arc<dyn DeviceAllocator>,
    isa_alloc: AllocationHandle,
    kernels: HashMap<String, ModuleKernel>,
}

impl Module {
    pub fn new(
        allocator: Arc<dyn DeviceAllocator>,
        descriptors: Vec<KernelDescriptor>,
    ) -> Result<Arc<Module>> {
        if descriptors.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let isa_alloc = allocator.allocate(
            descriptors.len() as u64 * ISA_SLOT_BYTES,
            64,
            AllocKind::DeviceLocal,
        )?;
        let mut kernels = HashMap::new();
        for (i, desc) in descriptors.into_iter().enumerate() {
            let name = desc.name.clone();
            kernels.insert(
                name,
                ModuleKernel {
                    desc,
                    isa_offset: i as u64 * ISA_SLOT_BYTES,
                },
            );
        }
        Ok(Arc::new(Self {
            allocator,
            isa_alloc,
            kernels,
        }))
    }

    pub fn isa_allocation(&self) -> AllocationHandle {
        self.isa_alloc
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.keys().map(String::as_str).collect()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.allocator.free(&self.isa_alloc);
    }
}

struct KernelState {
    group_size: [u32; 3],
    payload: Vec<u8>,
    args: Vec<AllocationHandle>,
}

/// An instantiated kernel with mutable launch state.
pub struct Kernel {
    module: Arc<Module>,
    desc: KernelDescriptor,
    isa_addr: GpuAddr,
    printf_buffer: Option<AllocationHandle>,
    printf_calls: AtomicU32,
    /// Device mutex guarding the deferred-output drain.
    printf_lock: Mutex<()>,
    state: Mutex<KernelState>,
}

impl Kernel {
    pub fn create(module: &Arc<Module>, name: &str) -> Result<Arc<Kernel>> {
        let entry = module.kernels.get(name).ok_or(Status::InvalidArgument)?;
        let desc = entry.desc.clone();
        let printf_buffer = if desc.uses_printf {
            Some(
                module
                    .allocator
                    .allocate(PRINTF_BUFFER_SIZE, 64, AllocKind::Internal)?,
            )
        } else {
            None
        };
        Ok(Arc::new(Self {
            isa_addr: module.isa_alloc.gpu_addr + entry.isa_offset,
            module: module.clone(),
            printf_buffer,
            printf_calls: AtomicU32::new(0),
            printf_lock: Mutex::new(()),
            state: Mutex::new(KernelState {
                group_size: [desc.simd_width, 1, 1],
                payload: vec![0u8; desc.payload_size as usize],
                args: Vec::new(),
            }),
            desc,
        }))
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.desc
    }

    pub fn isa_addr(&self) -> GpuAddr {
        self.isa_addr
    }

    pub fn uses_printf(&self) -> bool {
        self.desc.uses_printf
    }

    pub fn printf_buffer(&self) -> Option<AllocationHandle> {
        self.printf_buffer
    }

    pub fn set_group_size(&self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(Status::InvalidArgument);
        }
        self.state.lock().group_size = [x, y, z];
        Ok(())
    }

    pub fn group_size(&self) -> [u32; 3] {
        self.state.lock().group_size
    }

    /// Pick a group size dividing the dispatch extents, capped by SIMD width.
    pub fn suggest_group_size(&self, extent: GroupCount) -> [u32; 3] {
        let x = largest_divisor_leq(extent.x, self.desc.simd_width);
        let y = largest_divisor_leq(extent.y, (self.desc.simd_width / x).max(1));
        [x, y, 1]
    }

    /// Bind a buffer argument: patches its address into the payload and
    /// records the allocation for residency.
    pub fn set_arg_buffer(&self, index: usize, handle: AllocationHandle, addr: GpuAddr) -> Result<()> {
        let offset = *self.desc.arg_offsets.get(index).ok_or(Status::InvalidArgument)? as usize;
        let mut state = self.state.lock();
        if offset + 8 > state.payload.len() {
            return Err(Status::InvalidArgument);
        }
        state.payload[offset..offset + 8].copy_from_slice(&addr.to_le_bytes());
        if !state.args.iter().any(|a| a.id == handle.id) {
            state.args.push(handle);
        }
        Ok(())
    }

    /// Store an immediate argument value into the payload.
    pub fn set_arg_value(&self, index: usize, bytes: &[u8]) -> Result<()> {
        let offset = *self.desc.arg_offsets.get(index).ok_or(Status::InvalidArgument)? as usize;
        let mut state = self.state.lock();
        if offset + bytes.len() > state.payload.len() {
            return Err(Status::InvalidArgument);
        }
        state.payload[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Current cross-thread payload image.
    pub fn payload_image(&self) -> Vec<u8> {
        self.state.lock().payload.clone()
    }

    /// Allocations a dispatch of this kernel makes resident: module ISA,
    /// bound buffer arguments, and the printf buffer.
    pub fn residency(&self) -> Vec<AllocationHandle> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.args.len() + 2);
        out.push(self.module.isa_alloc);
        out.extend_from_slice(&state.args);
        if let Some(buf) = self.printf_buffer {
            out.push(buf);
        }
        out
    }

    /// Drain the deferred-output buffer. Called by the runtime at the
    /// next synchronization point after a dispatch, never concurrently
    /// with itself.
    pub fn print_output(&self, hang_detected: bool) {
        let _guard = self.printf_lock.lock();
        self.printf_calls.fetch_add(1, Ordering::AcqRel);
        if hang_detected {
            log::warn!(
                "kernel {}: draining printf buffer after device hang",
                self.desc.name
            );
        } else {
            log::debug!("kernel {}: draining printf buffer", self.desc.name);
        }
    }

    /// Number of completed drains, one per intervening synchronization point.
    pub fn printf_output_count(&self) -> u32 {
        self.printf_calls.load(Ordering::Acquire)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Some(buf) = self.printf_buffer.take() {
            self.module.allocator.free(&buf);
        }
    }
}

fn largest_divisor_leq(n: u32, cap: u32) -> u32 {
    let cap = cap.max(1).min(n.max(1));
    (1..=cap).rev().find(|d| n % d == 0).unwrap_or(1)
}

/// Builtin kernels the encoder dispatches for copies and fills.
///
/// Configuring a builtin (argument patching plus launch) is serialized by
/// the library lock since builtins are shared device-wide.
pub struct BuiltinLibrary {
    #[allow(dead_code)]
    module: Arc<Module>,
    lock: Mutex<()>,
    pub copy_side: Arc<Kernel>,
    pub copy_middle: Arc<Kernel>,
    pub fill_pattern: Arc<Kernel>,
    pub copy_rect2d: Arc<Kernel>,
}

/// Element size the middle-copy builtin moves per work item.
pub const COPY_MIDDLE_ELEMENT: u64 = 16;

impl BuiltinLibrary {
    pub fn new(allocator: Arc<dyn DeviceAllocator>) -> Result<Self> {
        let mut copy_side = KernelDescriptor::new("builtin_copy_side");
        copy_side.payload_size = 32;
        copy_side.arg_offsets = vec![0, 8, 16, 20, 24];

        let mut copy_middle = KernelDescriptor::new("builtin_copy_middle");
        copy_middle.payload_size = 32;
        copy_middle.arg_offsets = vec![0, 8, 16, 20, 24];

        let mut fill_pattern = KernelDescriptor::new("builtin_fill_pattern");
        fill_pattern.payload_size = 32;
        fill_pattern.arg_offsets = vec![0, 8, 16, 24];

        let mut copy_rect2d = KernelDescriptor::new("builtin_copy_rect2d");
        copy_rect2d.payload_size = 48;
        copy_rect2d.arg_offsets = vec![0, 8, 16, 24, 32, 36];

        let module = Module::new(
            allocator,
            vec![copy_side, copy_middle, fill_pattern, copy_rect2d],
        )?;
        Ok(Self {
            copy_side: Kernel::create(&module, "builtin_copy_side")?,
            copy_middle: Kernel::create(&module, "builtin_copy_middle")?,
            fill_pattern: Kernel::create(&module, "builtin_fill_pattern")?,
            copy_rect2d: Kernel::create(&module, "builtin_copy_rect2d")?,
            module,
            lock: Mutex::new(()),
        })
    }

    /// Exclusive ownership while a builtin is configured and appended.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SystemAllocator;

    fn module_with(desc: KernelDescriptor) -> Arc<Module> {
        Module::new(Arc::new(SystemAllocator::new()), vec![desc]).unwrap()
    }

    #[test]
    fn test_create_unknown_kernel() {
        let module = module_with(KernelDescriptor::new("k"));
        assert!(Kernel::create(&module, "missing").is_err());
    }

    #[test]
    fn test_arg_patching() {
        let mut desc = KernelDescriptor::new("k");
        desc.payload_size = 32;
        desc.arg_offsets = vec![0, 8, 16];
        let module = module_with(desc);
        let kernel = Kernel::create(&module, "k").unwrap();

        let buf = AllocationHandle {
            id: 99,
            gpu_addr: 0xAB00_0000,
            size: 0x1000,
            kind: quartz_common::AllocKind::DeviceLocal,
        };
        kernel.set_arg_buffer(0, buf, buf.gpu_addr).unwrap();
        kernel.set_arg_value(2, &42u32.to_le_bytes()).unwrap();

        let payload = kernel.payload_image();
        assert_eq!(&payload[0..8], &0xAB00_0000u64.to_le_bytes());
        assert_eq!(&payload[16..20], &42u32.to_le_bytes());

        // Bound buffer shows up in residency exactly once.
        kernel.set_arg_buffer(1, buf, buf.gpu_addr).unwrap();
        let residency = kernel.residency();
        assert_eq!(residency.iter().filter(|h| h.id == 99).count(), 1);
    }

    #[test]
    fn test_arg_out_of_range() {
        let module = module_with(KernelDescriptor::new("k"));
        let kernel = Kernel::create(&module, "k").unwrap();
        assert_eq!(
            kernel.set_arg_value(5, &[0u8; 4]),
            Err(Status::InvalidArgument)
        );
    }

    #[test]
    fn test_printf_kernel_owns_buffer_and_counts_drains() {
        let mut desc = KernelDescriptor::new("printer");
        desc.uses_printf = true;
        let module = module_with(desc);
        let kernel = Kernel::create(&module, "printer").unwrap();
        assert!(kernel.printf_buffer().is_some());
        assert_eq!(kernel.printf_output_count(), 0);
        kernel.print_output(false);
        kernel.print_output(true);
        assert_eq!(kernel.printf_output_count(), 2);
    }

    #[test]
    fn test_group_size_validation() {
        let module = module_with(KernelDescriptor::new("k"));
        let kernel = Kernel::create(&module, "k").unwrap();
        assert!(kernel.set_group_size(8, 1, 1).is_ok());
        assert_eq!(kernel.group_size(), [8, 1, 1]);
        assert_eq!(kernel.set_group_size(0, 1, 1), Err(Status::InvalidArgument));
    }

    #[test]
    fn test_suggest_group_size_divides() {
        let module = module_with(KernelDescriptor::new("k"));
        let kernel = Kernel::create(&module, "k").unwrap();
        let [x, y, z] = kernel.suggest_group_size(GroupCount::new(48, 6, 1));
        assert_eq!(48 % x, 0);
        assert_eq!(6 % y, 0);
        assert_eq!(z, 1);
        assert!(x <= 32);
    }

    #[test]
    fn test_builtin_library() {
        let lib = BuiltinLibrary::new(Arc::new(SystemAllocator::new())).unwrap();
        assert!(!lib.copy_side.uses_printf());
        assert_eq!(lib.copy_middle.descriptor().arg_offsets.len(), 5);
        let _guard = lib.acquire();
    }
}
