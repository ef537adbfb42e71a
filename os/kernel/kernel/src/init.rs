//! Bring-up of the kernel core.
//!
//! The boot CPU builds the [`Kernel`] (which enumerates the CPUs, sets up the
//! page allocator, builds and activates the kernel page tables and creates
//! the kernel process), installs interrupt handlers and seals the table with
//! [`Kernel::mark_initialized`]. Every CPU, the boot CPU included, then calls
//! [`Kernel::start_cpu`] and [`Kernel::run_scheduler`].

use crate::interrupts::ISR_VECTORS;
use crate::process::ProcTable;
use crate::{Kernel, tracing, vmem};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_alloc::{AllocError, FreeListFrameAlloc};
use kernel_arch::Arch;
use kernel_info::boot::BootInfo;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{Checkpoint, Cpus, IrqGuard, SpinLock, fatal};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PageTable, PhysMapper, VmMap};

/// Why the kernel core could not be brought up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("page allocator: {0}")]
    Frames(#[from] AllocError),
    #[error("kernel page tables: {0}")]
    Paging(#[from] MapError),
}

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> Kernel<A, M> {
    /// Bring up the kernel core on the boot CPU.
    ///
    /// Enumerates the CPUs listed in `boot`, hands its frame range to the
    /// page allocator (reached through `mapper`), maps every static region
    /// of `vm_map` into a fresh kernel page directory and loads it on the
    /// calling CPU.
    ///
    /// # Errors
    /// If the frame range is unusable or too small for the kernel page
    /// tables.
    pub fn new(arch: A, boot: &BootInfo, mapper: M, vm_map: VmMap) -> Result<Self, BootError> {
        tracing::trace_boot_info(boot);

        let cpus = Arc::new(Cpus::new(arch));
        cpus.enumerate(boot.cpus());
        let frames = FreeListFrameAlloc::new(Arc::clone(&cpus), mapper, boot.frames)?;

        let kernel_pd = build_kernel_directory(&frames, &vm_map)?;
        cpus.arch().load_page_directory(kernel_pd);
        log::info!(
            "kernel page directory at {kernel_pd}, {} frames left",
            frames.free_frames()
        );

        Ok(Self {
            cpus,
            frames,
            vm_map,
            kernel_pd,
            kpt_lock: SpinLock::new("kernel page tables", ()),
            shootdown: vmem::Shootdown::new(),
            isrs: SpinLock::new("isrs", [None; ISR_VECTORS]),
            initialized: AtomicBool::new(false),
            procs: SpinLock::new("procs", ProcTable::new(kernel_pd)),
            startup: Checkpoint::new(),
            ticks: AtomicU64::new(0),
        })
    }

    /// Seal the interrupt table and start routing interrupts to this kernel.
    pub fn mark_initialized(&'static self) {
        self.arch().attach_interrupt_sink(self);
        self.initialized.store(true, Ordering::Release);
        log::info!("kernel core initialized");
    }

    /// Put the calling CPU into service: activate the kernel page tables,
    /// mark the CPU active and wait at the startup checkpoint for the other
    /// active CPUs.
    #[track_caller]
    pub fn start_cpu(&self) {
        if !self.is_initialized() {
            fatal!(self.cpus, "start_cpu before the kernel is initialized");
        }
        {
            let _irq = IrqGuard::new(&self.cpus);
            let cpu = self.cpus.current();
            self.arch().load_page_directory(self.kernel_pd);
            self.cpus.activate(cpu);
        }
        self.startup.enter(&self.cpus);
    }
}

/// A zeroed directory with every static region mapped.
fn build_kernel_directory<A: Arch, M: PhysMapper>(
    frames: &FreeListFrameAlloc<A, M>,
    vm_map: &VmMap,
) -> Result<PhysicalAddress, MapError> {
    let directory = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
    unsafe { frames.mapper().phys_to_mut::<PageTable>(directory) }.zero();

    let space = AddressSpace::new(frames.mapper(), directory);
    for region in vm_map.regions().iter().filter(|r| r.is_static) {
        for offset in (0..region.size).step_by(4096) {
            space.map_one(frames, region.virt + offset, region.phys + offset, region.flags)?;
        }
        log::debug!(
            "mapped {} {}..{} -> {}",
            region.name,
            region.virt,
            region.virt + region.size,
            region.phys
        );
    }
    Ok(directory)
}
