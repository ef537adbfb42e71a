//! # Paging subsystem
//!
//! Page-table edits for process directories ([`Kernel::map`],
//! [`Kernel::get`], [`Kernel::unmap`]) and for the shared kernel page tables
//! ([`Kernel::kp_map`], [`Kernel::kp_unmap`]).
//!
//! A kernel page-table edit runs as one transaction:
//!
//! 1. take the kernel page-table lock,
//! 2. switch this CPU to the kernel directory,
//! 3. edit,
//! 4. propagate the change to every other active CPU,
//! 5. switch back,
//! 6. unlock.
//!
//! ## Propagation
//!
//! Under the IPI lock the sender records which directory and page changed
//! and whether the mapping is global, then, one CPU at a time, sends the
//! shootdown IPI, waits for the local APIC to deliver it and spins until the
//! receiver acknowledges. A `kp_map` therefore only returns once no CPU can
//! still see the old translation.
//!
//! Every entry point insists on running with the kernel directory active
//! and without the frame allocator's lock, which the allocation of a page
//! table would otherwise try to take a second time.

use crate::Kernel;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_arch::{Arch, IpiTarget, TLB_SHOOTDOWN_VECTOR};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{SpinLock, fatal};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, MapOutcome, PageFlags, PageTable, PhysMapper, info,
};

/// `page` value of a request that flushes the whole TLB. Never page aligned.
const NO_PAGE: u32 = u32::MAX;

/// The change being propagated, shared with the receivers' interrupt
/// handlers.
pub(crate) struct Shootdown {
    lock: SpinLock<()>,
    directory: AtomicU32,
    page: AtomicU32,
    global: AtomicBool,
    ack: AtomicBool,
}

impl Shootdown {
    pub(crate) const fn new() -> Self {
        Self {
            lock: SpinLock::new("ipi", ()),
            directory: AtomicU32::new(0),
            page: AtomicU32::new(NO_PAGE),
            global: AtomicBool::new(false),
            ack: AtomicBool::new(false),
        }
    }
}

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> Kernel<A, M> {
    /// Physical address of the kernel page directory.
    #[must_use]
    pub const fn kernel_directory(&self) -> PhysicalAddress {
        self.kernel_pd
    }

    fn space(&self, directory: PhysicalAddress) -> AddressSpace<'_, M> {
        AddressSpace::new(self.frames.mapper(), directory)
    }

    #[track_caller]
    fn check_frame_lock(&self, what: &str) {
        if self.frames.lock_held() {
            fatal!(self.cpus, "{what} while holding the frame allocator lock");
        }
    }

    #[track_caller]
    fn check_paging_context(&self, what: &str) {
        self.check_frame_lock(what);
        let active = self.arch().active_page_directory();
        if active != self.kernel_pd {
            fatal!(
                self.cpus,
                "{what} with directory {active} active instead of the kernel page tables"
            );
        }
    }

    #[track_caller]
    fn check_kernel_half(&self, va: VirtualAddress, what: &str) {
        if va.as_u32() < info::KERNEL_BASE {
            fatal!(self.cpus, "{what} of {va}, which is below the kernel base");
        }
    }

    #[track_caller]
    fn map_outcome(
        &self,
        directory: PhysicalAddress,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<MapOutcome, MapError> {
        self.check_paging_context("map");
        let outcome = self.space(directory).map_one(&self.frames, va, pa, flags);
        if let Err(err) = outcome {
            log::warn!("map {va} -> {pa} in {directory} failed: {err}");
        }
        outcome
    }

    /// Map the page at `va` to `pa` in `directory`. An existing mapping is
    /// overwritten. A missing page table is allocated and zeroed first.
    ///
    /// # Errors
    /// If an address is misaligned, `va` lies in a 4 MiB page, or no frame
    /// is left for a page table.
    #[track_caller]
    pub fn map(
        &self,
        directory: PhysicalAddress,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.map_outcome(directory, va, pa, flags).map(|_| ())
    }

    /// The physical address `va` translates to in `directory`.
    #[track_caller]
    pub fn get(&self, directory: PhysicalAddress, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.check_paging_context("get");
        self.space(directory).query(va)
    }

    /// Remove the mapping of the page at `va` from `directory`. Returns the
    /// frame it pointed to.
    #[track_caller]
    pub fn unmap(&self, directory: PhysicalAddress, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.check_paging_context("unmap");
        self.space(directory).unmap_one(va)
    }

    /// Map a page of the kernel half and make every active CPU see it before
    /// returning.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    #[track_caller]
    pub fn kp_map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.check_kernel_half(va, "kp_map");
        self.check_frame_lock("kp_map");

        let _kpt = self.kpt_lock.lock(&self.cpus);
        let previous = self.enter_kernel_directory();
        let outcome = self.map_outcome(self.kernel_pd, va, pa, flags);
        if let Ok(outcome) = outcome {
            // A fresh page table leaves no single page to point at.
            let page = (!outcome.new_table).then_some(va);
            self.propagate(self.kernel_pd, page, flags.global());
        }
        self.leave_kernel_directory(previous);
        outcome.map(|_| ())
    }

    /// Remove a page of the kernel half from every active CPU's view.
    /// Returns the frame it pointed to.
    #[track_caller]
    pub fn kp_unmap(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.check_kernel_half(va, "kp_unmap");
        self.check_frame_lock("kp_unmap");

        let _kpt = self.kpt_lock.lock(&self.cpus);
        let previous = self.enter_kernel_directory();
        self.check_paging_context("kp_unmap");
        let space = self.space(self.kernel_pd);
        let global = space.leaf(va).is_some_and(|leaf| leaf.global());
        let frame = space.unmap_one(va);
        if frame.is_some() {
            self.propagate(self.kernel_pd, Some(va.align_down::<Size4K>()), global);
        }
        self.leave_kernel_directory(previous);
        frame
    }

    /// A new process directory: empty user half, kernel half shared with
    /// the kernel directory.
    ///
    /// Kernel page tables created later are only linked into the kernel
    /// directory.
    ///
    /// # Errors
    /// If no frame is left for the directory.
    #[track_caller]
    pub fn create_directory(&self) -> Result<PhysicalAddress, MapError> {
        self.check_paging_context("create_directory");
        let directory = self.frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
        unsafe { self.frames.mapper().phys_to_mut::<PageTable>(directory) }.zero();

        let _kpt = self.kpt_lock.lock(&self.cpus);
        self.space(directory)
            .copy_kernel_entries(&self.space(self.kernel_pd));
        log::debug!("created page directory {directory}");
        Ok(directory)
    }

    /// Free a process directory and its user page tables. The frames they
    /// mapped are left alone.
    #[track_caller]
    pub fn destroy_directory(&self, directory: PhysicalAddress) {
        if directory == self.kernel_pd {
            fatal!(self.cpus, "attempt to destroy the kernel page directory");
        }
        self.check_paging_context("destroy_directory");
        let tables = self.space(directory).free_user_tables(&self.frames);
        self.frames.free_4k(directory);
        log::debug!("destroyed page directory {directory} and {tables} page tables");
    }

    fn enter_kernel_directory(&self) -> PhysicalAddress {
        let previous = self.arch().active_page_directory();
        if previous != self.kernel_pd {
            self.arch().load_page_directory(self.kernel_pd);
        }
        previous
    }

    fn leave_kernel_directory(&self, previous: PhysicalAddress) {
        if previous != self.kernel_pd {
            self.arch().load_page_directory(previous);
        }
    }

    /// Apply a change locally, then on every other active CPU, one at a time.
    fn propagate(&self, directory: PhysicalAddress, page: Option<VirtualAddress>, global: bool) {
        let shootdown = &self.shootdown;
        let _ipi = shootdown.lock.lock(&self.cpus);
        shootdown
            .directory
            .store(directory.as_u32(), Ordering::Release);
        shootdown
            .page
            .store(page.map_or(NO_PAGE, VirtualAddress::as_u32), Ordering::Release);
        shootdown.global.store(global, Ordering::Release);

        self.apply_shootdown();
        let me = self.cpus.current().index();
        for cpu in self
            .cpus
            .iter()
            .filter(|cpu| cpu.is_active() && cpu.index() != me)
        {
            shootdown.ack.store(false, Ordering::SeqCst);
            self.arch()
                .send_ipi(IpiTarget::Apic(cpu.apic_id()), TLB_SHOOTDOWN_VECTOR);
            self.arch().wait_for_ipi_delivery();
            while !shootdown.ack.load(Ordering::Acquire) {
                self.arch().relax();
            }
            log::trace!("cpu{} acknowledged shootdown of {directory}", cpu.index());
        }
    }

    /// Bring this CPU's TLB in line with the recorded change.
    fn apply_shootdown(&self) {
        let shootdown = &self.shootdown;
        let arch = self.arch();
        let directory = PhysicalAddress::new(shootdown.directory.load(Ordering::Acquire));
        let page = match shootdown.page.load(Ordering::Acquire) {
            NO_PAGE => None,
            page => Some(VirtualAddress::new(page)),
        };
        let global = shootdown.global.load(Ordering::Acquire);
        let active = arch.active_page_directory();

        if directory == self.kernel_pd && active != self.kernel_pd {
            if global {
                // Pass through the kernel directory so the global entry is
                // reloaded without giving up the current one.
                arch.load_page_directory(self.kernel_pd);
                arch.load_page_directory(active);
            }
            // The kernel half is shared, and a directory load keeps global
            // entries: only invlpg drops a stale one.
            if let Some(page) = page {
                arch.invalidate_page(page);
            }
        } else if active == directory {
            match page {
                Some(page) => arch.invalidate_page(page),
                None => arch.flush_tlb(),
            }
        }
    }
}

/// Receiver side of a TLB shootdown.
pub(crate) fn shootdown_handler<A: Arch, M: PhysMapper + Send + Sync + 'static>(
    kernel: &Kernel<A, M>,
    _vector: u8,
) {
    kernel.apply_shootdown();
    kernel.shootdown.ack.store(true, Ordering::Release);
}
