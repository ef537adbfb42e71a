//! 32-bit x86 backend.
//!
//! The interrupt descriptor table and the per-vector entry stubs live with
//! the boot code; the stubs call [`kernel_arch_interrupt`] with the vector
//! number and interrupts disabled.

use crate::{Arch, InterruptSink, IpiTarget};
use alloc::boxed::Box;
use alloc::vec;
use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::eflags::Eflags;
use kernel_registers::lapic::{
    DestinationShorthand, IcrHigh, IcrLow, LAPIC_EOI, LAPIC_ICR_HIGH, LAPIC_ICR_LOW, LAPIC_ID,
    LapicId,
};
use kernel_registers::{LoadRegister, LoadRegisterUnsafe, StoreRegisterUnsafe};

// Callee-saved registers are pushed onto the old stack, the stack pointer is
// stored through `from`, and the new stack is popped in reverse.
global_asm!(
    ".global kernel_arch_switch",
    "kernel_arch_switch:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    push ebp",
    "    push ebx",
    "    push esi",
    "    push edi",
    "    mov [eax], esp",
    "    mov esp, edx",
    "    pop edi",
    "    pop esi",
    "    pop ebx",
    "    pop ebp",
    "    ret",
    "",
    ".global kernel_arch_context_start",
    "kernel_arch_context_start:",
    "    push ebx",
    "    call {start}",
    "    ud2",
    start = sym context_start,
);

unsafe extern "C" {
    fn kernel_arch_switch(from: *mut usize, to: usize);
    fn kernel_arch_context_start();
}

type Entry = Box<dyn FnOnce() + Send>;

extern "C" fn context_start(entry: *mut Entry) -> ! {
    let entry = unsafe { Box::from_raw(entry) };
    entry();
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}

/// Saved stack pointer plus the stack it points into.
pub struct X86Context {
    stack: Option<Box<[u8]>>,
    esp: UnsafeCell<usize>,
}

// Only touched by the CPU that switches into or out of it, under the
// scheduler lock.
unsafe impl Send for X86Context {}
unsafe impl Sync for X86Context {}

impl X86Context {
    /// Whether this context owns a stack (i.e. is a thread, not a CPU's
    /// boot stack).
    #[must_use]
    pub const fn has_stack(&self) -> bool {
        self.stack.is_some()
    }
}

struct SinkSlot {
    ready: AtomicBool,
    sink: UnsafeCell<Option<&'static dyn InterruptSink>>,
}

unsafe impl Sync for SinkSlot {}

static SINK: SinkSlot = SinkSlot {
    ready: AtomicBool::new(false),
    sink: UnsafeCell::new(None),
};

/// Called by the interrupt entry stubs.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_arch_interrupt(vector: u32) {
    if !SINK.ready.load(Ordering::Acquire) {
        return;
    }
    if let Some(sink) = unsafe { *SINK.sink.get() } {
        sink.dispatch(vector as u8);
    }
}

/// The executing x86 processor, reached through its identity-mapped local
/// APIC window.
pub struct X86 {
    lapic: VirtualAddress,
}

impl X86 {
    #[must_use]
    pub const fn new(lapic: VirtualAddress) -> Self {
        Self { lapic }
    }

    fn lapic_read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.lapic.as_usize() + offset) as *const u32) }
    }

    fn lapic_write(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.lapic.as_usize() + offset) as *mut u32, value) }
    }
}

impl Arch for X86 {
    type Context = X86Context;

    fn interrupts_enabled(&self) -> bool {
        Eflags::load().if_interrupt_enable()
    }

    fn disable_interrupts(&self) {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }

    fn enable_interrupts(&self) {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    fn relax(&self) {
        core::hint::spin_loop();
    }

    fn wait_for_interrupt(&self) {
        unsafe { asm!("hlt", options(nomem, nostack)) }
    }

    fn local_apic_id(&self) -> u32 {
        u32::from(LapicId::from_bits(self.lapic_read(LAPIC_ID)).id())
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        let (destination, shorthand) = match target {
            IpiTarget::Apic(id) => (id as u8, DestinationShorthand::None),
            IpiTarget::AllExcludingSelf => (0, DestinationShorthand::AllExcludingSelf),
            IpiTarget::All => (0, DestinationShorthand::AllIncludingSelf),
        };
        // The low half triggers the send; the high half goes first.
        self.lapic_write(
            LAPIC_ICR_HIGH,
            IcrHigh::new().with_destination(destination).into_bits(),
        );
        self.lapic_write(LAPIC_ICR_LOW, IcrLow::fixed(vector, shorthand).into_bits());
    }

    fn wait_for_ipi_delivery(&self) {
        while IcrLow::from_bits(self.lapic_read(LAPIC_ICR_LOW)).delivery_pending() {
            core::hint::spin_loop();
        }
    }

    fn end_of_interrupt(&self) {
        self.lapic_write(LAPIC_EOI, 0);
    }

    fn active_page_directory(&self) -> PhysicalAddress {
        unsafe { Cr3::load_unsafe() }.directory()
    }

    fn load_page_directory(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    fn invalidate_page(&self, page: VirtualAddress) {
        unsafe {
            asm!("invlpg [{}]", in(reg) page.as_usize(), options(nostack, preserves_flags));
        }
    }

    fn flush_tlb(&self) {
        unsafe { Cr3::load_unsafe().store_unsafe() }
    }

    fn new_context(&self, entry: Entry) -> X86Context {
        let mut stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let entry = Box::into_raw(Box::new(entry));
        let top = stack.as_mut_ptr_range().end as usize & !0xF;

        // Popped by `kernel_arch_switch`: edi, esi, ebx, ebp, return address.
        let frame: [usize; 5] = [
            0,
            0,
            entry as usize,
            0,
            kernel_arch_context_start as usize,
        ];
        let esp = top - core::mem::size_of_val(&frame);
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), esp as *mut usize, frame.len());
        }

        X86Context {
            stack: Some(stack),
            esp: UnsafeCell::new(esp),
        }
    }

    fn bootstrap_context(&self) -> X86Context {
        X86Context {
            stack: None,
            esp: UnsafeCell::new(0),
        }
    }

    unsafe fn switch_context(&self, from: &X86Context, to: &X86Context) {
        unsafe { kernel_arch_switch(from.esp.get(), *to.esp.get()) }
    }

    fn halt(&self, reason: fmt::Arguments<'_>) -> ! {
        log::error!("cpu halted: {reason}");
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
        }
    }

    fn attach_interrupt_sink(&self, sink: &'static dyn InterruptSink) {
        if SINK.ready.load(Ordering::Acquire) {
            return;
        }
        unsafe { *SINK.sink.get() = Some(sink) };
        SINK.ready.store(true, Ordering::Release);
    }
}
