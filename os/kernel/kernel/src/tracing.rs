//! # Kernel Tracing helpers

use kernel_info::boot::BootInfo;
use log::info;

/// Log what the boot trampolines handed over.
pub fn trace_boot_info(boot: &BootInfo) {
    info!(
        concat!(
            "Boot Info in Kernel:\n",
            "  CPUs     = {count} (APIC ids {ids:?})\n",
            "  frames   = {start}..{end} ({frames} pages)"
        ),
        count = boot.cpus().len(),
        ids = boot.cpus(),
        start = boot.frames.start,
        end = boot.frames.end,
        frames = boot.frames.frame_count(),
    );
}

#[cfg(feature = "qemu")]
static LOGGER: kernel_qemu::QemuLogger = kernel_qemu::QemuLogger::new(log::LevelFilter::Debug);

/// Route `log` records to the QEMU debug port. Call once, on the boot CPU.
///
/// # Errors
/// If a logger is already installed.
#[cfg(feature = "qemu")]
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    LOGGER.init()
}
