use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install this logger as the global `log` sink. Call once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Format one record as `"[LEVEL] target: message\n"`.
///
/// # Errors
/// Propagates errors of the underlying writer.
pub fn write_record<W: fmt::Write>(w: &mut W, record: &Record) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::qemu_fmt::qemu_log(record);
    }

    fn flush(&self) {
        // no-op for qemu debug port
    }
}
