//! Kernel logging: a buffered sink behind the `log` facade.
//!
//! The original kernel streamed its log lines out the serial port; the
//! machine model keeps the same shape with an in-memory serial buffer the
//! host can drain. Install once at boot (or test setup) with [`init`].

use alloc::string::String;
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

struct SerialLog {
    buf: Mutex<String>,
}

static LOGGER: SerialLog = SerialLog {
    buf: Mutex::new(String::new()),
};

impl Log for SerialLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut buf = self.buf.lock();
        let _ = writeln!(buf, "[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Safe to call more than once; later calls
/// only adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Drain everything logged so far. Used by tests and the host shell.
pub fn drain() -> String {
    core::mem::take(&mut *LOGGER.buf.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_reach_the_buffer() {
        init(LevelFilter::Debug);
        let _ = drain();
        log::info!(target: "klog-test", "hello from the kernel");
        let out = drain();
        assert!(out.contains("hello from the kernel"));
        assert!(out.contains("klog-test"));
    }
}
