//! Colored stderr logger for the shell binary.
//!
//! Engine modules log through the `log` facade; user-visible command output
//! goes to stdout via the dispatcher and never through here.

use log::{Level, LevelFilter, Log, Metadata, Record};
use owo_colors::OwoColorize;

struct ShellLogger;

static LOGGER: ShellLogger = ShellLogger;

impl Log for ShellLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => eprintln!("{} {}", "error:".bright_red(), record.args()),
            Level::Warn => eprintln!("{} {}", "warn:".bright_yellow(), record.args()),
            Level::Info => eprintln!("{} {}", "info:".bright_green(), record.args()),
            Level::Debug | Level::Trace => eprintln!("{} {}", "debug:".dimmed(), record.args()),
        }
    }

    fn flush(&self) {}
}

/// Install the logger once; repeated calls are harmless.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
