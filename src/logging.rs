//! Logging capability threaded explicitly through construction.
//!
//! The original program kept `debug_level`/`debug_file` as process
//! globals and a family of `log_notice`/`log_error`/`log_debug` functions
//! that consulted them. Here that state is a value: a [`Logger`]
//! implementation handed to the tunnel and the bridge loop at
//! construction time, so nothing in the core reaches for a global.

use std::{
    fmt,
    fs::File,
    io::Write,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

/// Severity of a single log line, ordered least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Notice,
    Debug,
    Trace,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Notice => "notice",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// A sink for operator-facing log lines.
///
/// Implementations must be `Send + Sync` so the same logger can be shared
/// between the tunnel endpoint and the bridge loop without extra plumbing.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: fmt::Arguments<'_>);

    fn error(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Error, message);
    }
    fn notice(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Notice, message);
    }
    fn debug(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Debug, message);
    }
    fn trace(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Trace, message);
    }
}

/// Writes timestamped lines to stderr, or to a file when one is
/// configured, gated by a verbosity level — the direct replacement for
/// the original's `debug_level`/`debug_file` pair.
pub struct StderrLogger {
    level: Level,
    file: Option<Mutex<File>>,
}

impl StderrLogger {
    pub fn new(level: Level, file: Option<File>) -> Self {
        Self {
            level,
            file: file.map(Mutex::new),
        }
    }

    fn write_line(&self, level: Level, message: fmt::Arguments<'_>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let line = format!("[{now}] {:<6} {message}\n", level.as_str());

        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.write_all(line.as_bytes());
                return;
            }
        }
        let _ = std::io::stderr().write_all(line.as_bytes());
    }
}

impl Logger for StderrLogger {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        if level <= self.level {
            self.write_line(level, message);
        }
    }
}

/// Discards everything. Used by tests that don't want log noise.
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: fmt::Arguments<'_>) {}
}

/// Logs at `notice` severity through `$logger`, `format!`-style.
#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $($arg:tt)*) => {
        $logger.notice(format_args!($($arg)*))
    };
}

/// Logs at `error` severity through `$logger`, `format!`-style.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(format_args!($($arg)*))
    };
}

/// Logs at `debug` severity through `$logger`, `format!`-style.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLogger(AtomicUsize);

    impl Logger for CountingLogger {
        fn log(&self, _level: Level, _message: fmt::Arguments<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn macros_reach_the_logger() {
        let logger = CountingLogger(AtomicUsize::new(0));
        log_notice!(logger, "hello {}", 1);
        log_error!(logger, "oops");
        log_debug!(logger, "details");
        assert_eq!(logger.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn level_filters_out_quieter_messages() {
        let logger = StderrLogger::new(Level::Notice, None);
        // Just exercises the gating branch; nothing observable from here
        // without capturing stderr, but it must not panic.
        logger.trace(format_args!("should be filtered"));
        logger.notice(format_args!("should pass"));
    }
}
