//! Log sink selection.
//!
//! Foreground runs log to stderr; daemonized runs log to syslog with the
//! `LOG_DAEMON` facility. Verbosity follows the `-d` count and can be
//! overridden with `RUST_LOG`.

use std::ffi::{c_int, CStr, CString};
use std::io;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const SYSLOG_IDENT: &CStr = c"schedwatch";

/// Where diagnostics go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    /// Standard error, with timestamps.
    Stderr,
    /// The system log.
    Syslog,
}

/// Map the `-d` count to a level name.
#[must_use]
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize logging for the chosen sink.
pub fn init_logging(verbosity: u8, sink: LogSink) {
    let level = level_for_verbosity(verbosity);
    let filter = format!(
        "schedwatch={level},schedwatch_probe={level},schedwatch_common={level}"
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));

    match sink {
        LogSink::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .with_target(false)
                .init();
        }
        LogSink::Syslog => {
            open_syslog();
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(SyslogMakeWriter)
                .with_ansi(false)
                .without_time()
                .with_level(false)
                .with_target(false)
                .init();
        }
    }
}

#[allow(unsafe_code)]
fn open_syslog() {
    // SAFETY: ident is a 'static NUL-terminated string
    unsafe { libc::openlog(SYSLOG_IDENT.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
}

/// Close the system log connection.
#[allow(unsafe_code)]
pub fn close_syslog() {
    // SAFETY: closelog is always safe to call
    unsafe { libc::closelog() };
}

/// Syslog priority for a tracing level. Debug and trace are clamped to
/// `LOG_INFO` so they are not dropped by default syslog configurations.
#[must_use]
pub fn syslog_priority(level: Level) -> c_int {
    if level == Level::ERROR {
        libc::LOG_ERR
    } else if level == Level::WARN {
        libc::LOG_WARNING
    } else {
        libc::LOG_INFO
    }
}

/// Produces one [`SyslogWriter`] per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyslogMakeWriter;

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(syslog_priority(*meta.level()))
    }
}

/// Buffers one formatted event and hands it to `syslog(3)` on drop.
#[derive(Debug)]
pub struct SyslogWriter {
    priority: c_int,
    buf: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(256),
        }
    }

    fn message(&self) -> Option<CString> {
        let mut line: Vec<u8> = self.buf.iter().copied().filter(|&b| b != 0).collect();
        while line.last().is_some_and(|&b| b == b'\n') {
            line.pop();
        }
        if line.is_empty() {
            return None;
        }
        CString::new(line).ok()
    }
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            // SAFETY: both format and message are NUL-terminated
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}
