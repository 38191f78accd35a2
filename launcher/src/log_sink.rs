/// Re-emits output of subordinate processes through `tracing`.
///
/// libvirt daemons write lines like
/// `2024-05-01 10:00:00.123+0000: 4711: error : virNetSocketReadWire:1808 : End of file`.
/// Those are logged at their own level with the thread and source position
/// as fields. Anything else is logged verbatim at info.
use std::sync::Arc;

use tracing::{debug, error, info, warn};

/// Destination for one line of subordinate output.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LineLevel {
    fn parse(level: &str) -> Option<Self> {
        match level {
            "debug" => Some(LineLevel::Debug),
            "info" => Some(LineLevel::Info),
            "warning" => Some(LineLevel::Warning),
            "error" => Some(LineLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct LibvirtLine<'a> {
    pub timestamp: &'a str,
    pub thread: &'a str,
    pub level: LineLevel,
    pub position: &'a str,
    pub message: &'a str,
}

/// Splits a libvirt log line into its parts. Returns `None` when the line
/// does not follow the libvirt layout.
pub fn parse_libvirt_line(line: &str) -> Option<LibvirtLine<'_>> {
    let mut parts = line.splitn(5, ": ");
    let timestamp = parts.next()?.trim();
    let thread = parts.next()?.trim();
    let level = LineLevel::parse(parts.next()?.trim())?;
    let position = parts.next()?.trim();
    let message = parts.next()?.trim();

    if !thread.chars().all(|c| c.is_ascii_digit()) || thread.is_empty() {
        return None;
    }
    Some(LibvirtLine {
        timestamp,
        thread,
        level,
        position,
        message,
    })
}

fn emit(subcomponent: &str, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    let Some(parsed) = parse_libvirt_line(line) else {
        info!(subcomponent, "{line}");
        return;
    };
    let LibvirtLine {
        timestamp,
        thread,
        level,
        position,
        message,
    } = parsed;
    match level {
        LineLevel::Debug => debug!(subcomponent, thread, pos = position, timestamp, "{message}"),
        LineLevel::Info => info!(subcomponent, thread, pos = position, timestamp, "{message}"),
        LineLevel::Warning => warn!(subcomponent, thread, pos = position, timestamp, "{message}"),
        LineLevel::Error => error!(subcomponent, thread, pos = position, timestamp, "{message}"),
    }
}

/// Output of the hypervisor daemon.
pub fn libvirt_line(line: &str) {
    emit("libvirt", line);
}

/// Output of the virtlogd sidecar.
pub fn virtlogd_line(line: &str) {
    emit("virtlogd", line);
}

/// One line of the guest console log.
pub fn guest_console_line(line: &str) {
    let line = line.trim_end();
    if !line.is_empty() {
        info!(subcomponent = "qemu", "{line}");
    }
}
