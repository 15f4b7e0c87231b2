//! The implementation of the `SSRT_LOG` environment variable.
//!
//! `SSRT_LOG=<level>[:<path>]` selects a numeric verbosity and an optional append-mode log
//! file; absent path (or `-`) means stderr. Diagnostics never reach the instrumented program's
//! own output paths.

use parking_lot::Mutex;
use std::{env, fs::File, io::Write, sync::LazyLock};
use strum::FromRepr;

/// How verbose the runtime's diagnostics are.
#[repr(u8)]
#[derive(Copy, Clone, Debug, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log module loading and lifecycle events.
    Info,
}

static CONFIG: LazyLock<(Verbosity, Option<String>)> = LazyLock::new(|| match env::var("SSRT_LOG")
{
    Ok(x) => {
        let (level, path) = match x.split_once(':') {
            Some((l, p)) => (l.to_string(), Some(p.to_string())),
            None => (x, None),
        };
        let level = level
            .parse::<u8>()
            .ok()
            .and_then(Verbosity::from_repr)
            .unwrap_or(Verbosity::Error);
        (level, path.filter(|p| p != "-"))
    }
    Err(_) => (Verbosity::Error, None),
});

// Serialises sink writes. Always the innermost lock.
static SINK: Mutex<()> = Mutex::new(());

fn log(level: Verbosity, tag: &str, msg: &str) {
    if CONFIG.0 < level {
        return;
    }
    let pid = std::process::id();
    let tid = unsafe { libc::pthread_self() } as u64;
    let line = format!("{tag} [{pid}, 0x{tid:x}] {msg}");

    let _sink = SINK.lock();
    match CONFIG.1.as_deref() {
        Some(path) => {
            File::options()
                .create(true)
                .append(true)
                .open(path)
                .map(|mut f| writeln!(f, "{line}"))
                .ok();
        }
        None => eprintln!("{line}"),
    }
}

pub(crate) fn error(msg: &str) {
    log(Verbosity::Error, "e", msg);
}

pub(crate) fn warn(msg: &str) {
    log(Verbosity::Warning, "w", msg);
}

pub(crate) fn info(msg: &str) {
    log(Verbosity::Info, "i", msg);
}
