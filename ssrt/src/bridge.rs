//! The address-to-line bridge.
//!
//! Translates a `(module, offset)` pair into `file:line` text by invoking the external
//! `addr2line` tool, one address per invocation. The bridge must never introduce a failure mode
//! into trace formatting: every error leaves the destination untouched.

use std::{
    path::Path,
    process::{Command, Stdio},
};

/// The reply addr2line gives for addresses it has no debug information for.
const NO_INFO: &str = "??:0";

/// Append ` (<file>:<line>)` to `dst` for the code at `off` within the object at `path`, if the
/// resolver can name it.
pub(crate) fn addr2line(dst: &mut String, path: &Path, off: u64) {
    if let Some(line) = query(path, off) {
        append_location(dst, &line);
    }
}

/// Run `addr2line -se <path> 0x<off>` and read the first line of its reply.
fn query(path: &Path, off: u64) -> Option<String> {
    let out = Command::new("addr2line")
        .arg("-se")
        .arg(path)
        .arg(format!("0x{off:x}"))
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    let line = stdout.split('\n').next().unwrap_or("").trim_end_matches('\r');
    Some(line.to_owned())
}

/// Append the location unless the resolver had nothing to say.
fn append_location(dst: &mut String, line: &str) {
    if !line.is_empty() && line != NO_INFO {
        dst.push_str(&format!(" ({line})"));
    }
}
