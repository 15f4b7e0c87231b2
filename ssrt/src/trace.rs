//! Rendering of simulated call stacks to text.

use crate::{
    bridge,
    process::{self, Process},
    thread::ThreadId,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// A trace resolved under the runtime lock, ready to be textualised without it.
///
/// Names are resolved (and memoised on the frames) during [render]; the addr2line queries, which
/// may block on an external process, happen in [Rendered::write] with no lock held. The snapshot
/// also makes the trace immune to concurrent shadow-stack mutation once rendering is done.
pub(crate) struct Rendered {
    header: String,
    lines: Vec<Line>,
}

struct Line {
    text: String,
    /// The addr2line query for this frame: the caller's defining module and the call site's
    /// offset within it.
    loc: Option<(PathBuf, u64)>,
}

/// Resolve a thread's frames against the registry, deepest frame first. Returns `None` for
/// unknown threads.
pub(crate) fn render(proc: &mut Process, id: ThreadId, print_unresolved: bool) -> Option<Rendered> {
    let (modules, thread) = proc.modules_and_thread_mut(id);
    let thread = thread?;

    let header = format!(
        "at '{}' thread (0x{:x}) {{\r\n",
        thread.name().unwrap_or("anonymous"),
        thread.handle()
    );

    let frames = thread.frames_mut();
    let mut lines = Vec::with_capacity(frames.len());
    for i in (0..frames.len()).rev() {
        if frames[i].name().is_none() {
            if let Some(nm) = process::lookup_in(modules, frames[i].addr()) {
                let nm = nm.to_owned();
                frames[i].set_name(nm);
            }
        }

        let text = match frames[i].name() {
            Some(nm) => format!("  at {nm}"),
            None if print_unresolved => "  at UNRESOLVED".to_owned(),
            None => continue,
        };

        // The file:line of the call site belongs to the module defining the caller, one level
        // shallower. The bottom frame has no caller and gets no location.
        let loc = if i > 0 {
            process::inverse_lookup_in(modules, frames[i - 1].addr())
                .map(|(path, base)| (path.to_owned(), frames[i].site().wrapping_sub(base)))
        } else {
            None
        };

        lines.push(Line { text, loc });
    }

    Some(Rendered { header, lines })
}

impl Rendered {
    /// Append the trace text to `dst`, consulting the addr2line bridge per frame.
    pub(crate) fn write(&self, dst: &mut String) {
        dst.push_str(&self.header);
        for line in &self.lines {
            dst.push_str(&line.text);
            if let Some((path, off)) = &line.loc {
                bridge::addr2line(dst, path, *off);
            }
            dst.push_str("\r\n");
        }
        dst.push_str("}\r\n");
    }
}

/// Append the preamble that identifies this process to downstream sinks: executable path, pid,
/// thread id and a microsecond timestamp, all CRLF-terminated and (apart from the path) in hex.
pub fn header(dst: &mut String) {
    let path = ssaddr::obj::self_exe_path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let tstamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);

    dst.push_str(&format!("path: {path}\r\n"));
    dst.push_str(&format!("pid: {:x}\r\n", std::process::id()));
    dst.push_str(&format!(
        "tid: {:x}\r\n",
        unsafe { libc::pthread_self() } as u64
    ));
    dst.push_str(&format!("tstamp: {tstamp:x}\r\n"));
}

#[cfg(test)]
mod tests {
    use super::header;
    use crate::tracer::Tracer;
    use ssaddr::sym::{Sym, SymTab};

    fn current_id() -> u64 {
        unsafe { libc::pthread_self() } as u64
    }

    /// A tracer over one synthetic module defining A, B and C.
    fn test_tracer() -> Tracer {
        let mut t = Tracer::new();
        t.proc_mut().register_table(SymTab::new(
            "/nowhere/target-bin",
            0,
            vec![
                Sym::new(0x1000, Some("A".into())),
                Sym::new(0x1100, Some("B".into())),
                Sym::new(0x1200, Some("C".into())),
            ],
        ));
        t
    }

    #[test]
    fn current_thread_trace_and_reset() {
        let mut t = test_tracer();
        t.enter(0x1000, 0x2000); // A, called from outside instrumented code
        t.enter(0x1100, 0x1040); // B, called from inside A
        t.enter(0x1200, 0x1140); // C, called from inside B

        let mut out = String::new();
        assert!(t.trace_current(&mut out));

        let expected = format!(
            "at 'anonymous' thread (0x{:x}) {{\r\n  at C\r\n  at B\r\n  at A\r\n}}\r\n",
            current_id()
        );
        assert_eq!(out, expected);

        // The current-thread variant discards the simulated stack after the trace.
        assert_eq!(t.proc_mut().current_thread().depth(), 0);
    }

    #[test]
    fn indexed_trace_leaves_stack_intact() {
        let mut t = test_tracer();
        t.enter(0x1000, 0x2000);
        t.enter(0x1100, 0x1040);
        t.proc_mut().current_thread().set_name(Some("main"));

        let mut out = String::new();
        assert!(t.trace_thread(current_id(), &mut out));
        assert!(out.starts_with(&format!("at 'main' thread (0x{:x}) {{\r\n", current_id())));
        assert!(out.contains("  at B\r\n"));
        assert!(out.ends_with("}\r\n"));
        assert_eq!(t.proc_mut().current_thread().depth(), 2);
    }

    #[test]
    fn unknown_thread_produces_nothing() {
        let mut t = test_tracer();
        let mut out = String::new();
        assert!(!t.trace_thread(0xdead_0001, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn unresolved_frames_follow_policy() {
        let mut t = test_tracer();
        t.set_print_unresolved(true);
        t.enter(0x1000, 0x2000);
        t.enter(0x9999, 0x1040); // not in any table

        let mut out = String::new();
        assert!(t.trace_thread(current_id(), &mut out));
        assert!(out.contains("  at UNRESOLVED\r\n"));

        t.set_print_unresolved(false);
        let mut out = String::new();
        assert!(t.trace_thread(current_id(), &mut out));
        assert!(!out.contains("UNRESOLVED"));
        assert!(out.contains("  at A\r\n"));
    }

    #[test]
    fn resolved_names_are_cached_on_frames() {
        let mut t = test_tracer();
        t.enter(0x1200, 0x2000);
        let mut out = String::new();
        assert!(t.trace_thread(current_id(), &mut out));
        let id = current_id();
        let thr = t.proc_mut().thread_by_id_mut(id).unwrap();
        assert_eq!(thr.frame(0).unwrap().name(), Some("C"));
    }

    #[test]
    fn dump_covers_every_thread() {
        let mut t = test_tracer();
        t.enter(0x1000, 0x2000);
        t.proc_mut()
            .register_thread(crate::thread::Thread::with_id(0xbeef, Some("worker")))
            .unwrap();

        let mut out = String::new();
        t.dump(&mut out);
        assert!(out.contains("at 'anonymous' thread"));
        assert!(out.contains("at 'worker' thread (0xbeef) {\r\n"));
    }

    #[test]
    fn header_block() {
        let mut out = String::new();
        header(&mut out);
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert!(lines[0].starts_with("path: /"));
        assert!(lines[1].starts_with("pid: "));
        assert!(lines[2].starts_with("tid: "));
        assert!(lines[3].starts_with("tstamp: "));
        let pid = u32::from_str_radix(lines[1].trim_start_matches("pid: "), 16).unwrap();
        assert_eq!(pid, std::process::id());
    }
}
