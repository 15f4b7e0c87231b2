//! End-to-end checks of the trace engine through its public API: synthetic modules, several
//! thread records, filter gating and unwind handling, without touching the process-wide
//! singleton.

use ssrt::{FilterMode, Thread, Tracer, UnwindScope};
use ssaddr::sym::{Sym, SymTab};

fn current_id() -> u64 {
    (unsafe { libc::pthread_self() }) as u64
}

fn table(path: &str, base: u64, syms: &[(u64, &str)]) -> SymTab {
    SymTab::new(
        path,
        base,
        syms.iter()
            .map(|(a, n)| Sym::new(*a, Some((*n).to_string())))
            .collect(),
    )
}

fn app_tracer() -> Tracer {
    let mut t = Tracer::new();
    t.proc_mut().register_table(table(
        "/opt/app/bin/server",
        0,
        &[
            (0x1000, "main"),
            (0x1400, "server::accept_loop()"),
            (0x1800, "server::handle(int)"),
        ],
    ));
    t.proc_mut().register_table(table(
        "/opt/app/lib/libproto.so",
        0x7f00_0000,
        &[
            (0x7f00_2000, "proto::decode(buf const&)"),
            (0x7f00_2400, "proto::checksum(buf const&)"),
        ],
    ));
    t
}

#[test]
fn cross_module_stack_renders_deepest_first() {
    let mut t = app_tracer();
    t.enter(0x1000, 0xdead);
    t.enter(0x1400, 0x1040);
    t.enter(0x7f00_2000, 0x1440); // into the DSO
    t.enter(0x7f00_2400, 0x7f00_2040);

    let mut out = String::new();
    assert!(t.trace_thread(current_id(), &mut out));

    let at_lines: Vec<&str> = out
        .split("\r\n")
        .filter(|l| l.starts_with("  at "))
        .collect();
    assert_eq!(
        at_lines,
        vec![
            "  at proto::checksum(buf const&)",
            "  at proto::decode(buf const&)",
            "  at server::accept_loop()",
            "  at main",
        ]
    );

    // Addresses resolve through the right module.
    assert_eq!(t.proc().lookup(0x7f00_2000), Some("proto::decode(buf const&)"));
    assert_eq!(
        t.proc().inverse_lookup(0x7f00_2400).map(|(p, b)| (p.to_path_buf(), b)),
        Some(("/opt/app/lib/libproto.so".into(), 0x7f00_0000))
    );
}

#[test]
fn unwound_frames_survive_until_collapse() {
    let mut t = app_tracer();
    t.enter(0x1000, 0xdead);
    t.enter(0x1400, 0x1040);
    t.enter(0x1800, 0x1440);

    {
        let _uw = UnwindScope::new();
        // The unwinder tears down the two deepest frames.
        t.exit(0x1800, 0x1440);
        t.exit(0x1400, 0x1040);
    }

    // The fault-time stack is still fully visible.
    let mut out = String::new();
    assert!(t.trace_thread(current_id(), &mut out));
    assert!(out.contains("  at server::handle(int)"));
    assert!(out.contains("  at main"));

    let id = current_id();
    let thr = t.proc_mut().thread_by_id_mut(id).unwrap();
    assert_eq!(thr.lag(), 2);
    thr.unwind();
    assert_eq!(thr.lag(), 0);
    assert_eq!(thr.depth(), 1);
}

#[test]
fn filters_suppress_recording_end_to_end() {
    let mut t = app_tracer();
    t.add_filter("^proto::", false, FilterMode::Symbol).unwrap();

    t.enter(0x1000, 0xdead);
    t.enter(0x7f00_2000, 0x1040); // gated
    t.enter(0x1400, 0x1044);
    t.exit(0x7f00_2400, 0x0); // gated, does not unbalance
    assert_eq!(t.proc_mut().current_thread().depth(), 2);

    let mut out = String::new();
    assert!(t.trace_thread(current_id(), &mut out));
    assert!(!out.contains("proto::"));
}

#[test]
fn dump_renders_every_registered_thread() {
    let mut t = app_tracer();
    t.enter(0x1000, 0xdead);

    t.proc_mut()
        .register_thread(Thread::with_id(0x1001, Some("worker-1")))
        .unwrap();
    t.proc_mut()
        .register_thread(Thread::with_id(0x1002, Some("worker-2")))
        .unwrap();
    t.proc_mut()
        .thread_by_id_mut(0x1001)
        .unwrap()
        .on_enter(0x1800, 0x1440);

    let mut out = String::new();
    t.dump(&mut out);

    assert!(out.contains("at 'anonymous' thread"));
    assert!(out.contains("at 'worker-1' thread (0x1001) {\r\n"));
    assert!(out.contains("at 'worker-2' thread (0x1002) {\r\n"));
    assert!(out.contains("  at server::handle(int)"));
    // Three blocks, blank-line separated.
    assert_eq!(out.matches("}\r\n").count(), 3);
}

#[test]
fn zombie_sweep_after_simulated_run() {
    let mut t = app_tracer();

    t.proc_mut()
        .register_thread(Thread::with_id(0x2001, Some("done")))
        .unwrap();
    {
        let thr = t.proc_mut().thread_by_id_mut(0x2001).unwrap();
        thr.on_enter(0x1000, 0x1);
        thr.on_exit();
    }
    t.proc_mut()
        .register_thread(Thread::with_id(0x2002, Some("idle")))
        .unwrap();

    t.proc_mut().cleanup_zombies();
    assert!(t.proc().thread_by_id(0x2001).is_none());
    assert!(t.proc().thread_by_id(0x2002).is_some());
}
