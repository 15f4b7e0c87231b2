//! Simulates a short instrumented run against a synthetic symbol table and prints the
//! resulting traces.
//!
//! Run with `cargo run --example simulate`.

use ssaddr::sym::{Sym, SymTab};
use ssrt::{trace, Tracer, UnwindScope};

fn main() {
    let mut tracer = Tracer::new();
    tracer.proc_mut().register_table(SymTab::new(
        "/opt/demo/bin/app",
        0,
        vec![
            Sym::new(0x1000, Some("main".into())),
            Sym::new(0x1200, Some("parse_config(char const*)".into())),
            Sym::new(0x1400, Some("load_file(char const*)".into())),
        ],
    ));

    // What the compiler-injected hooks would report for main -> parse_config -> load_file.
    tracer.enter(0x1000, 0xdead_beef);
    tracer.enter(0x1200, 0x1040);
    tracer.enter(0x1400, 0x1240);

    let mut out = String::new();
    trace::header(&mut out);
    tracer.trace_current(&mut out);
    print!("{out}");

    // The same stack under an unwinding exception: exits are deferred as lag until the unwind
    // settles, so the fault-time stack stays visible.
    tracer.enter(0x1000, 0xdead_beef);
    tracer.enter(0x1200, 0x1040);
    {
        let _uw = UnwindScope::new();
        tracer.exit(0x1200, 0x1040);
        tracer.exit(0x1000, 0xdead_beef);
    }
    let mut out = String::new();
    tracer.trace_current(&mut out);
    print!("{out}");
}
