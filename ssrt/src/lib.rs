//! The core of the shadow-stack instrumentation runtime.
//!
//! A host compiler building with `-finstrument-functions` injects a pair of callbacks at every
//! function entry and exit. This crate records those events into a per-thread *simulated call
//! stack*, from which a readable stack trace can be produced at any moment, including inside
//! destructors, signal handlers or exception paths where the native unwinder is unavailable or
//! unsafe.
//! Addresses are resolved against the function symbol tables of the main program and selected
//! shared objects (see [ssaddr]), optionally enriched with `file:line` information obtained from
//! the external `addr2line` tool.
//!
//! The C-ABI surface (the `__cyg_profile_func_*` hooks themselves) lives in the `sscapi` crate;
//! everything here is callable from Rust.

mod bridge;
pub mod filter;
pub mod frame;
mod log;
pub mod plugin;
pub mod process;
pub mod thread;
pub mod trace;
pub mod tracer;
pub mod unwind;

pub use filter::{CompileError, Filter, FilterMode};
pub use frame::Frame;
pub use plugin::{HookFn, LinkError, Plugin, PluginKind};
pub use process::{Process, RegistryError};
pub use thread::{Thread, ThreadId, ThreadStatus};
pub use tracer::{
    add_filter, add_plugin, add_plugin_module, cancel_thread, cleanup_zombies, dump,
    filter_count, has_plugin, init, initialized, join_thread, on_function_enter,
    on_function_exit, plugin_count, remove_all_plugins, remove_filter, remove_plugin,
    remove_plugin_at, set_thread_name, shutdown, spawn_thread, trace_current, trace_thread,
    unwind_current, RtError, ThreadMain, Tracer, LIBS_ENV,
};
pub use unwind::UnwindScope;
