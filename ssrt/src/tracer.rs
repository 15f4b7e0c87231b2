//! The runtime singleton, its lifecycle, and the entry/exit interceptor.

use crate::{
    filter::{CompileError, Filter, FilterMode},
    log,
    plugin::{self, HookFn, Plugin, PluginKind},
    process::{Process, RegistryError},
    thread::{Thread, ThreadId},
    trace,
};
use libc::c_void;
use parking_lot::ReentrantMutex;
use std::{cell::RefCell, env, panic, path::Path, sync::LazyLock};
use thiserror::Error;

/// The DSO-selection environment variable: colon-separated regular expressions matched against
/// each shared object's absolute path. Absent means instrument every DSO; present-but-empty
/// means none.
pub const LIBS_ENV: &str = "SSRT_LIBS";

/// Errors surfaced by the runtime's registration API.
#[derive(Debug, Error)]
pub enum RtError {
    #[error("instrumentation runtime not initialized")]
    NotInitialized,
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Link(#[from] crate::plugin::LinkError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The trace engine: the process registry plus the interceptor filters.
///
/// One process-wide instance lives behind [init]/[shutdown]; independent instances can be built
/// for embedding and testing.
pub struct Tracer {
    proc: Process,
    filters: Vec<Filter>,
    print_unresolved: bool,
}

// The runtime singleton. The mutex is recursive because an instrumented destructor running
// inside a trace-formatting path re-enters the interceptor; RefCell borrows are confined to
// single operations and never held across user callbacks or the bridge.
static TRACER: LazyLock<ReentrantMutex<RefCell<Option<Tracer>>>> =
    LazyLock::new(|| ReentrantMutex::new(RefCell::new(None)));

// The plugin list has its own lock so callbacks never run under the runtime lock. Lock order is
// always plugin list first, runtime second, log sink last.
static PLUGINS: LazyLock<ReentrantMutex<RefCell<Vec<Plugin>>>> =
    LazyLock::new(|| ReentrantMutex::new(RefCell::new(Vec::new())));

impl Tracer {
    /// An empty tracer with no modules loaded. [Tracer::attach] builds the fully-loaded one.
    pub fn new() -> Self {
        Self {
            proc: Process::new(),
            filters: Vec::new(),
            print_unresolved: env::var("SSRT_UNRESOLVED").map(|v| v != "0").unwrap_or(true),
        }
    }

    /// Build a tracer and load the symbol tables of the main program and of every DSO selected
    /// by [LIBS_ENV]. Load failures are logged and the module skipped; they are never fatal.
    pub fn attach() -> Self {
        let mut tracer = Self::new();

        // The executable's own table, at load base 0.
        match ssaddr::obj::self_exe_path() {
            Ok(exe) => {
                if let Err(e) = tracer.proc.add_module(&exe, 0) {
                    log::error(&e.to_string());
                }
            }
            Err(e) => log::error(&format!("cannot resolve executable path: {e}")),
        }

        let selectors = libs_selectors();
        for obj in ssaddr::obj::OBJECT_CACHE.iter() {
            if obj.name().to_bytes().is_empty() {
                continue; // the main object, loaded above
            }
            let Ok(path) = obj.name().to_str() else {
                continue;
            };
            if !dso_selected(path, &selectors) {
                log::warn(&format!("filtered out '{path}'"));
                continue;
            }
            let Some(base) = obj.load_base() else {
                continue; // an object with no segments
            };
            if let Err(e) = tracer.proc.add_module(Path::new(path), base) {
                log::error(&e.to_string());
            }
        }

        tracer
    }

    /// True once modules and symbols are available; the interceptor stays dormant before that.
    fn ready(&self) -> bool {
        self.proc.module_count() > 0 && self.proc.symbol_count() > 0
    }

    pub fn proc(&self) -> &Process {
        &self.proc
    }

    pub fn proc_mut(&mut self) -> &mut Process {
        &mut self.proc
    }

    /// Whether traces print `UNRESOLVED` lines for frames no table can name.
    pub fn set_print_unresolved(&mut self, on: bool) {
        self.print_unresolved = on;
    }

    /// Register a filter. The interceptor applies filters in registration order; a match
    /// excludes the call from recording.
    pub fn add_filter(
        &mut self,
        pattern: &str,
        icase: bool,
        mode: FilterMode,
    ) -> Result<(), CompileError> {
        self.filters.push(Filter::new(pattern, icase, mode)?);
        Ok(())
    }

    /// Unregister the `i`th filter.
    pub fn remove_filter(&mut self, i: usize) -> Option<Filter> {
        (i < self.filters.len()).then(|| self.filters.remove(i))
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Apply the module filters to a path, in registration order, returning on the first match.
    pub fn apply_module_filters(&self, path: &str) -> bool {
        self.filters
            .iter()
            .filter(|f| f.mode() == FilterMode::Module)
            .any(|f| f.matches(path))
    }

    /// Apply the symbol filters to a demangled name, in registration order, returning on the
    /// first match.
    pub fn apply_symbol_filters(&self, name: &str) -> bool {
        self.filters
            .iter()
            .filter(|f| f.mode() == FilterMode::Symbol)
            .any(|f| f.matches(name))
    }

    /// True if recording of a call to `addr` is suppressed by a filter. Applied identically on
    /// both edges so a gated enter is never unbalanced by an ungated exit.
    fn filtered(&self, addr: u64) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        if let Some((path, _)) = self.proc.inverse_lookup(addr) {
            if let Some(path) = path.to_str() {
                if self.apply_module_filters(path) {
                    return true;
                }
            }
        }
        if let Some(name) = self.proc.lookup(addr) {
            if self.apply_symbol_filters(name) {
                return true;
            }
        }
        false
    }

    /// The locked-region half of the entry interceptor: gate on the filters, then record.
    pub fn enter(&mut self, this_fn: u64, call_site: u64) {
        if self.filtered(this_fn) {
            return;
        }
        self.proc.current_thread().on_enter(this_fn, call_site);
    }

    /// The locked-region half of the exit interceptor.
    pub fn exit(&mut self, this_fn: u64, _call_site: u64) {
        if self.filtered(this_fn) {
            return;
        }
        self.proc.current_thread().on_exit();
    }

    pub(crate) fn render(&mut self, id: ThreadId) -> Option<trace::Rendered> {
        trace::render(&mut self.proc, id, self.print_unresolved)
    }

    /// Trace an arbitrary thread into `dst`. Returns false when no such thread is registered.
    ///
    /// This method runs the addr2line bridge inline; the global [trace_thread] wrapper instead
    /// renders under the runtime lock and bridges after releasing it.
    pub fn trace_thread(&mut self, id: ThreadId, dst: &mut String) -> bool {
        match self.render(id) {
            Some(r) => {
                r.write(dst);
                true
            }
            None => false,
        }
    }

    /// Trace the calling thread, then discard its simulated stack: the trace documents the
    /// state at fault time and the thread continues from a clean slate.
    pub fn trace_current(&mut self, dst: &mut String) -> bool {
        let id = current_thread_id();
        let ok = self.trace_thread(id, dst);
        if let Some(t) = self.proc.thread_by_id_mut(id) {
            t.reset();
        }
        ok
    }

    /// Append the traces of every registered thread, `\r\n`-separated.
    pub fn dump(&mut self, dst: &mut String) {
        let ids: Vec<ThreadId> = self.proc.threads().iter().map(Thread::handle).collect();
        for (i, id) in ids.iter().enumerate() {
            self.trace_thread(*id, dst);
            if i + 1 < ids.len() {
                dst.push_str("\r\n");
            }
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

fn current_thread_id() -> ThreadId {
    (unsafe { libc::pthread_self() }) as ThreadId
}

/// Compiled [LIBS_ENV] selectors. `None` when the variable is absent (select everything);
/// otherwise a DSO is selected iff it matches at least one pattern.
fn libs_selectors() -> Option<Vec<regex::Regex>> {
    let val = env::var(LIBS_ENV).ok()?;
    let mut pats = Vec::new();
    for pat in val.split(':').filter(|p| !p.is_empty()) {
        match regex::Regex::new(pat) {
            Ok(re) => pats.push(re),
            Err(e) => log::warn(&format!("bad pattern in {LIBS_ENV}: {e}")),
        }
    }
    Some(pats)
}

fn dso_selected(path: &str, selectors: &Option<Vec<regex::Regex>>) -> bool {
    match selectors {
        None => true,
        Some(pats) => pats.iter().any(|re| re.is_match(path)),
    }
}

/// Initialize the runtime singleton: load the executable's symbols and those of every selected
/// DSO. Idempotent; later calls are no-ops.
pub fn init() {
    let guard = TRACER.lock();
    if guard.borrow().is_some() {
        return;
    }
    let tracer = Tracer::attach();
    *guard.borrow_mut() = Some(tracer);
    log::info(&format!("ssrt {} initialized", env!("CARGO_PKG_VERSION")));
}

/// Tear down the runtime and drop every registered plugin. Tolerates repeated calls and a
/// partially-torn-down process.
pub fn shutdown() {
    {
        let guard = TRACER.lock();
        *guard.borrow_mut() = None;
    }
    PLUGINS.lock().borrow_mut().clear();
    log::info(&format!("ssrt {} finalized", env!("CARGO_PKG_VERSION")));
}

/// True if [init] has completed and symbols are available to the interceptor.
pub fn initialized() -> bool {
    let guard = TRACER.lock();
    let slot = guard.borrow();
    slot.as_ref().map(Tracer::ready).unwrap_or(false)
}

/// Run `f` against the runtime, whatever its load state. `None` before [init] / after
/// [shutdown].
fn with_tracer<R>(f: impl FnOnce(&mut Tracer) -> R) -> Option<R> {
    let guard = TRACER.lock();
    let mut slot = guard.borrow_mut();
    slot.as_mut().map(f)
}

/// Run `f` against the runtime only once it is fully usable (the interceptor's gate).
fn with_ready<R>(f: impl FnOnce(&mut Tracer) -> R) -> Option<R> {
    let guard = TRACER.lock();
    let mut slot = guard.borrow_mut();
    match slot.as_mut() {
        Some(t) if t.ready() => Some(f(t)),
        _ => None,
    }
}

/// The function-entry interceptor, callable from any thread. Silently a no-op until the runtime
/// is initialized. A panic escaping the recording section terminates the process: a shadow
/// stack that diverges from reality is worse than none.
pub fn on_function_enter(this_fn: u64, call_site: u64) {
    if !initialized() {
        return;
    }
    run_plugins(this_fn, call_site, Edge::Begin);
    let recorded = panic::catch_unwind(|| {
        with_ready(|t| t.enter(this_fn, call_site));
    });
    if recorded.is_err() {
        log::error("panic in the entry interceptor; terminating");
        std::process::exit(1);
    }
}

/// The function-exit interceptor; plugins fire in reverse registration order.
pub fn on_function_exit(this_fn: u64, call_site: u64) {
    if !initialized() {
        return;
    }
    run_plugins(this_fn, call_site, Edge::End);
    let recorded = panic::catch_unwind(|| {
        with_ready(|t| t.exit(this_fn, call_site));
    });
    if recorded.is_err() {
        log::error("panic in the exit interceptor; terminating");
        std::process::exit(1);
    }
}

#[derive(Copy, Clone)]
enum Edge {
    Begin,
    End,
}

fn run_plugins(this_fn: u64, call_site: u64, edge: Edge) {
    dispatch_plugins(&PLUGINS, this_fn, call_site, edge);
}

/// Dispatch plugin callbacks under the plugin-list lock only. Begin callbacks run in
/// registration order, end callbacks in reverse. The list is re-probed per slot, so a callback
/// may itself (un)register plugins without deadlocking.
fn dispatch_plugins(
    list: &ReentrantMutex<RefCell<Vec<Plugin>>>,
    this_fn: u64,
    call_site: u64,
    edge: Edge,
) {
    let guard = list.lock();
    let count = guard.borrow().len();

    let mut dispatch = |i: usize| {
        let cb = {
            let plugins = guard.borrow();
            plugins.get(i).map(|p| match edge {
                Edge::Begin => p.begin_fn(),
                Edge::End => p.end_fn(),
            })
        };
        if let Some(cb) = cb {
            let what = match edge {
                Edge::Begin => "begin",
                Edge::End => "end",
            };
            plugin::invoke(cb, this_fn, call_site, what);
        }
    };

    match edge {
        Edge::Begin => (0..count).for_each(&mut dispatch),
        Edge::End => (0..count).rev().for_each(&mut dispatch),
    }
}

/// Register a filter with the runtime singleton.
pub fn add_filter(pattern: &str, icase: bool, mode: FilterMode) -> Result<(), RtError> {
    with_tracer(|t| t.add_filter(pattern, icase, mode))
        .ok_or(RtError::NotInitialized)?
        .map_err(RtError::from)
}

/// Unregister the runtime singleton's `i`th filter.
pub fn remove_filter(i: usize) {
    with_tracer(|t| t.remove_filter(i));
}

pub fn filter_count() -> usize {
    with_tracer(|t| t.filter_count()).unwrap_or(0)
}

/// Register an in-process plugin.
pub fn add_plugin(begin: HookFn, end: HookFn) {
    PLUGINS.lock().borrow_mut().push(Plugin::new_inline(begin, end));
}

/// Load an external plugin module and register it.
pub fn add_plugin_module(path: &Path, scope: Option<&str>) -> Result<(), RtError> {
    let p = Plugin::from_module(path, scope)?;
    PLUGINS.lock().borrow_mut().push(p);
    Ok(())
}

pub fn plugin_count() -> usize {
    PLUGINS.lock().borrow().len()
}

/// True if a plugin module from `path` is registered.
pub fn has_plugin(path: &Path) -> bool {
    PLUGINS
        .lock()
        .borrow()
        .iter()
        .any(|p| p.path() == Some(path))
}

/// Unregister the plugin loaded from `path`, if any.
pub fn remove_plugin(path: &Path) {
    let guard = PLUGINS.lock();
    let mut plugins = guard.borrow_mut();
    if let Some(i) = plugins.iter().position(|p| p.path() == Some(path)) {
        plugins.remove(i);
    }
}

/// Unregister the `i`th plugin.
pub fn remove_plugin_at(i: usize) {
    let guard = PLUGINS.lock();
    let mut plugins = guard.borrow_mut();
    if i < plugins.len() {
        plugins.remove(i);
    }
}

/// Unregister every plugin of the given kind.
pub fn remove_all_plugins(kind: PluginKind) {
    let guard = PLUGINS.lock();
    guard.borrow_mut().retain(|p| match kind {
        PluginKind::All => false,
        PluginKind::Module => p.is_inline(),
        PluginKind::Inline => !p.is_inline(),
    });
}

/// Trace the calling thread into `dst` and reset its simulated stack. Returns false when the
/// runtime is down or the thread has no record.
pub fn trace_current(dst: &mut String) -> bool {
    let id = current_thread_id();
    // Render under the lock; run the addr2line bridge outside it.
    let Some(rendered) = with_tracer(|t| t.render(id)).flatten() else {
        return false;
    };
    rendered.write(dst);
    with_tracer(|t| {
        if let Some(thr) = t.proc_mut().thread_by_id_mut(id) {
            thr.reset();
        }
    });
    true
}

/// Trace the thread with handle `id` into `dst`, leaving its stack untouched.
pub fn trace_thread(id: ThreadId, dst: &mut String) -> bool {
    let Some(rendered) = with_tracer(|t| t.render(id)).flatten() else {
        return false;
    };
    rendered.write(dst);
    true
}

/// Append the traces of every registered thread, `\r\n`-separated.
pub fn dump(dst: &mut String) {
    let Some(ids) = with_tracer(|t| {
        t.proc()
            .threads()
            .iter()
            .map(Thread::handle)
            .collect::<Vec<_>>()
    }) else {
        return;
    };
    for (i, id) in ids.iter().enumerate() {
        trace_thread(*id, dst);
        if i + 1 < ids.len() {
            dst.push_str("\r\n");
        }
    }
}

/// Collapse the calling thread's unwind lag without producing a trace.
pub fn unwind_current() {
    with_tracer(|t| {
        let id = current_thread_id();
        if let Some(thr) = t.proc_mut().thread_by_id_mut(id) {
            thr.unwind();
        }
    });
}

/// Sweep zombie thread records.
pub fn cleanup_zombies() {
    with_tracer(|t| t.proc_mut().cleanup_zombies());
}

/// Name (or unname) the calling thread's record.
pub fn set_thread_name(name: Option<&str>) {
    with_tracer(|t| t.proc_mut().current_thread().set_name(name));
}

/// Entry-point signature for [spawn_thread], matching `pthread_create`.
pub type ThreadMain = extern "C" fn(*mut c_void) -> *mut c_void;

struct SpawnTarget {
    entry: ThreadMain,
    arg: *mut c_void,
}

extern "C" fn spawn_trampoline(raw: *mut c_void) -> *mut c_void {
    let tgt = unsafe { Box::from_raw(raw as *mut SpawnTarget) };
    let ret = (tgt.entry)(tgt.arg);
    // Automatic registry cleanup on normal thread exit.
    with_tracer(|t| t.proc_mut().cleanup_thread(current_thread_id()));
    ret
}

/// Spawn an instrumented, named thread and register its record eagerly.
///
/// The trampoline removes the record when the entry function returns; a very short-lived thread
/// can exit before the registration below, in which case the record lingers until [join_thread]
/// or the zombie sweeper claims it.
pub fn spawn_thread(name: &str, entry: ThreadMain, arg: *mut c_void) -> Result<ThreadId, RtError> {
    let raw = Box::into_raw(Box::new(SpawnTarget { entry, arg })) as *mut c_void;
    let mut handle: libc::pthread_t = 0;
    let rc =
        unsafe { libc::pthread_create(&mut handle, std::ptr::null(), spawn_trampoline, raw) };
    if rc != 0 {
        // Reclaim the target so it is not leaked.
        drop(unsafe { Box::from_raw(raw as *mut SpawnTarget) });
        return Err(RegistryError::SpawnFailed {
            name: name.to_owned(),
            errno: rc,
        }
        .into());
    }

    let id = handle as ThreadId;
    with_tracer(|t| t.proc_mut().register_thread(Thread::with_id(id, Some(name))))
        .ok_or(RtError::NotInitialized)??;
    Ok(id)
}

/// Cancel a thread and drop its record. Cancellation failures are silently ignored.
pub fn cancel_thread(id: ThreadId) {
    unsafe { libc::pthread_cancel(id as libc::pthread_t) };
    with_tracer(|t| t.proc_mut().cleanup_thread(id));
}

/// Join a thread and drop its record.
pub fn join_thread(id: ThreadId) -> Result<(), RtError> {
    let rc = unsafe { libc::pthread_join(id as libc::pthread_t, std::ptr::null_mut()) };
    with_tracer(|t| t.proc_mut().cleanup_thread(id));
    if rc != 0 {
        return Err(RegistryError::JoinFailed { id, errno: rc }.into());
    }
    Ok(())
}
