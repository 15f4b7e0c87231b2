//! This crate exports the instrumentation runtime via the C ABI.
//!
//! We use a dedicated crate for exporting to C, as you quickly get into linkage trouble if you
//! try and mix Rust dynamic libraries (namely you can get duplicate copies of dependencies).
//! The sane solution is to have only one `cdylib` crate in the workspace (this crate) and all
//! other crates are regular `rlibs`.
//!
//! Programs compiled with `-finstrument-functions` pick up the two `__cyg_profile_func_*` hooks
//! below when linked (or `LD_PRELOAD`ed) against this library; the `.init_array`/`.fini_array`
//! entries attach and detach the runtime around `main`.

use ssrt::{FilterMode, PluginKind, ThreadId};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

/// Called by instrumented code at the beginning of every function.
#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(this_fn: *mut c_void, call_site: *mut c_void) {
    ssrt::on_function_enter(this_fn as u64, call_site as u64);
}

/// Called by instrumented code at the end of every function, including frames torn down by an
/// unwinder.
#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(this_fn: *mut c_void, call_site: *mut c_void) {
    ssrt::on_function_exit(this_fn as u64, call_site as u64);
}

/// Explicit runtime initialisation for hosts that drive the lifecycle themselves. Idempotent.
#[no_mangle]
pub extern "C" fn ssrt_init() {
    ssrt::init();
}

/// Explicit runtime teardown. Tolerates repeated calls.
#[no_mangle]
pub extern "C" fn ssrt_shutdown() {
    ssrt::shutdown();
}

/// Trace the calling thread and reset its simulated stack. Returns a malloc-backed string the
/// caller owns (release with `free`), or null when the runtime is down.
#[no_mangle]
pub extern "C" fn ssrt_trace_current() -> *mut c_char {
    let mut buf = String::new();
    if !ssrt::trace_current(&mut buf) {
        return std::ptr::null_mut();
    }
    to_malloc(buf)
}

/// Trace one thread by handle, leaving its stack untouched. Same ownership contract as
/// [ssrt_trace_current].
#[no_mangle]
pub extern "C" fn ssrt_trace_thread(id: u64) -> *mut c_char {
    let mut buf = String::new();
    if !ssrt::trace_thread(id as ThreadId, &mut buf) {
        return std::ptr::null_mut();
    }
    to_malloc(buf)
}

/// Write the identification header and the traces of every registered thread to stderr.
#[no_mangle]
pub extern "C" fn ssrt_dump_stderr() {
    let mut buf = String::new();
    ssrt::trace::header(&mut buf);
    ssrt::dump(&mut buf);
    eprint!("{buf}");
}

/// Collapse the calling thread's unwind lag without producing a trace.
#[no_mangle]
pub extern "C" fn ssrt_unwind() {
    ssrt::unwind_current();
}

/// Drop the thread records whose threads have finished.
#[no_mangle]
pub extern "C" fn ssrt_cleanup_zombies() {
    ssrt::cleanup_zombies();
}

/// Name the calling thread's record; a null `name` unsets it.
///
/// # Safety
///
/// `name`, when non-null, must point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ssrt_set_thread_name(name: *const c_char) {
    if name.is_null() {
        ssrt::set_thread_name(None);
    } else if let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() {
        ssrt::set_thread_name(Some(name));
    }
}

/// Register a filter. `mode` 0 gates on demangled symbol names, any other value on module
/// paths; a non-zero `icase` ignores case. Returns 0 on success, -1 on failure.
///
/// # Safety
///
/// `pattern` must point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ssrt_add_filter(
    pattern: *const c_char,
    icase: c_int,
    mode: c_int,
) -> c_int {
    if pattern.is_null() {
        return -1;
    }
    let Ok(pattern) = (unsafe { CStr::from_ptr(pattern) }).to_str() else {
        return -1;
    };
    let mode = if mode == 0 {
        FilterMode::Symbol
    } else {
        FilterMode::Module
    };
    match ssrt::add_filter(pattern, icase != 0, mode) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Load a plugin module and register it. `scope` may be null for C-linkage `mod_enter` /
/// `mod_exit` exports. Returns 0 on success, -1 on failure.
///
/// # Safety
///
/// `path` must point to a NUL-terminated string; `scope`, when non-null, likewise.
#[no_mangle]
pub unsafe extern "C" fn ssrt_add_plugin(path: *const c_char, scope: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    let Ok(path) = (unsafe { CStr::from_ptr(path) }).to_str() else {
        return -1;
    };
    let scope = if scope.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(scope) }.to_str() {
            Ok(s) => Some(s),
            Err(_) => return -1,
        }
    };
    match ssrt::add_plugin_module(Path::new(path), scope) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Unregister plugins: 0 removes every plugin, 1 only module plugins, 2 only inline ones.
#[no_mangle]
pub extern "C" fn ssrt_remove_all_plugins(kind: c_int) {
    let kind = match kind {
        1 => PluginKind::Module,
        2 => PluginKind::Inline,
        _ => PluginKind::All,
    };
    ssrt::remove_all_plugins(kind);
}

// Hand a Rust string over in malloc memory so C callers can free() it.
fn to_malloc(buf: String) -> *mut c_char {
    let Ok(s) = CString::new(buf) else {
        return std::ptr::null_mut();
    };
    let bytes = s.as_bytes_with_nul();
    let out = unsafe { libc::malloc(bytes.len()) } as *mut c_char;
    if out.is_null() {
        return out;
    }
    unsafe {
        out.copy_from(bytes.as_ptr() as *const c_char, bytes.len());
    }
    out
}

// Attach/detach around `main` for plain link-time or LD_PRELOAD use.

extern "C" fn attach() {
    ssrt::init();
}

extern "C" fn detach() {
    ssrt::shutdown();
}

#[used]
#[link_section = ".init_array"]
static SSRT_ATTACH: extern "C" fn() = attach;

#[used]
#[link_section = ".fini_array"]
static SSRT_DETACH: extern "C" fn() = detach;

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    // The whole C surface in one sequential test: it exercises the process-wide singleton, so
    // it must not be split across test threads.
    #[test]
    fn c_surface_round_trip() {
        ssrt_init(); // idempotent with the .init_array attach
        assert!(ssrt::initialized());

        __cyg_profile_func_enter(0x1000 as *mut c_void, 0x2000 as *mut c_void);

        let raw = ssrt_trace_current();
        assert!(!raw.is_null());
        let text = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_owned();
        unsafe { libc::free(raw as *mut c_void) };

        assert!(text.starts_with("at '"));
        assert!(text.contains(" thread (0x"));
        assert!(text.ends_with("}\r\n"));

        // The current-thread variant resets the stack, so a fresh trace is just the braces.
        let raw = ssrt_trace_current();
        assert!(!raw.is_null());
        let text = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_owned();
        unsafe { libc::free(raw as *mut c_void) };
        assert!(text.ends_with("{\r\n}\r\n"));

        // Unknown thread handles yield no trace.
        assert!(ssrt_trace_thread(0xdead_beef).is_null());

        // Naming the calling thread shows up in its trace header.
        unsafe { ssrt_set_thread_name(c"reactor".as_ptr()) };
        let raw = ssrt_trace_current();
        assert!(!raw.is_null());
        let text = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_owned();
        unsafe { libc::free(raw as *mut c_void) };
        assert!(text.starts_with("at 'reactor' thread (0x"));

        // Filter registration through the C surface.
        assert_eq!(unsafe { ssrt_add_filter(c"^std::".as_ptr(), 0, 0) }, 0);
        assert_eq!(unsafe { ssrt_add_filter(std::ptr::null(), 0, 0) }, -1);
        assert_eq!(unsafe { ssrt_add_filter(c"(unterminated".as_ptr(), 0, 0) }, -1);

        // Plugin loading failures surface as -1.
        assert_eq!(
            unsafe { ssrt_add_plugin(c"/nonexistent/plugin.so".as_ptr(), std::ptr::null()) },
            -1
        );
        ssrt_remove_all_plugins(0);

        ssrt_shutdown();
        assert!(!ssrt::initialized());
        ssrt_shutdown(); // tolerated

        ssrt_init(); // and the runtime can come back
        assert!(ssrt::initialized());
    }
}
